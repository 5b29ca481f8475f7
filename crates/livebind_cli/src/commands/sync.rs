//! Sync command implementation.

use std::path::Path;
use std::sync::Arc;

use livebind_core::{Store, WriteMethod, STATUS_SELECTOR};
use livebind_sync_engine::{start_sync, MemoryRemote};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::config::{parse_push, read_json, BindingFile, CliResult};

/// Options of the sync command.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// `PATH=JSON` values pushed after the initial load.
    pub pushes: Vec<String>,
    /// User id signed in before syncing.
    pub user: Option<String>,
    /// Include the session status in the output.
    pub status: bool,
}

/// Runs the sync command and returns the mirrored stores.
pub fn run(bindings: &Path, data: &Path, options: &SyncOptions) -> CliResult<Map<String, Value>> {
    let file = BindingFile::load(bindings)?;
    let fixture: Value = read_json(data)?;
    let pushes = options
        .pushes
        .iter()
        .map(|arg| parse_push(arg))
        .collect::<CliResult<Vec<_>>>()?;

    let remote = Arc::new(MemoryRemote::online(fixture));
    if let Some(uid) = &options.user {
        remote.set_auth(Some(json!({ "uid": uid })));
    }

    let store = Arc::new(Store::new(()));
    let session = start_sync(store.clone(), remote.clone(), file.to_config()?)?;
    let delivered = remote.flush();
    info!(delivered, bindings = file.bindings.len(), "initial load complete");
    if !session.initialized().is_ready() {
        warn!("session did not finish its initial load");
    }

    for (path, value) in pushes {
        let write = session.write(WriteMethod::Push, &path, value);
        remote.flush();
        let errors = store.sync_state().writes.errors_for(write.path()).to_vec();
        for error in errors {
            warn!(path = %write.path(), %error, "push failed");
        }
    }

    let mut names = file.names();
    if options.status {
        names.push(STATUS_SELECTOR);
    }
    let output = store.sync_state().select(&names);
    session.unsubscribe();
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fixture_dir(bindings: &str, data: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("bindings.json"), bindings).unwrap();
        fs::write(dir.path().join("data.json"), data).unwrap();
        dir
    }

    fn run_in(dir: &TempDir, options: &SyncOptions) -> CliResult<Map<String, Value>> {
        run(
            &dir.path().join("bindings.json"),
            &dir.path().join("data.json"),
            options,
        )
    }

    #[test]
    fn sync_prints_mirrored_posts_with_push() {
        let dir = fixture_dir(
            r#"{"bindings": {"posts": {"path": "posts", "type": "array"}}}"#,
            r#"{"posts": {"0": {"title": "First"}, "1": {"title": "Second"}}}"#,
        );
        let options = SyncOptions {
            pushes: vec![r#"posts={"title":"Third"}"#.to_string()],
            ..SyncOptions::default()
        };
        let output = run_in(&dir, &options).unwrap();

        let records = output["posts"]["value"].as_array().unwrap();
        assert_eq!(output["posts"]["key"], json!("posts"));
        assert_eq!(records.len(), 3);
        assert_eq!(records[0], json!({"key": "0", "value": {"title": "First"}}));
        assert_eq!(records[2]["value"], json!({"title": "Third"}));
        assert!(!output.contains_key(STATUS_SELECTOR));
    }

    #[test]
    fn user_placeholder_follows_signed_in_user() {
        let dir = fixture_dir(
            r#"{"url": "memory://demo", "bindings": {"inbox": {"path": "inbox/{uid}"}}}"#,
            r#"{"inbox": {"u7": {"unread": 2}}}"#,
        );
        let signed_out = run_in(&dir, &SyncOptions::default()).unwrap();
        assert_eq!(signed_out["inbox"], Value::Null);

        let options = SyncOptions {
            user: Some("u7".into()),
            status: true,
            ..SyncOptions::default()
        };
        let output = run_in(&dir, &options).unwrap();
        assert_eq!(output["inbox"], json!({"key": "u7", "value": {"unread": 2}}));
        assert_eq!(output[STATUS_SELECTOR]["authenticatedUser"], json!({"uid": "u7"}));
        assert_eq!(output[STATUS_SELECTOR]["initialFetchDone"], json!(true));
    }

    #[test]
    fn populate_template_joins_records() {
        let dir = fixture_dir(
            r#"{"bindings": {"reviews": {"path": "userReviews/2", "type": "array", "populate": "reviews/{key}"}}}"#,
            r#"{
                "reviews": {"a": {"rating": 5}, "b": {"rating": 1}, "d": {"rating": 4}},
                "userReviews": {"2": {"a": true, "d": true}}
            }"#,
        );
        let output = run_in(&dir, &SyncOptions::default()).unwrap();
        assert_eq!(
            output["reviews"]["value"],
            json!([
                {"key": "a", "value": {"rating": 5}},
                {"key": "d", "value": {"rating": 4}}
            ])
        );
    }

    #[test]
    fn bad_push_fails_before_syncing() {
        let dir = fixture_dir(r#"{"bindings": {}}"#, "{}");
        let options = SyncOptions {
            pushes: vec!["posts".to_string()],
            ..SyncOptions::default()
        };
        assert!(run_in(&dir, &options).is_err());
    }
}
