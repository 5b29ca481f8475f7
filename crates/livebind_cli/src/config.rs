//! Binding files.
//!
//! A binding file declares the session URL and the bindings to mirror:
//!
//! ```json
//! {
//!   "url": "memory://demo",
//!   "bindings": {
//!     "posts": { "path": "posts", "type": "array", "query": { "limitToLast": 10 } },
//!     "inbox": { "path": "inbox/{uid}", "type": "object" },
//!     "reviews": { "path": "userReviews/2", "type": "array", "populate": "reviews/{key}" }
//!   }
//! }
//! ```
//!
//! `{uid}` in a path is replaced by the signed-in user's id; the binding has
//! no path while nobody is signed in. `{key}` in a populate template is
//! replaced by each array child key.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use livebind_core::{QueryState, StoreState, Value};
use livebind_sync_engine::{BindError, Binding, BindingKind, SyncConfig};
use serde::Deserialize;
use thiserror::Error;

/// Placeholder for the signed-in user's id.
pub const UID_PLACEHOLDER: &str = "{uid}";

/// Placeholder for an array child key in populate templates.
pub const KEY_PLACEHOLDER: &str = "{key}";

const DEFAULT_URL: &str = "memory://local";

/// Errors raised by the CLI.
#[derive(Debug, Error)]
pub enum CliError {
    /// A file could not be read.
    #[error("failed to read {path:?}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A file is not valid JSON for its purpose.
    #[error("failed to parse {path:?}: {source}")]
    Json {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// A `--push` argument is malformed.
    #[error("invalid push {0:?}: expected PATH=JSON")]
    InvalidPush(String),

    /// The declarations were rejected.
    #[error(transparent)]
    Bind(#[from] BindError),
}

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;

/// Shape of a declared binding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KindSpec {
    /// Mirrored as a whole value.
    #[default]
    Object,
    /// Mirrored as ordered records.
    Array,
    /// Mirrored as a whole scalar.
    Primitive,
}

impl From<KindSpec> for BindingKind {
    fn from(kind: KindSpec) -> Self {
        match kind {
            KindSpec::Object => BindingKind::Object,
            KindSpec::Array => BindingKind::Array,
            KindSpec::Primitive => BindingKind::Primitive,
        }
    }
}

/// One declared binding.
#[derive(Debug, Clone, Deserialize)]
pub struct BindingSpec {
    /// Remote path, possibly containing `{uid}`.
    pub path: String,
    /// Shape of the bound value.
    #[serde(rename = "type", default)]
    pub kind: KindSpec,
    /// Query clauses for array bindings.
    #[serde(default)]
    pub query: Option<QueryState>,
    /// Join template, containing `{key}`.
    #[serde(default)]
    pub populate: Option<String>,
}

/// Contents of a binding file.
#[derive(Debug, Clone, Deserialize)]
pub struct BindingFile {
    /// Remote URL recorded in the session.
    #[serde(default = "default_url")]
    pub url: String,
    /// Bindings by local name.
    pub bindings: BTreeMap<String, BindingSpec>,
}

fn default_url() -> String {
    DEFAULT_URL.to_string()
}

/// Reads a JSON file.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> CliResult<T> {
    let text = fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| CliError::Json {
        path: path.to_path_buf(),
        source,
    })
}

impl BindingFile {
    /// Loads a binding file.
    pub fn load(path: &Path) -> CliResult<Self> {
        read_json(path)
    }

    /// Local names in declaration order.
    pub fn names(&self) -> Vec<&str> {
        self.bindings.keys().map(String::as_str).collect()
    }

    /// Builds the session configuration.
    pub fn to_config(&self) -> CliResult<SyncConfig<()>> {
        let bindings = self
            .bindings
            .iter()
            .map(|(name, spec)| spec.to_binding(name))
            .collect::<Vec<_>>();
        let config = SyncConfig::new(&self.url)
            .with_bindings(bindings)
            .with_on_cancel(|error| tracing::warn!(%error, "listener cancelled"));
        config.validate()?;
        Ok(config)
    }
}

impl BindingSpec {
    fn to_binding(&self, name: &str) -> Binding<()> {
        let binding = if self.path.contains(UID_PLACEHOLDER) {
            let template = self.path.clone();
            Binding::derived(name, self.kind.into(), move |state: &StoreState<()>, _| {
                user_id(state).map(|uid| template.replace(UID_PLACEHOLDER, &uid))
            })
        } else {
            Binding::new(name, self.path.clone(), self.kind.into())
        };
        let binding = match &self.query {
            Some(query) => binding.with_static_query(query.clone()),
            None => binding,
        };
        match &self.populate {
            Some(template) => {
                let template = template.clone();
                binding.with_populate(move |key: &str| template.replace(KEY_PLACEHOLDER, key))
            }
            None => binding,
        }
    }
}

fn user_id(state: &StoreState<()>) -> Option<String> {
    let user = state.sync.authenticated_user.as_ref()?;
    match user.get("uid")? {
        Value::String(uid) => Some(uid.clone()),
        other => Some(other.to_string()),
    }
}

/// Splits a `PATH=JSON` argument.
pub fn parse_push(arg: &str) -> CliResult<(String, Value)> {
    let (path, json) = arg
        .split_once('=')
        .ok_or_else(|| CliError::InvalidPush(arg.to_string()))?;
    if path.trim().is_empty() {
        return Err(CliError::InvalidPush(arg.to_string()));
    }
    let value = serde_json::from_str(json).map_err(|_| CliError::InvalidPush(arg.to_string()))?;
    Ok((path.trim().to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn binding_file_parses() {
        let file = write_file(
            r#"{
                "bindings": {
                    "posts": {"path": "posts", "type": "array", "query": {"orderByKey": true, "limitToLast": 2}},
                    "inbox": {"path": "inbox/{uid}"},
                    "reviews": {"path": "userReviews/2", "type": "array", "populate": "reviews/{key}"}
                }
            }"#,
        );
        let parsed = BindingFile::load(file.path()).unwrap();
        assert_eq!(parsed.url, DEFAULT_URL);
        assert_eq!(parsed.names(), vec!["inbox", "posts", "reviews"]);
        assert_eq!(parsed.bindings["inbox"].kind, KindSpec::Object);
        let query = parsed.bindings["posts"].query.clone().unwrap();
        assert!(query.order_by_key);
        assert_eq!(query.limit_to_last, Some(2));

        let config = parsed.to_config().unwrap();
        let kinds: Vec<BindingKind> = config.bindings.iter().map(Binding::kind).collect();
        assert_eq!(kinds, vec![BindingKind::Object, BindingKind::Array, BindingKind::Array]);
        assert!(config.bindings[2].is_populated());
    }

    #[test]
    fn empty_path_is_rejected() {
        let file = write_file(r#"{"bindings": {"broken": {"path": " "}}}"#);
        let parsed = BindingFile::load(file.path()).unwrap();
        assert!(matches!(
            parsed.to_config(),
            Err(CliError::Bind(BindError::InvalidBinding { .. }))
        ));
    }

    #[test]
    fn malformed_json_reports_path() {
        let file = write_file("{ not json");
        let err = BindingFile::load(file.path()).unwrap_err();
        assert!(matches!(err, CliError::Json { .. }));
    }

    #[test]
    fn missing_file_reports_io() {
        let dir = tempfile::tempdir().unwrap();
        let err = BindingFile::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, CliError::Io { .. }));
    }

    #[test]
    fn push_arguments() {
        assert_eq!(
            parse_push(r#"posts={"title":"Third"}"#).unwrap(),
            ("posts".to_string(), json!({"title": "Third"}))
        );
        assert_eq!(parse_push("a/b=1").unwrap(), ("a/b".to_string(), json!(1)));
        assert!(matches!(parse_push("posts"), Err(CliError::InvalidPush(_))));
        assert!(matches!(parse_push("=1"), Err(CliError::InvalidPush(_))));
        assert!(matches!(parse_push("posts={"), Err(CliError::InvalidPush(_))));
    }
}
