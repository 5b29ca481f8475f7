//! Test fixtures and session helpers.
//!
//! [`Harness`] owns an in-memory remote, a store and a running session so a
//! test only declares data and bindings, then calls [`Harness::settle`] to
//! deliver everything the remote has queued.

use std::sync::Arc;

use livebind_core::{Record, Store, StoreState, SyncState};
use livebind_sync_engine::{start_sync, Binding, BindingKind, MemoryRemote, SyncConfig, SyncSession};
use serde_json::{json, Value};

/// URL recorded by harness sessions.
pub const TEST_URL: &str = "memory://livebind-test";

/// Application state used by the fixtures.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestApp {
    /// Free-form counter; bumping it forces a re-resolution.
    pub counter: u32,
    /// Identifier used by derived paths.
    pub user_id: Option<String>,
}

/// A running session against an in-memory remote.
pub struct Harness {
    /// The fake remote.
    pub remote: Arc<MemoryRemote>,
    /// The session's store.
    pub store: Arc<Store<TestApp>>,
    /// The session.
    pub session: SyncSession<TestApp>,
}

impl Harness {
    /// Starts a session over `data` with the given bindings.
    pub fn start(data: Value, bindings: Vec<Binding<TestApp>>) -> Self {
        Self::with_config(data, SyncConfig::new(TEST_URL).with_bindings(bindings))
    }

    /// Starts a session over `data` with a prepared configuration.
    pub fn with_config(data: Value, config: SyncConfig<TestApp>) -> Self {
        Self::with_remote(Arc::new(MemoryRemote::online(data)), TestApp::default(), config)
    }

    /// Starts a session over an existing remote.
    pub fn with_remote(remote: Arc<MemoryRemote>, app: TestApp, config: SyncConfig<TestApp>) -> Self {
        let store = Arc::new(Store::new(app));
        let session = start_sync(store.clone(), remote.clone(), config)
            .expect("Failed to start sync session");
        Self {
            remote,
            store,
            session,
        }
    }

    /// Delivers every queued notification. Returns the number delivered.
    pub fn settle(&self) -> usize {
        self.remote.flush()
    }

    /// Current sync state.
    pub fn sync(&self) -> SyncState {
        self.store.sync_state()
    }

    /// Records mirrored by an array binding; empty if not loaded.
    pub fn records(&self, name: &str) -> Vec<Record> {
        self.sync()
            .records(name)
            .map(<[Record]>::to_vec)
            .unwrap_or_default()
    }

    /// Keys mirrored by an array binding, in order.
    pub fn keys(&self, name: &str) -> Vec<String> {
        self.records(name).into_iter().map(|record| record.key).collect()
    }

    /// `{key, value}` rendering of a slice, or `null`.
    pub fn slice_json(&self, name: &str) -> Value {
        self.sync()
            .slice(name)
            .map(|slice| slice.to_json())
            .unwrap_or(Value::Null)
    }

    /// Sets the identifier used by derived paths.
    pub fn set_user(&self, user_id: Option<&str>) {
        let user_id = user_id.map(str::to_string);
        self.store.update_app(move |app| app.user_id = user_id);
    }

    /// Bumps the counter.
    pub fn increment_counter(&self) {
        self.store.update_app(|app| app.counter += 1);
    }
}

/// Two posts keyed `0` and `1`.
pub fn posts_fixture() -> Value {
    json!({
        "posts": {
            "0": {"title": "First"},
            "1": {"title": "Second"}
        }
    })
}

/// Reviews and the per-user index pointing at them.
pub fn reviews_fixture() -> Value {
    json!({
        "reviews": {
            "a": {"rating": 5, "text": "Great"},
            "b": {"rating": 1, "text": "Bad"},
            "c": {"rating": 3, "text": "Fine"},
            "d": {"rating": 4, "text": "Good"},
            "e": {"rating": 2, "text": "Meh"},
            "f": {"rating": 5, "text": "Superb"}
        },
        "userReviews": {
            "1": {"b": true, "c": true},
            "2": {"a": true, "d": true, "f": true}
        }
    })
}

/// Profiles for two users.
pub fn users_fixture() -> Value {
    json!({
        "users": {
            "u1": {"name": "Ada", "age": 36},
            "u2": {"name": "Grace", "age": 45}
        },
        "settings": {"theme": "dark"},
        "counter": 7
    })
}

/// Array binding joining `userReviews/{user}` entries with `reviews/{key}`.
pub fn reviews_binding(user: &str) -> Binding<TestApp> {
    Binding::array("reviews", format!("userReviews/{user}"))
        .with_populate(|key: &str| format!("reviews/{key}"))
}

/// Object binding following [`TestApp::user_id`].
pub fn profile_binding() -> Binding<TestApp> {
    Binding::derived("profile", BindingKind::Object, |state: &StoreState<TestApp>, _| {
        state.app.user_id.as_ref().map(|uid| format!("users/{uid}"))
    })
}
