//! Sync sessions.
//!
//! [`start_sync`] wires a [`Store`] to a [`RemoteClient`]: it declares the
//! bindings, subscribes what currently resolves, re-resolves after every
//! state change, and reports connectivity and auth changes. The returned
//! [`SyncSession`] is the only handle needed to tear everything down.

use std::collections::BTreeMap;
use std::sync::Arc;

use livebind_core::{EventSink, Store, StoreState, SubscriberId, SyncEvent, Value, WriteMethod};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::auth::{AuthFlows, AuthProvider};
use crate::completion::{CompletionTracker, Initialized};
use crate::config::SyncConfig;
use crate::error::BindResult;
use crate::manager::SubscriptionManager;
use crate::populate::PopulateTracker;
use crate::remote::{EventKind, ListenerHandle, RemoteClient};
use crate::subscription::SubscriptionPhase;
use crate::write::{PendingWrite, Writer};

#[derive(Default)]
struct SessionHandles {
    subscriber: Option<SubscriberId>,
    connectivity: Option<ListenerHandle>,
    auth: Option<ListenerHandle>,
    tracker: Option<Arc<CompletionTracker>>,
}

/// A running sync session.
pub struct SyncSession<S>
where
    S: Clone + Send + Sync + 'static,
{
    store: Arc<Store<S>>,
    remote: Arc<dyn RemoteClient>,
    manager: Arc<SubscriptionManager<S>>,
    writer: Writer,
    initialized: Initialized,
    handles: Mutex<SessionHandles>,
}

/// Starts syncing `store` with `remote`.
///
/// Configuration errors are returned before anything is dispatched or
/// subscribed.
pub fn start_sync<S>(
    store: Arc<Store<S>>,
    remote: Arc<dyn RemoteClient>,
    config: SyncConfig<S>,
) -> BindResult<SyncSession<S>>
where
    S: Clone + Send + Sync + 'static,
{
    config.validate()?;
    let names = config.binding_names();
    let SyncConfig {
        url,
        bindings,
        on_cancel,
        on_auth,
        path_params,
    } = config;
    info!(url = %url, bindings = names.len(), "starting sync session");

    let sink: Arc<dyn EventSink> = store.clone();
    sink.dispatch(SyncEvent::ConfigUpdated { url });
    sink.dispatch(SyncEvent::BindingsDeclared { names });

    let manager = Arc::new(SubscriptionManager::new(
        bindings,
        path_params,
        Arc::clone(&remote),
        Arc::clone(&sink),
        on_cancel,
    ));
    manager.sync(&store.state());

    let (tracker, initialized) = CompletionTracker::new();
    let tracker = Arc::new(tracker);
    let subscriber = {
        let manager = Arc::downgrade(&manager);
        let tracker = Arc::clone(&tracker);
        store.subscribe(move |state: &StoreState<S>| {
            if let Some(manager) = manager.upgrade() {
                manager.sync(state);
            }
            tracker.observe(&state.sync);
        })
    };

    let connectivity = {
        let sink = Arc::clone(&sink);
        remote.observe_connectivity(Arc::new(move |connected: bool| {
            debug!(connected, "connectivity changed");
            if connected {
                sink.dispatch(SyncEvent::Connected);
            }
        }))
    };

    let auth = {
        let sink = Arc::clone(&sink);
        remote.observe_auth(Arc::new(move |user: Option<Value>| {
            match &user {
                Some(user) => sink.dispatch(SyncEvent::UserAuthenticated(user.clone())),
                None => sink.dispatch(SyncEvent::UserUnauthenticated),
            }
            if let Some(hook) = &on_auth {
                hook(user.as_ref());
            }
        }))
    };

    if manager.resolved().is_empty() {
        sink.dispatch(SyncEvent::InitialFetchDone);
    }
    tracker.observe(&store.sync_state());

    let writer = Writer::new(Arc::clone(&remote), sink);
    Ok(SyncSession {
        store,
        remote,
        manager,
        writer,
        initialized,
        handles: Mutex::new(SessionHandles {
            subscriber: Some(subscriber),
            connectivity: Some(connectivity),
            auth: Some(auth),
            tracker: Some(tracker),
        }),
    })
}

impl<S> SyncSession<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// The store this session writes into.
    pub fn store(&self) -> &Arc<Store<S>> {
        &self.store
    }

    /// Subscribed bindings and the paths they observe.
    pub fn refs(&self) -> BTreeMap<String, String> {
        self.manager.refs()
    }

    /// Subscribed bindings and their listener handles.
    pub fn listeners(&self) -> BTreeMap<String, Vec<(EventKind, ListenerHandle)>> {
        self.manager.listeners()
    }

    /// Lifecycle phase of a subscribed binding.
    pub fn phase(&self, name: &str) -> Option<SubscriptionPhase> {
        self.manager.phase(name)
    }

    /// Join tracker of a populated binding.
    pub fn populated(&self, name: &str) -> Option<Arc<PopulateTracker>> {
        self.manager.populated(name)
    }

    /// The "fully loaded" signal.
    pub fn initialized(&self) -> Initialized {
        self.initialized.clone()
    }

    /// Returns true until [`Self::unsubscribe`] is called.
    pub fn is_active(&self) -> bool {
        !self.manager.is_stopped()
    }

    /// A write handle bound to this session.
    pub fn writer(&self) -> Writer {
        self.writer.clone()
    }

    /// Starts a tracked write.
    pub fn write(&self, method: WriteMethod, path: &str, value: Value) -> PendingWrite {
        self.writer.write(method, path, value)
    }

    /// Clears recorded write errors for `path`.
    pub fn clear_write_errors(&self, path: &str) {
        self.writer.clear_errors(path);
    }

    /// Auth flows that record their progress in this session's store.
    pub fn auth_flows(&self, provider: Arc<dyn AuthProvider>) -> AuthFlows {
        AuthFlows::new(provider, self.store.clone())
    }

    /// Stops every listener of the session. Mirrored data is kept.
    ///
    /// Calling it again does nothing.
    pub fn unsubscribe(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        let Some(subscriber) = handles.subscriber else {
            return;
        };
        debug!("stopping sync session");
        self.store.unsubscribe(subscriber);
        self.manager.unsubscribe_all();
        for handle in [handles.connectivity, handles.auth].into_iter().flatten() {
            self.remote.stop_observing(handle);
        }
    }
}

impl<S> Drop for SyncSession<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::Binding;
    use crate::error::BindError;
    use crate::remote::MemoryRemote;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn start(
        remote: &Arc<MemoryRemote>,
        config: SyncConfig<()>,
    ) -> (Arc<Store<()>>, SyncSession<()>) {
        let store = Arc::new(Store::new(()));
        let session = start_sync(store.clone(), remote.clone(), config).unwrap();
        (store, session)
    }

    #[test]
    fn invalid_config_dispatches_nothing() {
        let remote = Arc::new(MemoryRemote::online(json!({})));
        let store = Arc::new(Store::new(()));
        let result = start_sync(store.clone(), remote.clone(), SyncConfig::new(""));
        assert!(matches!(result, Err(BindError::MissingUrl)));
        assert_eq!(store.sync_state().url, None);
        assert_eq!(remote.observe_count(), 0);
    }

    #[test]
    fn declares_bindings_and_records_url() {
        let remote = Arc::new(MemoryRemote::online(json!({"posts": {"a": 1}})));
        let config = SyncConfig::new("memory://test").with_binding(Binding::array("posts", "posts"));
        let (store, session) = start(&remote, config);

        let sync = store.sync_state();
        assert_eq!(sync.url.as_deref(), Some("memory://test"));
        assert!(sync.stores.contains_key("posts"));
        assert_eq!(session.refs()["posts"], "posts");
        assert_eq!(session.phase("posts"), Some(SubscriptionPhase::Subscribing));

        remote.flush();
        assert_eq!(session.phase("posts"), Some(SubscriptionPhase::Subscribed));
        assert!(session.initialized().is_ready());
    }

    #[test]
    fn auth_changes_reach_state_and_hook() {
        let remote = Arc::new(MemoryRemote::online(json!({})));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let config = SyncConfig::new("memory://test").with_on_auth(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let (store, _session) = start(&remote, config);
        remote.flush();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(store.sync_state().authenticated_user.is_none());

        remote.set_auth(Some(json!({"uid": "u1"})));
        remote.flush();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            store.sync_state().authenticated_user,
            Some(json!({"uid": "u1"}))
        );
    }

    #[test]
    fn unsubscribe_stops_everything_once() {
        let remote = Arc::new(MemoryRemote::online(json!({"posts": {"a": 1}})));
        let config = SyncConfig::new("memory://test").with_binding(Binding::array("posts", "posts"));
        let (store, session) = start(&remote, config);
        remote.flush();
        assert_eq!(store.subscriber_count(), 1);

        session.unsubscribe();
        session.unsubscribe();
        assert!(!session.is_active());
        assert_eq!(store.subscriber_count(), 0);
        assert_eq!(remote.listener_count(), 0);
        assert!(store.sync_state().slice("posts").is_some());
    }

    #[test]
    fn dropping_the_session_unsubscribes() {
        let remote = Arc::new(MemoryRemote::online(json!({"posts": {"a": 1}})));
        let config = SyncConfig::new("memory://test").with_binding(Binding::array("posts", "posts"));
        let (store, session) = start(&remote, config);
        drop(session);
        assert_eq!(store.subscriber_count(), 0);
        assert_eq!(remote.listener_count(), 0);
    }

    #[tokio::test]
    async fn initialized_fails_when_session_closes_first() {
        let remote = Arc::new(MemoryRemote::new());
        let config = SyncConfig::new("memory://test").with_binding(Binding::array("posts", "posts"));
        let (_store, session) = start(&remote, config);
        let mut initialized = session.initialized();
        session.unsubscribe();
        assert_eq!(initialized.wait().await, Err(BindError::SessionClosed));
    }
}
