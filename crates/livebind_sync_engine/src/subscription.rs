//! Listener wiring for one resolved binding.
//!
//! [`LiveSubscription::attach`] registers the listeners a binding's shape
//! needs and turns their deliveries into [`SyncEvent`]s. Every callback
//! checks the subscription's liveness flag first, so deliveries that were
//! already queued when the subscription was torn down are dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use livebind_core::{EventSink, SyncEvent};
use tracing::{debug, trace, warn};

use crate::binding::{ResolvedBinding, Shape};
use crate::error::{RemoteError, RemoteResult};
use crate::populate::PopulateTracker;
use crate::remote::{DataSnapshot, Delivery, EventKind, ListenerCallback, ListenerHandle, RemoteClient};

/// Called when the remote cancels a listener.
pub type CancelFn = Arc<dyn Fn(&RemoteError) + Send + Sync>;

/// Lifecycle of a live subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionPhase {
    /// Listeners are attached; the initial value has not arrived.
    Subscribing,
    /// The initial value arrived.
    Subscribed,
}

/// State shared by every callback of one subscription.
#[derive(Clone)]
pub(crate) struct ListenerContext {
    pub binding: String,
    pub sink: Arc<dyn EventSink>,
    pub alive: Arc<AtomicBool>,
    pub loaded: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    on_cancel: Option<CancelFn>,
}

impl ListenerContext {
    pub fn new(binding: &str, sink: Arc<dyn EventSink>, on_cancel: Option<CancelFn>) -> Self {
        Self {
            binding: binding.to_string(),
            sink,
            alive: Arc::new(AtomicBool::new(true)),
            loaded: Arc::new(AtomicBool::new(false)),
            cancelled: Arc::new(AtomicBool::new(false)),
            on_cancel,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn mark_loaded(&self) {
        self.loaded.store(true, Ordering::SeqCst);
    }

    pub fn dispatch(&self, event: SyncEvent) {
        self.sink.dispatch(event);
    }

    pub fn initial_value_received(&self) {
        self.dispatch(SyncEvent::InitialValueReceived {
            binding: self.binding.clone(),
        });
    }

    /// Records a cancellation. Only the first one per subscription is
    /// reported.
    pub fn revoke(&self, error: &RemoteError) {
        if self.report_cancel(error) {
            self.call_on_cancel(error);
        }
    }

    /// A listener failed before delivering: the binding counts as received
    /// so completion is not blocked.
    pub fn fail(&self, error: &RemoteError) {
        let first = self.report_cancel(error);
        self.initial_value_received();
        if first {
            self.call_on_cancel(error);
        }
    }

    fn report_cancel(&self, error: &RemoteError) -> bool {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        warn!(binding = %self.binding, %error, "listener cancelled by remote");
        self.dispatch(SyncEvent::PermissionsRevoked {
            message: error.to_string(),
        });
        true
    }

    fn call_on_cancel(&self, error: &RemoteError) {
        if let Some(on_cancel) = &self.on_cancel {
            on_cancel(error);
        }
    }
}

/// Listeners and join watches owned by one resolved binding.
pub struct LiveSubscription {
    binding: ResolvedBinding,
    listeners: Vec<(EventKind, ListenerHandle)>,
    populated: Option<Arc<PopulateTracker>>,
    ctx: ListenerContext,
}

impl LiveSubscription {
    /// Registers the listeners `binding` needs.
    pub(crate) fn attach(
        remote: &Arc<dyn RemoteClient>,
        binding: &ResolvedBinding,
        ctx: ListenerContext,
    ) -> Self {
        debug!(binding = %binding.name, path = %binding.path, "subscribing");
        let mut subscription = Self {
            binding: binding.clone(),
            listeners: Vec::new(),
            populated: None,
            ctx,
        };
        match &binding.shape {
            Shape::Value => subscription.attach_value(remote),
            Shape::Collection => subscription.attach_collection(remote),
            Shape::Joined(populate) => {
                let tracker = PopulateTracker::new(
                    Arc::clone(remote),
                    Arc::clone(populate),
                    subscription.ctx.clone(),
                );
                subscription.populated = Some(Arc::clone(&tracker));
                subscription.attach_joined(remote, tracker);
            }
        }
        subscription
    }

    fn attach_value(&mut self, remote: &Arc<dyn RemoteClient>) {
        let ctx = self.ctx.clone();
        let callback: ListenerCallback = Arc::new(move |result: RemoteResult<Delivery>| {
            if !ctx.is_alive() {
                return;
            }
            match result {
                Ok(delivery) => {
                    trace!(binding = %ctx.binding, "value delivered");
                    // The value is stored before the binding counts as received.
                    let DataSnapshot { key, value, .. } = delivery.snapshot;
                    ctx.dispatch(SyncEvent::ObjectUpdated {
                        binding: ctx.binding.clone(),
                        key,
                        value,
                    });
                    ctx.mark_loaded();
                    ctx.initial_value_received();
                }
                Err(error) => ctx.fail(&error),
            }
        });
        let handle = remote.observe(&self.binding.query, EventKind::Value, callback);
        self.listeners.push((EventKind::Value, handle));
    }

    fn attach_collection(&mut self, remote: &Arc<dyn RemoteClient>) {
        for kind in EventKind::CHILD_KINDS {
            let ctx = self.ctx.clone();
            let callback: ListenerCallback = Arc::new(move |result: RemoteResult<Delivery>| {
                if !ctx.is_alive() {
                    return;
                }
                let delivery = match result {
                    Ok(delivery) => delivery,
                    Err(error) => return ctx.fail(&error),
                };
                // Every child kind waits for the bulk read, which already
                // reflects anything reported before it lands.
                if !ctx.is_loaded() {
                    trace!(binding = %ctx.binding, ?kind, "child event before initial load");
                    return;
                }
                if let Some(event) = child_event(&ctx.binding, kind, delivery) {
                    ctx.dispatch(event);
                }
            });
            let handle = remote.observe(&self.binding.query, kind, callback);
            self.listeners.push((kind, handle));
        }

        let ctx = self.ctx.clone();
        remote.read_once(
            &self.binding.query,
            Box::new(move |result: RemoteResult<DataSnapshot>| {
                if !ctx.is_alive() {
                    return;
                }
                match result {
                    Ok(snapshot) => {
                        ctx.dispatch(SyncEvent::ArrayUpdated {
                            binding: ctx.binding.clone(),
                            key: snapshot.key,
                            records: snapshot.children,
                        });
                        ctx.mark_loaded();
                        ctx.initial_value_received();
                    }
                    Err(error) => ctx.fail(&error),
                }
            }),
        );
    }

    fn attach_joined(&mut self, remote: &Arc<dyn RemoteClient>, tracker: Arc<PopulateTracker>) {
        for kind in EventKind::CHILD_KINDS {
            let ctx = self.ctx.clone();
            let tracker = Arc::clone(&tracker);
            let callback: ListenerCallback = Arc::new(move |result: RemoteResult<Delivery>| {
                if !ctx.is_alive() {
                    return;
                }
                let delivery = match result {
                    Ok(delivery) => delivery,
                    Err(error) => return ctx.fail(&error),
                };
                let key = delivery.snapshot.key;
                match kind {
                    EventKind::ChildAdded => tracker.add_child(&key, delivery.previous_key),
                    EventKind::ChildMoved => tracker.move_child(&key, delivery.previous_key),
                    EventKind::ChildRemoved => tracker.remove_child(&key),
                    // Joined values come from the per-record watches.
                    EventKind::ChildChanged | EventKind::Value => {}
                }
            });
            let handle = remote.observe(&self.binding.query, kind, callback);
            self.listeners.push((kind, handle));
        }

        let ctx = self.ctx.clone();
        remote.read_once(
            &self.binding.query,
            Box::new(move |result: RemoteResult<DataSnapshot>| {
                if !ctx.is_alive() {
                    return;
                }
                match result {
                    Ok(snapshot) => tracker.load_all(snapshot),
                    Err(error) => ctx.fail(&error),
                }
            }),
        );
    }

    /// Detaches every listener and join watch.
    pub(crate) fn teardown(&self, remote: &dyn RemoteClient) {
        debug!(binding = %self.binding.name, path = %self.binding.path, "unsubscribing");
        self.ctx.alive.store(false, Ordering::SeqCst);
        for (_, handle) in &self.listeners {
            remote.stop_observing(*handle);
        }
        if let Some(tracker) = &self.populated {
            tracker.detach_all();
        }
    }

    /// The binding this subscription serves.
    pub fn binding(&self) -> &ResolvedBinding {
        &self.binding
    }

    /// Registered listeners by kind.
    pub fn listeners(&self) -> &[(EventKind, ListenerHandle)] {
        &self.listeners
    }

    /// Join tracker of a populated binding.
    pub fn populated(&self) -> Option<&Arc<PopulateTracker>> {
        self.populated.as_ref()
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> SubscriptionPhase {
        if self.ctx.is_loaded() {
            SubscriptionPhase::Subscribed
        } else {
            SubscriptionPhase::Subscribing
        }
    }
}

fn child_event(binding: &str, kind: EventKind, delivery: Delivery) -> Option<SyncEvent> {
    let binding = binding.to_string();
    let event = match kind {
        EventKind::ChildAdded => SyncEvent::ArrayChildAdded {
            binding,
            record: delivery.snapshot.into_record(),
            previous_key: delivery.previous_key,
        },
        EventKind::ChildChanged => SyncEvent::ArrayChildChanged {
            binding,
            record: delivery.snapshot.into_record(),
        },
        EventKind::ChildMoved => SyncEvent::ArrayChildMoved {
            binding,
            key: delivery.snapshot.key,
            previous_key: delivery.previous_key,
        },
        EventKind::ChildRemoved => SyncEvent::ArrayChildRemoved {
            binding,
            key: delivery.snapshot.key,
        },
        EventKind::Value => return None,
    };
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{resolve, Binding};
    use crate::remote::MemoryRemote;
    use livebind_core::{Store, StoreState, Value};
    use parking_lot::Mutex;
    use serde_json::json;

    fn setup(data: Value) -> (Arc<MemoryRemote>, Arc<Store<()>>, Arc<dyn RemoteClient>) {
        let remote = Arc::new(MemoryRemote::online(data));
        let store = Arc::new(Store::new(()));
        let client: Arc<dyn RemoteClient> = remote.clone();
        (remote, store, client)
    }

    fn attach(
        client: &Arc<dyn RemoteClient>,
        store: &Arc<Store<()>>,
        binding: Binding<()>,
        on_cancel: Option<CancelFn>,
    ) -> LiveSubscription {
        let name = binding.name().to_string();
        let resolved = resolve(&[binding], &StoreState::new(()), None);
        let ctx = ListenerContext::new(&name, store.clone(), on_cancel);
        LiveSubscription::attach(client, &resolved[&name], ctx)
    }

    #[test]
    fn object_binding_tracks_value() {
        let (remote, store, client) = setup(json!({"settings": {"theme": "dark"}}));
        let sub = attach(&client, &store, Binding::object("settings", "settings"), None);
        assert_eq!(sub.phase(), SubscriptionPhase::Subscribing);
        remote.flush();
        assert_eq!(sub.phase(), SubscriptionPhase::Subscribed);

        let sync = store.sync_state();
        let slice = sync.slice("settings").unwrap();
        assert_eq!(slice.key, "settings");
        assert_eq!(slice.as_value(), Some(&json!({"theme": "dark"})));
        assert!(sync.initial_values_received.contains("settings"));

        remote.set("settings/theme", json!("light"));
        remote.flush();
        assert_eq!(
            store.sync_state().slice("settings").unwrap().as_value(),
            Some(&json!({"theme": "light"}))
        );
    }

    #[test]
    fn collection_loads_then_follows_children() {
        let (remote, store, client) = setup(json!({"posts": {"0": {"title": "First"}, "1": {"title": "Second"}}}));
        let sub = attach(&client, &store, Binding::array("posts", "posts"), None);
        assert_eq!(sub.listeners().len(), 4);
        remote.flush();

        let keys = |store: &Arc<Store<()>>| -> Vec<String> {
            store
                .sync_state()
                .records("posts")
                .map(|records| records.iter().map(|r| r.key.clone()).collect())
                .unwrap_or_default()
        };
        assert_eq!(keys(&store), vec!["0", "1"]);

        let pushed = remote.push("posts", json!({"title": "Third"}));
        remote.set("posts/0/title", json!("Primero"));
        remote.remove("posts/1");
        remote.flush();
        assert_eq!(keys(&store), vec!["0".to_string(), pushed]);
        assert_eq!(
            store.sync_state().records("posts").unwrap()[0].value,
            json!({"title": "Primero"})
        );
    }

    #[test]
    fn ordered_collection_follows_moves() {
        let (remote, store, client) = setup(json!({"s": {"a": {"n": 1}, "b": {"n": 2}, "c": {"n": 3}}}));
        let binding = Binding::<()>::array("scores", "s").with_query(|q, _| q.order_by_child("n"));
        let _sub = attach(&client, &store, binding, None);
        remote.flush();

        remote.set("s/a/n", json!(9));
        remote.flush();
        let sync = store.sync_state();
        let keys: Vec<&str> = sync
            .records("scores")
            .unwrap()
            .iter()
            .map(|r| r.key.as_str())
            .collect();
        assert_eq!(keys, vec!["b", "c", "a"]);
    }

    #[test]
    fn permission_error_marks_received_and_cancels_once() {
        let (remote, store, client) = setup(json!({"secret": {"x": 1}}));
        remote.deny("secret");
        let cancels = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&cancels);
        let on_cancel: CancelFn = Arc::new(move |err: &RemoteError| sink.lock().push(err.clone()));

        let _sub = attach(&client, &store, Binding::array("secret", "secret"), Some(on_cancel));
        remote.flush();

        let sync = store.sync_state();
        assert!(sync.initial_values_received.contains("secret"));
        assert!(sync
            .errors
            .permissions
            .as_deref()
            .is_some_and(|m| m.contains("permission denied")));
        assert!(sync.slice("secret").is_none());
        assert_eq!(cancels.lock().len(), 1);
    }

    #[test]
    fn teardown_drops_queued_deliveries() {
        let (remote, store, client) = setup(json!({"settings": {"theme": "dark"}}));
        let sub = attach(&client, &store, Binding::object("settings", "settings"), None);
        sub.teardown(client.as_ref());
        remote.flush();
        assert!(store.sync_state().slice("settings").is_none());
        assert_eq!(remote.listener_count(), 0);
    }

    fn reviews_data() -> Value {
        json!({
            "reviews": {"a": {"stars": 5}, "b": {"stars": 1}, "d": {"stars": 4}},
            "userReviews": {"1": {"b": true}, "2": {"a": true, "d": true}}
        })
    }

    fn counting_cancel() -> (CancelFn, Arc<Mutex<usize>>) {
        let cancels = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&cancels);
        (Arc::new(move |_: &RemoteError| *sink.lock() += 1), cancels)
    }

    fn joined(user: &str) -> Binding<()> {
        Binding::array("reviews", format!("userReviews/{user}"))
            .with_populate(|key: &str| format!("reviews/{key}"))
    }

    /// Runs tasks until the bulk listing reached the join tracker.
    fn run_until_listed(remote: &MemoryRemote, sub: &LiveSubscription) {
        let tracker = sub.populated().unwrap();
        while tracker.is_empty() && remote.run_next() {}
        assert!(!tracker.is_empty());
    }

    #[test]
    fn collection_teardown_drops_bulk_read() {
        let (remote, store, client) = setup(json!({"posts": {"0": {"title": "First"}}}));
        let sub = attach(&client, &store, Binding::array("posts", "posts"), None);
        assert!(remote.pending_tasks() > 0);
        sub.teardown(client.as_ref());
        remote.flush();

        let sync = store.sync_state();
        assert!(sync.slice("posts").is_none());
        assert!(!sync.initial_values_received.contains("posts"));
        assert_eq!(sub.phase(), SubscriptionPhase::Subscribing);
        assert_eq!(remote.listener_count(), 0);
    }

    #[test]
    fn collection_child_events_wait_for_bulk_read() {
        let (remote, store, client) = setup(json!({"posts": {"0": {"title": "First"}}}));
        let _sub = attach(&client, &store, Binding::array("posts", "posts"), None);
        remote.set("posts/0/title", json!("Edited"));
        remote.flush();

        let sync = store.sync_state();
        let records = sync.records("posts").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, json!({"title": "Edited"}));
    }

    #[test]
    fn joined_teardown_drops_join_reads() {
        let (remote, store, client) = setup(reviews_data());
        remote.deny("reviews/a");
        let (on_cancel, cancels) = counting_cancel();
        let sub = attach(&client, &store, joined("2"), Some(on_cancel));
        run_until_listed(&remote, &sub);

        sub.teardown(client.as_ref());
        remote.flush();

        let sync = store.sync_state();
        assert!(sync.slice("reviews").is_none());
        assert_eq!(sync.errors.permissions, None);
        assert!(!sync.initial_values_received.contains("reviews"));
        assert_eq!(*cancels.lock(), 0);
        assert_eq!(remote.listener_count(), 0);
    }

    #[test]
    fn joined_resubscribe_keeps_only_new_records() {
        let (remote, store, client) = setup(reviews_data());
        remote.deny("reviews/a");
        let (on_cancel, cancels) = counting_cancel();
        let old = attach(&client, &store, joined("2"), Some(on_cancel.clone()));
        run_until_listed(&remote, &old);

        old.teardown(client.as_ref());
        let current = attach(&client, &store, joined("1"), Some(on_cancel));
        remote.flush();

        let sync = store.sync_state();
        let records = sync.records("reviews").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "b");
        assert_eq!(records[0].value, json!({"stars": 1}));
        assert_eq!(sync.errors.permissions, None);
        assert_eq!(*cancels.lock(), 0);
        assert_eq!(current.phase(), SubscriptionPhase::Subscribed);
        // Child listeners plus one watch for `b`.
        assert_eq!(remote.listener_count(), 5);
    }
}
