//! Subscription manager.
//!
//! The manager owns the live subscriptions of a session. On every state
//! change it resolves the declarations and, when the resolved snapshot
//! differs from the current one, unsubscribes bindings that lost their path,
//! subscribes new ones and rebuilds those whose path or query changed.
//!
//! Events produced by a diff are dispatched after the manager's lock is
//! released, so a store subscriber may call back into [`SubscriptionManager::sync`].

use std::collections::BTreeMap;
use std::sync::Arc;

use livebind_core::{EventSink, StoreState, SyncEvent};
use parking_lot::Mutex;
use tracing::debug;

use crate::binding::{resolve, Binding, PathParamsFn, ResolvedBindings};
use crate::populate::PopulateTracker;
use crate::remote::{EventKind, ListenerHandle, RemoteClient};
use crate::subscription::{CancelFn, ListenerContext, LiveSubscription, SubscriptionPhase};

/// What one [`SubscriptionManager::sync`] call changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Bindings that gained a path.
    pub subscribed: Vec<String>,
    /// Bindings that lost their path.
    pub unsubscribed: Vec<String>,
    /// Bindings whose path or query changed.
    pub resubscribed: Vec<String>,
}

impl SyncOutcome {
    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.subscribed.is_empty() && self.unsubscribed.is_empty() && self.resubscribed.is_empty()
    }
}

struct ManagerState {
    current: ResolvedBindings,
    live: BTreeMap<String, LiveSubscription>,
    stopped: bool,
}

/// Keeps live subscriptions in line with the resolved bindings.
pub struct SubscriptionManager<S> {
    bindings: Vec<Binding<S>>,
    path_params: Option<PathParamsFn<S>>,
    remote: Arc<dyn RemoteClient>,
    sink: Arc<dyn EventSink>,
    on_cancel: Option<CancelFn>,
    state: Mutex<ManagerState>,
}

impl<S> SubscriptionManager<S> {
    /// Creates a manager with nothing subscribed.
    pub fn new(
        bindings: Vec<Binding<S>>,
        path_params: Option<PathParamsFn<S>>,
        remote: Arc<dyn RemoteClient>,
        sink: Arc<dyn EventSink>,
        on_cancel: Option<CancelFn>,
    ) -> Self {
        Self {
            bindings,
            path_params,
            remote,
            sink,
            on_cancel,
            state: Mutex::new(ManagerState {
                current: ResolvedBindings::new(),
                live: BTreeMap::new(),
                stopped: false,
            }),
        }
    }

    /// Brings the live subscriptions in line with `state`.
    ///
    /// Calling it again with an equivalent state does nothing.
    pub fn sync(&self, state: &StoreState<S>) -> SyncOutcome {
        let resolved = resolve(&self.bindings, state, self.path_params.as_ref());
        let mut outcome = SyncOutcome::default();
        let mut events = Vec::new();
        {
            let mut inner = self.state.lock();
            if inner.stopped || inner.current == resolved {
                return outcome;
            }

            for (name, previous) in &inner.current {
                match resolved.get(name) {
                    None => outcome.unsubscribed.push(name.clone()),
                    Some(next) if next != previous => outcome.resubscribed.push(name.clone()),
                    Some(_) => {}
                }
            }
            for name in resolved.keys() {
                if !inner.current.contains_key(name) {
                    outcome.subscribed.push(name.clone());
                }
            }

            for name in outcome.unsubscribed.iter().chain(&outcome.resubscribed) {
                if let Some(live) = inner.live.remove(name) {
                    live.teardown(self.remote.as_ref());
                }
            }
            for name in &outcome.unsubscribed {
                events.push(SyncEvent::ValueReplaced {
                    binding: name.clone(),
                    slice: None,
                });
            }
            for name in outcome.subscribed.iter().chain(&outcome.resubscribed) {
                if let Some(binding) = resolved.get(name) {
                    if outcome.resubscribed.contains(name) {
                        debug!(binding = %name, path = %binding.path, "resubscribing");
                    }
                    let ctx = ListenerContext::new(name, Arc::clone(&self.sink), self.on_cancel.clone());
                    let live = LiveSubscription::attach(&self.remote, binding, ctx);
                    inner.live.insert(name.clone(), live);
                }
            }

            let names_changed = !inner.current.keys().eq(resolved.keys());
            inner.current = resolved;
            if names_changed {
                events.push(SyncEvent::BindingsResolved {
                    names: inner.current.keys().cloned().collect(),
                });
            }
        }

        for event in events {
            self.sink.dispatch(event);
        }
        outcome
    }

    /// Tears down every subscription. Later syncs do nothing.
    pub fn unsubscribe_all(&self) {
        let live = {
            let mut inner = self.state.lock();
            if inner.stopped {
                return;
            }
            inner.stopped = true;
            inner.current.clear();
            std::mem::take(&mut inner.live)
        };
        debug!(count = live.len(), "unsubscribing all bindings");
        for subscription in live.values() {
            subscription.teardown(self.remote.as_ref());
        }
    }

    /// Returns true once [`Self::unsubscribe_all`] ran.
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// The current resolved snapshot.
    pub fn resolved(&self) -> ResolvedBindings {
        self.state.lock().current.clone()
    }

    /// Live bindings and the paths they observe.
    pub fn refs(&self) -> BTreeMap<String, String> {
        self.state
            .lock()
            .live
            .iter()
            .map(|(name, live)| (name.clone(), live.binding().path.clone()))
            .collect()
    }

    /// Live bindings and their listener handles.
    pub fn listeners(&self) -> BTreeMap<String, Vec<(EventKind, ListenerHandle)>> {
        self.state
            .lock()
            .live
            .iter()
            .map(|(name, live)| (name.clone(), live.listeners().to_vec()))
            .collect()
    }

    /// Lifecycle phase of a binding; `None` when it is not subscribed.
    pub fn phase(&self, name: &str) -> Option<SubscriptionPhase> {
        self.state.lock().live.get(name).map(LiveSubscription::phase)
    }

    /// Join tracker of a populated binding.
    pub fn populated(&self, name: &str) -> Option<Arc<PopulateTracker>> {
        self.state
            .lock()
            .live
            .get(name)
            .and_then(|live| live.populated().cloned())
    }
}
