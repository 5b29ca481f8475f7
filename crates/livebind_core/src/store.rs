//! Single-writer state container.
//!
//! The store owns the application state together with the [`SyncState`].
//! Every mutation goes through [`Store::dispatch`] or [`Store::update_app`].
//! Mutations requested while subscribers are being notified are queued and
//! applied in order once the current notification round returns, so
//! subscribers never observe a half-applied state and may dispatch freely.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::event::SyncEvent;
use crate::state::SyncState;

/// Receiver of sync events.
///
/// The sync engine talks to the store only through this trait.
pub trait EventSink: Send + Sync {
    /// Dispatches an event.
    fn dispatch(&self, event: SyncEvent);
}

/// Snapshot of the whole store.
#[derive(Debug)]
pub struct StoreState<S> {
    /// Application state.
    pub app: Arc<S>,
    /// Sync state.
    pub sync: SyncState,
}

impl<S> StoreState<S> {
    /// Creates a snapshot with an empty sync state.
    pub fn new(app: S) -> Self {
        Self {
            app: Arc::new(app),
            sync: SyncState::new(),
        }
    }
}

impl<S> Clone for StoreState<S> {
    fn clone(&self) -> Self {
        Self {
            app: Arc::clone(&self.app),
            sync: self.sync.clone(),
        }
    }
}

/// Handle returned by [`Store::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

type Listener<S> = Arc<dyn Fn(&StoreState<S>) + Send + Sync>;

enum Command<S> {
    Event(SyncEvent),
    App(Box<dyn FnOnce(&mut S) + Send>),
}

struct Pending<S> {
    queue: VecDeque<Command<S>>,
    draining: bool,
}

/// The state container of a session.
pub struct Store<S> {
    state: RwLock<Arc<StoreState<S>>>,
    listeners: RwLock<Vec<(SubscriberId, Listener<S>)>>,
    pending: Mutex<Pending<S>>,
    next_id: AtomicU64,
}

impl<S> Store<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// Creates a store with an empty sync state.
    pub fn new(app: S) -> Self {
        Self::with_sync_state(app, SyncState::new())
    }

    /// Creates a store with a prepared sync state.
    pub fn with_sync_state(app: S, sync: SyncState) -> Self {
        Self {
            state: RwLock::new(Arc::new(StoreState {
                app: Arc::new(app),
                sync,
            })),
            listeners: RwLock::new(Vec::new()),
            pending: Mutex::new(Pending {
                queue: VecDeque::new(),
                draining: false,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Returns the current snapshot.
    pub fn state(&self) -> Arc<StoreState<S>> {
        self.state.read().clone()
    }

    /// Returns a copy of the current sync state.
    pub fn sync_state(&self) -> SyncState {
        self.state.read().sync.clone()
    }

    /// Mutates the application state.
    pub fn update_app(&self, f: impl FnOnce(&mut S) + Send + 'static) {
        self.enqueue(Command::App(Box::new(f)));
    }

    /// Registers a listener called after every applied mutation.
    pub fn subscribe(&self, listener: impl Fn(&StoreState<S>) + Send + Sync + 'static) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Returns the number of registered listeners.
    pub fn subscriber_count(&self) -> usize {
        self.listeners.read().len()
    }

    fn enqueue(&self, command: Command<S>) {
        {
            let mut pending = self.pending.lock();
            pending.queue.push_back(command);
            if pending.draining {
                return;
            }
            pending.draining = true;
        }

        loop {
            let command = {
                let mut pending = self.pending.lock();
                match pending.queue.pop_front() {
                    Some(command) => command,
                    None => {
                        pending.draining = false;
                        return;
                    }
                }
            };
            let snapshot = self.apply(command);
            self.notify(&snapshot);
        }
    }

    fn apply(&self, command: Command<S>) -> Arc<StoreState<S>> {
        let mut state = self.state.write();
        let next = match command {
            Command::Event(event) => StoreState {
                app: Arc::clone(&state.app),
                sync: crate::state::reduce(&state.sync, &event),
            },
            Command::App(f) => {
                let mut app = (*state.app).clone();
                f(&mut app);
                StoreState {
                    app: Arc::new(app),
                    sync: state.sync.clone(),
                }
            }
        };
        *state = Arc::new(next);
        state.clone()
    }

    fn notify(&self, snapshot: &StoreState<S>) {
        let listeners: Vec<Listener<S>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(snapshot);
        }
    }
}

impl<S> EventSink for Store<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn dispatch(&self, event: SyncEvent) {
        self.enqueue(Command::Event(event));
    }
}

impl<S> Store<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// Dispatches a sync event.
    pub fn dispatch(&self, event: SyncEvent) {
        EventSink::dispatch(self, event);
    }
}
