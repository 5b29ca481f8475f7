//! Populate joins.
//!
//! A populated array binding stores, for each child key of the bound node,
//! the record found at `populate(key)` instead of the child itself. The
//! tracker reads every joined record once, publishes the whole array when
//! all reads are back, and then keeps one value watch per record.
//!
//! While the initial reads are outstanding, child additions, moves and
//! removals only adjust the pending key order; the array is published once,
//! in that order, when the last read returns.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use livebind_core::{record, Query, Record, SyncEvent, Value};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::binding::PopulateFn;
use crate::error::RemoteResult;
use crate::remote::{DataSnapshot, Delivery, EventKind, ListenerHandle, RemoteClient};
use crate::subscription::ListenerContext;

#[derive(Debug)]
struct JoinEntry {
    generation: u64,
    path: String,
    previous_key: Option<String>,
    value: Option<Value>,
    watch: Option<ListenerHandle>,
}

#[derive(Debug, Default)]
struct TrackerState {
    /// Bulk listing received.
    listed: bool,
    /// Array published.
    ready: bool,
    detached: bool,
    node_key: String,
    /// Key order while loading.
    order: Vec<Record>,
    /// Reads the initial publication waits for.
    waiting: BTreeSet<(String, u64)>,
    entries: BTreeMap<String, JoinEntry>,
    next_generation: u64,
}

impl TrackerState {
    fn entry(&mut self, key: &str, path: String, previous_key: Option<String>) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.entries.insert(
            key.to_string(),
            JoinEntry {
                generation,
                path,
                previous_key,
                value: None,
                watch: None,
            },
        );
        generation
    }

    fn is_current(&self, key: &str, generation: u64) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.generation == generation)
    }
}

/// Work decided under the lock and carried out after releasing it.
enum Step {
    Read { key: String, generation: u64, path: String },
    Watch { key: String, generation: u64, path: String },
    Stop(ListenerHandle),
    Dispatch(SyncEvent),
    Loaded,
}

/// Joined-record reads and watches of one populated binding.
pub struct PopulateTracker {
    remote: Arc<dyn RemoteClient>,
    populate: PopulateFn,
    ctx: ListenerContext,
    state: Mutex<TrackerState>,
    this: Weak<PopulateTracker>,
}

impl PopulateTracker {
    pub(crate) fn new(
        remote: Arc<dyn RemoteClient>,
        populate: PopulateFn,
        ctx: ListenerContext,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            remote,
            populate,
            ctx,
            state: Mutex::new(TrackerState::default()),
            this: this.clone(),
        })
    }

    /// Starts the join from the bulk listing of the bound node.
    pub(crate) fn load_all(&self, snapshot: DataSnapshot) {
        let steps = {
            let mut state = self.state.lock();
            if state.detached || state.listed {
                return;
            }
            state.listed = true;
            state.node_key = snapshot.key;
            state.order = snapshot.children;

            let keys: Vec<String> = state.order.iter().map(|r| r.key.clone()).collect();
            let mut steps = Vec::new();
            for key in keys {
                let path = (self.populate)(&key);
                let generation = state.entry(&key, path.clone(), None);
                state.waiting.insert((key.clone(), generation));
                steps.push(Step::Read {
                    key,
                    generation,
                    path,
                });
            }
            debug!(binding = %self.ctx.binding, joins = steps.len(), "loading joined records");
            if steps.is_empty() {
                steps.extend(Self::publish(&mut state, &self.ctx.binding));
            }
            steps
        };
        self.run(steps);
    }

    /// A child entered the bound node.
    pub(crate) fn add_child(&self, key: &str, previous_key: Option<String>) {
        let steps = {
            let mut state = self.state.lock();
            if state.detached || !state.listed {
                return;
            }
            let mut steps = Vec::new();
            if let Some(old) = state.entries.remove(key) {
                steps.extend(old.watch.map(Step::Stop));
            }
            let path = (self.populate)(key);
            let generation = state.entry(key, path.clone(), previous_key.clone());
            if !state.ready {
                state.order = record::insert_after(
                    &state.order,
                    Record::new(key, Value::Null),
                    previous_key.as_deref(),
                );
                state.waiting.retain(|(waiting, _)| waiting != key);
                state.waiting.insert((key.to_string(), generation));
            }
            steps.push(Step::Read {
                key: key.to_string(),
                generation,
                path,
            });
            steps
        };
        self.run(steps);
    }

    /// A child changed position in the bound node.
    pub(crate) fn move_child(&self, key: &str, previous_key: Option<String>) {
        let steps = {
            let mut state = self.state.lock();
            if state.detached || !state.listed {
                return;
            }
            if !state.ready {
                state.order = record::move_after(&state.order, key, previous_key.as_deref());
                return;
            }
            // Not in the store until its join read lands; insert it there.
            if let Some(entry) = state.entries.get_mut(key) {
                if entry.value.is_none() {
                    entry.previous_key = previous_key;
                    return;
                }
            }
            vec![Step::Dispatch(SyncEvent::ArrayChildMoved {
                binding: self.ctx.binding.clone(),
                key: key.to_string(),
                previous_key,
            })]
        };
        self.run(steps);
    }

    /// A child left the bound node. Its watch is stopped before the
    /// removal is dispatched.
    pub(crate) fn remove_child(&self, key: &str) {
        let steps = {
            let mut state = self.state.lock();
            if state.detached || !state.listed {
                return;
            }
            let mut steps = Vec::new();
            if let Some(entry) = state.entries.remove(key) {
                steps.extend(entry.watch.map(Step::Stop));
            }
            if state.ready {
                steps.push(Step::Dispatch(SyncEvent::ArrayChildRemoved {
                    binding: self.ctx.binding.clone(),
                    key: key.to_string(),
                }));
            } else {
                state.order = record::remove_at(&state.order, key);
                state.waiting.retain(|(waiting, _)| waiting != key);
                if state.waiting.is_empty() {
                    steps.extend(Self::publish(&mut state, &self.ctx.binding));
                }
            }
            steps
        };
        self.run(steps);
    }

    /// Stops every watch. Later deliveries are ignored.
    pub(crate) fn detach_all(&self) {
        let handles: Vec<ListenerHandle> = {
            let mut state = self.state.lock();
            state.detached = true;
            state.waiting.clear();
            let entries = std::mem::take(&mut state.entries);
            entries.into_values().filter_map(|entry| entry.watch).collect()
        };
        for handle in handles {
            self.remote.stop_observing(handle);
        }
    }

    /// Joined child keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().entries.keys().cloned().collect()
    }

    /// Number of joined children.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns true if nothing is joined.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of open record watches.
    pub fn watch_count(&self) -> usize {
        self.state
            .lock()
            .entries
            .values()
            .filter(|entry| entry.watch.is_some())
            .count()
    }

    fn on_read(&self, key: String, generation: u64, result: RemoteResult<DataSnapshot>) {
        let value = match result {
            Ok(snapshot) => snapshot.value,
            Err(error) => {
                if !self.accepts(&key, generation) {
                    trace!(binding = %self.ctx.binding, %key, "dropping stale join error");
                    return;
                }
                self.ctx.revoke(&error);
                Value::Null
            }
        };
        let steps = {
            let mut state = self.state.lock();
            if state.detached || !state.is_current(&key, generation) {
                trace!(binding = %self.ctx.binding, %key, "dropping stale join read");
                return;
            }
            let ready = state.ready;
            let Some(entry) = state.entries.get_mut(&key) else {
                return;
            };
            entry.value = Some(value.clone());
            let path = entry.path.clone();
            let previous_key = entry.previous_key.clone();

            if ready {
                vec![
                    Step::Dispatch(SyncEvent::ArrayChildAdded {
                        binding: self.ctx.binding.clone(),
                        record: Record::new(key.clone(), value),
                        previous_key,
                    }),
                    Step::Watch {
                        key,
                        generation,
                        path,
                    },
                ]
            } else {
                state.waiting.remove(&(key, generation));
                if state.waiting.is_empty() {
                    Self::publish(&mut state, &self.ctx.binding)
                } else {
                    Vec::new()
                }
            }
        };
        self.run(steps);
    }

    fn on_watch(&self, key: &str, generation: u64, result: RemoteResult<Delivery>) {
        let delivery = match result {
            Ok(delivery) => delivery,
            Err(error) => {
                if self.accepts(key, generation) {
                    self.ctx.revoke(&error);
                }
                return;
            }
        };
        let steps = {
            let mut state = self.state.lock();
            if state.detached || !state.is_current(key, generation) {
                return;
            }
            let Some(entry) = state.entries.get_mut(key) else {
                return;
            };
            let value = delivery.snapshot.value;
            if entry.value.as_ref() == Some(&value) {
                return;
            }
            entry.value = Some(value.clone());
            vec![Step::Dispatch(SyncEvent::ArrayChildChanged {
                binding: self.ctx.binding.clone(),
                record: Record::new(key, value),
            })]
        };
        self.run(steps);
    }

    /// Returns true if a reply for `key` at `generation` still belongs to a
    /// live subscription.
    fn accepts(&self, key: &str, generation: u64) -> bool {
        if !self.ctx.is_alive() {
            return false;
        }
        let state = self.state.lock();
        !state.detached && state.is_current(key, generation)
    }

    /// Publishes the loaded array and opens the record watches.
    fn publish(state: &mut TrackerState, binding: &str) -> Vec<Step> {
        state.ready = true;
        let order = std::mem::take(&mut state.order);
        let records: Vec<Record> = order
            .into_iter()
            .filter_map(|record| {
                let entry = state.entries.get(&record.key)?;
                let value = entry.value.clone().unwrap_or(Value::Null);
                Some(Record::new(record.key, value))
            })
            .collect();

        let mut steps = vec![
            Step::Dispatch(SyncEvent::ArrayUpdated {
                binding: binding.to_string(),
                key: state.node_key.clone(),
                records,
            }),
            Step::Loaded,
            Step::Dispatch(SyncEvent::InitialValueReceived {
                binding: binding.to_string(),
            }),
        ];
        steps.extend(state.entries.iter().map(|(key, entry)| Step::Watch {
            key: key.clone(),
            generation: entry.generation,
            path: entry.path.clone(),
        }));
        steps
    }

    fn run(&self, steps: Vec<Step>) {
        for step in steps {
            if !self.ctx.is_alive() {
                return;
            }
            match step {
                Step::Read {
                    key,
                    generation,
                    path,
                } => {
                    let this = self.this.clone();
                    self.remote.read_once(
                        &Query::at(&path),
                        Box::new(move |result: RemoteResult<DataSnapshot>| {
                            if let Some(tracker) = this.upgrade() {
                                tracker.on_read(key, generation, result);
                            }
                        }),
                    );
                }
                Step::Watch {
                    key,
                    generation,
                    path,
                } => self.watch(key, generation, &path),
                Step::Stop(handle) => self.remote.stop_observing(handle),
                Step::Dispatch(event) => self.ctx.dispatch(event),
                Step::Loaded => self.ctx.mark_loaded(),
            }
        }
    }

    fn watch(&self, key: String, generation: u64, path: &str) {
        let this = self.this.clone();
        let watched = key.clone();
        let handle = self.remote.observe(
            &Query::at(path),
            EventKind::Value,
            Arc::new(move |result: RemoteResult<Delivery>| {
                if let Some(tracker) = this.upgrade() {
                    tracker.on_watch(&watched, generation, result);
                }
            }),
        );

        let stored = {
            let mut state = self.state.lock();
            let detached = state.detached;
            let stored = match state.entries.get_mut(&key) {
                Some(entry) if !detached && entry.generation == generation => {
                    entry.watch = Some(handle);
                    true
                }
                _ => false,
            };
            stored
        };
        if !stored {
            self.remote.stop_observing(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::remote::MemoryRemote;
    use crate::subscription::CancelFn;
    use livebind_core::Store;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn reviews() -> Value {
        json!({
            "reviews": {
                "a": {"stars": 5}, "b": {"stars": 1}, "c": {"stars": 3},
                "d": {"stars": 4}, "e": {"stars": 2}, "f": {"stars": 5}
            },
            "userReviews": {
                "1": {"b": true, "c": true},
                "2": {"a": true, "d": true, "f": true}
            }
        })
    }

    fn tracker(remote: &Arc<MemoryRemote>, store: &Arc<Store<()>>) -> Arc<PopulateTracker> {
        tracker_with(remote, ListenerContext::new("reviews", store.clone(), None))
    }

    fn tracker_with(remote: &Arc<MemoryRemote>, ctx: ListenerContext) -> Arc<PopulateTracker> {
        let client: Arc<dyn RemoteClient> = remote.clone();
        PopulateTracker::new(client, Arc::new(|key: &str| format!("reviews/{key}")), ctx)
    }

    fn counting_context(store: &Arc<Store<()>>) -> (ListenerContext, Arc<AtomicUsize>) {
        let cancels = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cancels);
        let on_cancel: CancelFn = Arc::new(move |_: &RemoteError| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (ListenerContext::new("reviews", store.clone(), Some(on_cancel)), cancels)
    }

    fn tear_down(ctx: &ListenerContext, tracker: &PopulateTracker) {
        ctx.alive.store(false, Ordering::SeqCst);
        tracker.detach_all();
    }

    fn listing(remote: &MemoryRemote) -> DataSnapshot {
        listing_of(remote, "2")
    }

    fn listing_of(remote: &MemoryRemote, user: &str) -> DataSnapshot {
        let path = format!("userReviews/{user}");
        let children = record::from_value(&remote.get(&path));
        DataSnapshot::new(user, remote.get(&path), children)
    }

    fn keys(store: &Store<()>) -> Vec<String> {
        stored(store).into_iter().map(|(k, _)| k).collect()
    }

    fn stored(store: &Store<()>) -> Vec<(String, Value)> {
        store
            .sync_state()
            .records("reviews")
            .map(|records| {
                records
                    .iter()
                    .map(|r| (r.key.clone(), r.value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn publishes_once_all_joins_are_read() {
        let remote = Arc::new(MemoryRemote::online(reviews()));
        let store = Arc::new(Store::new(()));
        let tracker = tracker(&remote, &store);

        tracker.load_all(listing(&remote));
        assert!(store.sync_state().slice("reviews").is_none());
        remote.flush();

        assert_eq!(
            stored(&store),
            vec![
                ("a".to_string(), json!({"stars": 5})),
                ("d".to_string(), json!({"stars": 4})),
                ("f".to_string(), json!({"stars": 5})),
            ]
        );
        assert_eq!(tracker.keys(), vec!["a", "d", "f"]);
        assert_eq!(tracker.watch_count(), 3);
        assert!(store.sync_state().initial_values_received.contains("reviews"));
    }

    #[test]
    fn empty_listing_publishes_immediately() {
        let remote = Arc::new(MemoryRemote::online(Value::Null));
        let store = Arc::new(Store::new(()));
        let tracker = tracker(&remote, &store);
        tracker.load_all(DataSnapshot::new("2", Value::Null, Vec::new()));
        assert_eq!(store.sync_state().records("reviews").map(<[Record]>::len), Ok(0));
        assert!(tracker.is_empty());
    }

    #[test]
    fn joined_record_changes_are_followed() {
        let remote = Arc::new(MemoryRemote::online(reviews()));
        let store = Arc::new(Store::new(()));
        let tracker = tracker(&remote, &store);
        tracker.load_all(listing(&remote));
        remote.flush();

        remote.set("reviews/d/stars", json!(1));
        remote.flush();
        assert_eq!(stored(&store)[1], ("d".to_string(), json!({"stars": 1})));
    }

    #[test]
    fn add_and_remove_after_load() {
        let remote = Arc::new(MemoryRemote::online(reviews()));
        let store = Arc::new(Store::new(()));
        let tracker = tracker(&remote, &store);
        tracker.load_all(listing(&remote));
        remote.flush();

        tracker.add_child("c", Some("a".into()));
        // The join is read before the child is added.
        assert_eq!(stored(&store).len(), 3);
        remote.flush();
        let keys: Vec<String> = stored(&store).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "c", "d", "f"]);
        assert_eq!(tracker.watch_count(), 4);

        tracker.remove_child("d");
        assert_eq!(tracker.watch_count(), 3);
        let keys: Vec<String> = stored(&store).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "c", "f"]);

        // The removed record's watch no longer reports.
        remote.set("reviews/d/stars", json!(2));
        remote.flush();
        assert_eq!(stored(&store).len(), 3);
    }

    #[test]
    fn changes_while_loading_shape_the_published_order() {
        let remote = Arc::new(MemoryRemote::online(reviews()));
        let store = Arc::new(Store::new(()));
        let tracker = tracker(&remote, &store);
        tracker.load_all(listing(&remote));

        tracker.remove_child("d");
        tracker.add_child("b", None);
        remote.flush();

        let keys: Vec<String> = stored(&store).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a", "f"]);
    }

    #[test]
    fn failed_join_reads_null() {
        let remote = Arc::new(MemoryRemote::online(reviews()));
        remote.deny("reviews/d");
        let store = Arc::new(Store::new(()));
        let tracker = tracker(&remote, &store);
        tracker.load_all(listing(&remote));
        remote.flush();

        let records = stored(&store);
        assert_eq!(records[1], ("d".to_string(), Value::Null));
        assert!(store.sync_state().errors.permissions.is_some());
    }

    #[test]
    fn detach_stops_watches() {
        let remote = Arc::new(MemoryRemote::online(reviews()));
        let store = Arc::new(Store::new(()));
        let tracker = tracker(&remote, &store);
        tracker.load_all(listing(&remote));
        remote.flush();
        assert_eq!(remote.listener_count(), 3);

        tracker.detach_all();
        assert_eq!(remote.listener_count(), 0);
        assert!(tracker.is_empty());
    }

    #[test]
    fn join_errors_after_teardown_are_ignored() {
        let remote = Arc::new(MemoryRemote::online(reviews()));
        remote.deny("reviews/a");
        let store = Arc::new(Store::new(()));
        let (ctx, cancels) = counting_context(&store);
        let tracker = tracker_with(&remote, ctx.clone());

        tracker.load_all(listing(&remote));
        assert!(remote.pending_tasks() > 0);
        tear_down(&ctx, &tracker);
        remote.flush();

        let sync = store.sync_state();
        assert_eq!(sync.errors.permissions, None);
        assert!(sync.slice("reviews").is_none());
        assert_eq!(cancels.load(Ordering::SeqCst), 0);
        assert_eq!(remote.listener_count(), 0);
    }

    #[test]
    fn watch_errors_after_teardown_are_ignored() {
        let remote = Arc::new(MemoryRemote::online(reviews()));
        let store = Arc::new(Store::new(()));
        let (ctx, cancels) = counting_context(&store);
        let tracker = tracker_with(&remote, ctx.clone());
        tracker.load_all(listing(&remote));
        remote.flush();

        // The stale watch callback outlives the tracker's bookkeeping.
        tear_down(&ctx, &tracker);
        tracker.on_watch("a", 0, Err(RemoteError::permission_denied("reviews/a")));
        assert_eq!(store.sync_state().errors.permissions, None);
        assert_eq!(cancels.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn replaced_tracker_ignores_old_join_replies() {
        let remote = Arc::new(MemoryRemote::online(reviews()));
        remote.deny("reviews/a");
        let store = Arc::new(Store::new(()));
        let (old_ctx, cancels) = counting_context(&store);
        let old = tracker_with(&remote, old_ctx.clone());
        old.load_all(listing_of(&remote, "2"));

        tear_down(&old_ctx, &old);
        let (ctx, new_cancels) = counting_context(&store);
        let current = tracker_with(&remote, ctx);
        current.load_all(listing_of(&remote, "1"));
        remote.flush();

        assert_eq!(
            stored(&store),
            vec![
                ("b".to_string(), json!({"stars": 1})),
                ("c".to_string(), json!({"stars": 3})),
            ]
        );
        assert_eq!(store.sync_state().errors.permissions, None);
        assert_eq!(cancels.load(Ordering::SeqCst), 0);
        assert_eq!(new_cancels.load(Ordering::SeqCst), 0);
        assert!(old.is_empty());
        assert_eq!(current.watch_count(), 2);
    }

    #[test]
    fn failed_join_cancels_live_binding_once() {
        let remote = Arc::new(MemoryRemote::online(reviews()));
        remote.deny("reviews/a");
        remote.deny("reviews/d");
        let store = Arc::new(Store::new(()));
        let (ctx, cancels) = counting_context(&store);
        let tracker = tracker_with(&remote, ctx);
        tracker.load_all(listing(&remote));
        remote.flush();

        assert!(store.sync_state().errors.permissions.is_some());
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        assert_eq!(keys(&store), vec!["a", "d", "f"]);
    }

    #[test]
    fn move_before_join_lands_keeps_latest_position() {
        let remote = Arc::new(MemoryRemote::online(reviews()));
        let store = Arc::new(Store::new(()));
        let tracker = tracker(&remote, &store);
        tracker.load_all(listing(&remote));
        remote.flush();

        tracker.add_child("b", Some("f".into()));
        tracker.move_child("b", None);
        remote.flush();
        assert_eq!(keys(&store), vec!["b", "a", "d", "f"]);

        // Moves of published records are still dispatched.
        tracker.move_child("b", Some("d".into()));
        assert_eq!(keys(&store), vec!["a", "d", "b", "f"]);
    }
}
