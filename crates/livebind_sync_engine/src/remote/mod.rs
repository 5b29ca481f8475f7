//! Remote realtime-database boundary.
//!
//! The engine only talks to the remote side through [`RemoteClient`]. Every
//! operation reports through a callback receiving a [`RemoteResult`], and an
//! implementation must never invoke a callback from inside the call that
//! registered it.

mod memory;

pub use memory::{MemoryRemote, PUSH_KEY_PREFIX};

use std::sync::Arc;

use livebind_core::{Query, Record, Value, WriteMethod};
use tokio::sync::oneshot;

use crate::error::{RemoteError, RemoteResult};

/// Notification kinds a listener can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The whole node, on every change.
    Value,
    /// A child entered the query window.
    ChildAdded,
    /// A child's value changed.
    ChildChanged,
    /// A child changed position.
    ChildMoved,
    /// A child left the query window.
    ChildRemoved,
}

impl EventKind {
    /// The four child-level kinds, in the order they are attached.
    pub const CHILD_KINDS: [EventKind; 4] = [
        EventKind::ChildAdded,
        EventKind::ChildChanged,
        EventKind::ChildMoved,
        EventKind::ChildRemoved,
    ];
}

/// A read of one node.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSnapshot {
    /// Key of the node.
    pub key: String,
    /// Value of the node, `Null` if it does not exist.
    pub value: Value,
    /// Children of the node in query order.
    pub children: Vec<Record>,
}

impl DataSnapshot {
    /// Creates a snapshot.
    pub fn new(key: impl Into<String>, value: Value, children: Vec<Record>) -> Self {
        Self {
            key: key.into(),
            value,
            children,
        }
    }

    /// Returns true if the node holds data.
    pub fn exists(&self) -> bool {
        !self.value.is_null()
    }

    /// Converts the snapshot into a record keyed by its node key.
    pub fn into_record(self) -> Record {
        Record::new(self.key, self.value)
    }
}

/// A single listener notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Value or child snapshot.
    pub snapshot: DataSnapshot,
    /// Key of the preceding sibling for added and moved children.
    pub previous_key: Option<String>,
}

/// Handle to a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerHandle(pub u64);

/// Callback receiving listener notifications.
pub type ListenerCallback = Arc<dyn Fn(RemoteResult<Delivery>) + Send + Sync>;

/// Callback receiving a one-shot read.
pub type ReadCallback = Box<dyn FnOnce(RemoteResult<DataSnapshot>) + Send>;

/// Callback receiving a write acknowledgement.
pub type WriteCallback = Box<dyn FnOnce(RemoteResult<()>) + Send>;

/// Callback receiving connectivity changes.
pub type ConnectivityCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Callback receiving auth changes, `None` when signed out.
pub type AuthCallback = Arc<dyn Fn(Option<Value>) + Send + Sync>;

/// Client of a remote realtime database.
///
/// A listener that receives an `Err` is considered cancelled by the remote
/// and receives nothing further.
pub trait RemoteClient: Send + Sync {
    /// Registers a listener of `kind` on `query`.
    fn observe(&self, query: &Query, kind: EventKind, callback: ListenerCallback) -> ListenerHandle;

    /// Removes a listener. Unknown handles are ignored.
    fn stop_observing(&self, handle: ListenerHandle);

    /// Reads the current value of `query` once.
    fn read_once(&self, query: &Query, reply: ReadCallback);

    /// Writes `value` at `path`.
    fn write(&self, path: &str, method: WriteMethod, value: Value, reply: WriteCallback);

    /// Observes connectivity. The current state is reported first.
    fn observe_connectivity(&self, callback: ConnectivityCallback) -> ListenerHandle;

    /// Observes the signed-in user. The current user is reported first.
    fn observe_auth(&self, callback: AuthCallback) -> ListenerHandle;
}

/// Awaitable acknowledgement of a remote operation.
#[derive(Debug)]
pub struct Pending {
    rx: oneshot::Receiver<RemoteResult<()>>,
}

impl Pending {
    /// Creates a pending acknowledgement and the callback completing it.
    pub fn channel() -> (Self, impl FnOnce(RemoteResult<()>) + Send + 'static) {
        let (tx, rx) = oneshot::channel();
        let complete = move |result| {
            let _ = tx.send(result);
        };
        (Self { rx }, complete)
    }

    /// Waits for the acknowledgement.
    pub async fn wait(self) -> RemoteResult<()> {
        self.rx.await.unwrap_or(Err(RemoteError::Disconnected))
    }

    /// Returns the acknowledgement if it already arrived.
    pub fn try_result(&mut self) -> Option<RemoteResult<()>> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshot_into_record() {
        let snapshot = DataSnapshot::new("a", json!({"title": "A"}), Vec::new());
        assert!(snapshot.exists());
        let record = snapshot.into_record();
        assert_eq!(record.key, "a");
        assert!(!DataSnapshot::new("b", Value::Null, Vec::new()).exists());
    }

    #[tokio::test]
    async fn pending_resolves() {
        let (pending, complete) = Pending::channel();
        complete(Err(RemoteError::failed("nope")));
        assert_eq!(pending.wait().await, Err(RemoteError::failed("nope")));
    }

    #[tokio::test]
    async fn dropped_pending_reports_disconnect() {
        let (pending, complete) = Pending::channel();
        drop(complete);
        assert_eq!(pending.wait().await, Err(RemoteError::Disconnected));
    }
}
