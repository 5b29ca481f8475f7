//! Write intents.
//!
//! Writes are fire-and-forget: each one gets a fresh [`WriteId`], is
//! recorded as processing under its path, and is either cleared on
//! acknowledgement or moved to the path's error list. Failed writes are
//! never retried.

use std::fmt;
use std::sync::Arc;

use livebind_core::{path, EventSink, StoreState, SyncEvent, Value, WriteId, WriteMethod};
use tracing::{debug, warn};

use crate::error::{BindError, BindResult, RemoteResult};
use crate::remote::{Pending, RemoteClient};

/// A write in flight.
#[derive(Debug)]
pub struct PendingWrite {
    id: WriteId,
    path: String,
    pending: Pending,
}

impl PendingWrite {
    /// Identifier of the write.
    pub fn id(&self) -> WriteId {
        self.id
    }

    /// Normalized target path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Waits for the remote acknowledgement.
    pub async fn wait(self) -> RemoteResult<()> {
        self.pending.wait().await
    }
}

/// Issues writes and records their lifecycle.
#[derive(Clone)]
pub struct Writer {
    remote: Arc<dyn RemoteClient>,
    sink: Arc<dyn EventSink>,
}

impl Writer {
    /// Creates a writer.
    pub fn new(remote: Arc<dyn RemoteClient>, sink: Arc<dyn EventSink>) -> Self {
        Self { remote, sink }
    }

    /// Writes `value` at `path` with `method`.
    pub fn write(&self, method: WriteMethod, target: &str, value: Value) -> PendingWrite {
        let id = WriteId::new();
        let target = path::normalize(target);
        debug!(%id, %method, path = %target, "write started");
        self.sink.dispatch(SyncEvent::WriteStarted {
            id,
            path: target.clone(),
            method,
        });

        let (pending, complete) = Pending::channel();
        let sink = Arc::clone(&self.sink);
        let acked = target.clone();
        self.remote.write(
            &target,
            method,
            value,
            Box::new(move |result: RemoteResult<()>| {
                match &result {
                    Ok(()) => sink.dispatch(SyncEvent::WriteCompleted { id, path: acked }),
                    Err(error) => {
                        warn!(%id, path = %acked, %error, "write failed");
                        sink.dispatch(SyncEvent::WriteFailed {
                            id,
                            path: acked,
                            message: error.to_string(),
                        });
                    }
                }
                complete(result);
            }),
        );
        PendingWrite {
            id,
            path: target,
            pending,
        }
    }

    /// Dismisses recorded errors for `path`.
    pub fn clear_errors(&self, target: &str) {
        self.sink.dispatch(SyncEvent::WriteErrorsCleared {
            path: path::normalize(target),
        });
    }
}

/// Computes a write path from state.
pub type WritePathFn<S> = Arc<dyn Fn(&StoreState<S>) -> Option<String> + Send + Sync>;

/// Where a write binding writes.
pub enum WritePath<S> {
    /// A fixed path.
    Literal(String),
    /// A path computed from state at submit time.
    Derived(WritePathFn<S>),
}

impl<S> Clone for WritePath<S> {
    fn clone(&self) -> Self {
        match self {
            WritePath::Literal(path) => WritePath::Literal(path.clone()),
            WritePath::Derived(f) => WritePath::Derived(Arc::clone(f)),
        }
    }
}

/// A validated write target: a path and a method.
pub struct WriteBinding<S> {
    path: WritePath<S>,
    method: WriteMethod,
}

impl<S> Clone for WriteBinding<S> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            method: self.method,
        }
    }
}

impl<S> fmt::Debug for WriteBinding<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = match &self.path {
            WritePath::Literal(path) => path.as_str(),
            WritePath::Derived(_) => "<derived>",
        };
        f.debug_struct("WriteBinding")
            .field("path", &path)
            .field("method", &self.method)
            .finish()
    }
}

fn parse_method(method: &str) -> BindResult<WriteMethod> {
    method
        .parse()
        .map_err(|_| BindError::UnsupportedWriteMethod(method.to_string()))
}

impl<S> WriteBinding<S> {
    /// Creates a binding writing to a fixed path.
    pub fn new(target: impl Into<String>, method: &str) -> BindResult<Self> {
        let target = target.into();
        if target.trim().is_empty() {
            return Err(BindError::InvalidWritePath);
        }
        Ok(Self {
            path: WritePath::Literal(target),
            method: parse_method(method)?,
        })
    }

    /// Creates a binding whose path is computed from state.
    pub fn derived<F>(target: F, method: &str) -> BindResult<Self>
    where
        F: Fn(&StoreState<S>) -> Option<String> + Send + Sync + 'static,
    {
        Ok(Self {
            path: WritePath::Derived(Arc::new(target)),
            method: parse_method(method)?,
        })
    }

    /// The write method.
    pub fn method(&self) -> WriteMethod {
        self.method
    }

    /// The normalized target path for `state`.
    pub fn path_for(&self, state: &StoreState<S>) -> Option<String> {
        let target = match &self.path {
            WritePath::Literal(target) => Some(target.clone()),
            WritePath::Derived(f) => f(state),
        }?;
        if target.trim().is_empty() {
            return None;
        }
        Some(path::normalize(&target))
    }

    /// Writes `value` to the path resolved against `state`.
    pub fn submit(&self, writer: &Writer, state: &StoreState<S>, value: Value) -> BindResult<PendingWrite> {
        let target = self.path_for(state).ok_or(BindError::InvalidWritePath)?;
        Ok(writer.write(self.method, &target, value))
    }

    /// Dismisses the errors recorded for this binding's path.
    pub fn clear_errors(&self, writer: &Writer, state: &StoreState<S>) {
        if let Some(target) = self.path_for(state) {
            writer.clear_errors(&target);
        }
    }

    /// Returns true while a write to this binding's path is in flight.
    pub fn is_processing(&self, state: &StoreState<S>) -> bool {
        self.path_for(state)
            .is_some_and(|target| !state.sync.writes.processing_for(&target).is_empty())
    }

    /// Errors recorded for this binding's path.
    pub fn errors(&self, state: &StoreState<S>) -> Vec<String> {
        self.path_for(state)
            .map(|target| state.sync.writes.errors_for(&target).to_vec())
            .unwrap_or_default()
    }
}
