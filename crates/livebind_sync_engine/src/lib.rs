//! # LiveBind Sync Engine
//!
//! Mirrors a remote realtime database into a [`livebind_core::Store`].
//!
//! This crate provides:
//! - Binding declarations and their resolution against state
//! - A subscription manager that diffs resolved bindings
//! - Listener wiring for objects, primitives, arrays and populated arrays
//! - A one-shot "initialized" signal
//! - Tracked writes and auth flows
//! - The remote client abstraction and an in-memory implementation
//!
//! ## Architecture
//!
//! Every state change re-resolves the bindings. When the resolved snapshot
//! differs from the last one, the manager tears down and attaches listeners;
//! remote deliveries become events folded by the store's reducer, which in
//! turn triggers the next resolution.
//!
//! ## Key Invariants
//!
//! - A binding has at most one live subscription
//! - Deliveries for torn-down subscriptions are dropped
//! - No lock is held while an event is dispatched
//! - The initialized signal fires at most once

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod binding;
mod completion;
mod config;
mod error;
mod manager;
mod populate;
pub mod remote;
mod session;
mod subscription;
mod write;

pub use auth::{error_message, AuthFlows, AuthProvider, AuthReply, OAuthFlow};
pub use binding::{
    resolve, validate_bindings, Binding, BindingKind, PathFn, PathParamsFn, PathSource,
    PopulateFn, QueryFn, ResolvedBinding, ResolvedBindings, Shape,
};
pub use completion::{CompletionTracker, Initialized};
pub use config::{AuthHook, SyncConfig};
pub use error::{BindError, BindResult, RemoteError, RemoteResult};
pub use manager::{SubscriptionManager, SyncOutcome};
pub use populate::PopulateTracker;
pub use remote::{DataSnapshot, Delivery, EventKind, ListenerHandle, MemoryRemote, Pending, RemoteClient};
pub use session::{start_sync, SyncSession};
pub use subscription::{CancelFn, SubscriptionPhase};
pub use write::{PendingWrite, WriteBinding, WritePath, WritePathFn, Writer};
