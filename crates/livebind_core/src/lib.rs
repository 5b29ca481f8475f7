//! # LiveBind Core
//!
//! Pure building blocks of the LiveBind binding layer.
//!
//! This crate provides:
//! - Ordered record sequences maintained by "insert after previous key"
//! - The closed event vocabulary emitted by the sync engine
//! - The query model used to compare resolved bindings
//! - The sync state tree and its reducer
//! - A single-writer store that folds events and notifies subscribers
//!
//! This crate performs no I/O.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod event;
pub mod path;
mod query;
pub mod record;
mod state;
mod store;

pub use error::{CoreError, CoreResult};
pub use event::{SyncEvent, WriteId, WriteMethod};
pub use query::{Query, QueryBuilder, QueryState};
pub use record::Record;
pub use serde_json::Value;
pub use state::{
    reduce, AuthField, AuthFields, Errors, SliceValue, StoreSlice, SyncState, SyncStatus, Writes,
    STATUS_SELECTOR,
};
pub use store::{EventSink, Store, StoreState, SubscriberId};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
