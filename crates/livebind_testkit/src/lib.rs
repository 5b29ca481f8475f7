//! # LiveBind Testkit
//!
//! Test utilities for LiveBind.
//!
//! This crate provides:
//! - A harness that runs a sync session against an in-memory remote
//! - Data fixtures for the common scenarios
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use livebind_testkit::prelude::*;
//!
//! #[test]
//! fn posts_are_mirrored() {
//!     let harness = Harness::start(posts_fixture(), vec![Binding::array("posts", "posts")]);
//!     harness.settle();
//!     assert_eq!(harness.keys("posts"), vec!["0", "1"]);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use livebind_core::{Record, Store, StoreState, SyncEvent, SyncState, WriteMethod};
    pub use livebind_sync_engine::{
        start_sync, Binding, BindingKind, MemoryRemote, RemoteClient, SyncConfig, SyncSession,
    };
}

pub use fixtures::*;
pub use generators::*;
pub use livebind_sync_engine::MemoryRemote;
