//! CLI command implementations.

pub mod sync;
