//! Core Nimbus types and traits.
//!
//! This crate defines what every Nimbus crate agrees on:
//!
//! - The row-store contract ([`RowStore`]) that the engine consumes. Backends
//!   live in their own crates (`nimbus_store_memory`, `nimbus_store_redb`).
//! - Row values, records, filters and queries ([`row`]).
//! - [`TableSet`], an in-memory table set with an undo journal for
//!   backends that keep everything in memory.
//!
//! The engine only ever talks to a store from inside a unit granted by its
//! per-pool transaction queue, so stores may assume a single writer.

pub mod row;
pub mod store;
pub mod tables;

// Test utilities (behind feature flag)
#[cfg(feature = "testutil")]
pub mod testutil;

pub use row::{Fields, Filter, OrderBy, Query, Record, RowId, Value};
pub use store::{RowStore, StoreError, StoreResult};
pub use tables::{Change, TableSet};
