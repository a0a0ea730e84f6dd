//! gantry-state — embedded inventory store for Gantry.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state management for nodes, locations, allocations, servers, and backups.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{node_id}:{port:05}:{ip}`, `{server_id}:{backup_id}`)
//! enable efficient prefix scans for related records. Allocation keys embed
//! a zero-padded port so iterating a node's allocations in key order visits
//! them in ascending port order.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. Capacity accounting happens through
//! the `reserve_on_node`/`release_on_node` primitives, which do the whole
//! check-bind-bump sequence inside a single write transaction.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{ReserveOutcome, StateStore};
pub use types::*;
