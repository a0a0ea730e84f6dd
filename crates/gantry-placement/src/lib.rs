//! gantry-placement — capacity reservation for the Gantry control plane.
//!
//! The placement engine decides whether a server fits on a node and, if so,
//! atomically reserves memory, disk, CPU, and a port allocation for it.
//! Placement is deliberately simple: the caller names the node, and the
//! engine hands out the node's lowest free port. There is no bin-packing,
//! scoring, or preemption.
//!
//! Failure is side-effect-free: a reservation that fails any check leaves
//! the node's counters and allocations untouched.

pub mod engine;
pub mod error;

pub use engine::PlacementEngine;
pub use error::{PlacementError, PlacementResult};
