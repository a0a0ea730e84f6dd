//! Error types for the placement engine.

use thiserror::Error;

use gantry_state::StateError;

/// Result type alias for placement operations.
pub type PlacementResult<T> = Result<T, PlacementError>;

/// Errors that can occur during placement.
#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("node unavailable: {0}")]
    NodeUnavailable(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("no free allocation on node {0}")]
    NoAvailableAllocation(String),

    #[error("state error: {0}")]
    State(#[from] StateError),
}
