//! Error taxonomy for lifecycle and node administration operations.

use thiserror::Error;

use gantry_placement::PlacementError;
use gantry_state::StateError;

/// Result type alias for orchestrator operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Errors surfaced by the orchestrator.
///
/// The variants map one-to-one onto API status codes: callers can rely on
/// `Conflict` meaning "valid request, wrong state" and `RemoteFailure`
/// meaning "the node did not cooperate".
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("remote failure: {0}")]
    RemoteFailure(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("state error: {0}")]
    State(#[from] StateError),
}

impl From<PlacementError> for LifecycleError {
    fn from(err: PlacementError) -> Self {
        match err {
            PlacementError::NodeNotFound(msg) => LifecycleError::NotFound(msg),
            PlacementError::NodeUnavailable(msg) => LifecycleError::Conflict(msg),
            PlacementError::ResourceExhausted(msg) => LifecycleError::ResourceExhausted(msg),
            PlacementError::NoAvailableAllocation(node) => {
                LifecycleError::ResourceExhausted(format!("no free allocation on node {node}"))
            }
            PlacementError::State(e) => LifecycleError::State(e),
        }
    }
}
