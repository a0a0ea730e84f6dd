//! Error types for the agent.

use thiserror::Error;

use crate::runtime::RuntimeError;

/// Result type alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors surfaced by the supervisor and its surrounding plumbing.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("server not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("io error: {0}")]
    Io(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::Io(err.to_string())
    }
}
