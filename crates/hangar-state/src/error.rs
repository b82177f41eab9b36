//! Error types for the hangar store.

use thiserror::Error;

/// Result type alias for store operations.
pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("runner not found: {0}")]
    RunnerNotFound(String),

    #[error("external id not found: {0}")]
    ExternalIdNotFound(String),

    #[error("agent is offline: {0}")]
    AgentOffline(String),
}

impl StateError {
    /// Any of the not-found variants.
    pub fn is_not_found(&self) -> bool {
        !matches!(self, StateError::AgentOffline(_))
    }
}
