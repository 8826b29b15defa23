//! Error taxonomy shared by every backend and the orchestration layer.

use thiserror::Error;

/// Result type used across backend traits.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors surfaced by queues, stores and the orchestration layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    /// Backend unreachable or timed out. Retriable.
    #[error("transport error: {0}")]
    Transport(String),

    /// Key or identifier absent. Not retriable.
    #[error("not found: {0}")]
    NotFound(String),

    /// Expected race outcome, such as a claim already held elsewhere.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Work item allocated but never enqueued.
    #[error("dispatch error: {0}")]
    Dispatch(String),

    /// Analysis engine failed or crashed.
    #[error("engine failure: {0}")]
    EngineFailure(String),

    /// Cancelled while waiting.
    #[error("cancelled")]
    Cancelled,

    /// Rejected job submission.
    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    /// Non-recoverable backend condition (schema, connection at startup).
    #[error("fatal: {0}")]
    Fatal(String),
}

impl OrchestratorError {
    /// Whether retrying the same call may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, OrchestratorError::Transport(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, OrchestratorError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, OrchestratorError::Conflict(_))
    }
}

/// Invalid orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },

    #[error("{0}")]
    Constraint(String),
}
