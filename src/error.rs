//! Error types for Trueno-Lab

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Trueno-Lab error types
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration or state transition rejected before anything was persisted
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Unknown identifier
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Entity kind ("experiment", "client", "schedule", ...)
        kind: &'static str,
        /// The identifier that was looked up
        id: String,
    },

    /// Not enough idle clients, or a round is already in progress
    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    /// Task handler or training unit failed; eligible for retry
    #[error("Transient execution failure: {0}")]
    TransientExecution(String),

    /// Task exhausted its retries
    #[error("Task {task_id} failed permanently: {reason}")]
    TerminalExecution {
        /// Task that gave up
        task_id: String,
        /// Last error observed
        reason: String,
    },

    /// Key-value store failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Encoding or decoding of a persisted record failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for [`Error::NotFound`].
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether the scheduler may retry the failed operation.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientExecution(_) | Self::Persistence(_) | Self::InsufficientResources(_)
        )
    }
}
