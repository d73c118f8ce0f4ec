//! State manager error types.

use thiserror::Error;

/// Errors from projection management.
#[derive(Debug, Error)]
pub enum StateError {
    /// Document store failure.
    #[error("storage error: {0}")]
    Storage(#[from] wahub_storage::StorageError),

    /// The projection document stayed absent for an active status after
    /// retries.
    #[error("projection missing for {0}")]
    ProjectionMissing(String),

    /// Record could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StateError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result type for projection operations.
pub type StateResult<T> = Result<T, StateError>;
