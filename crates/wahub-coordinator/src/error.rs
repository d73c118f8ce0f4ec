//! Coordinator error types.

use thiserror::Error;

/// Errors from coordination operations.
#[derive(Debug, Error)]
pub enum CoordError {
    /// Document store failure.
    #[error("storage error: {0}")]
    Storage(#[from] wahub_storage::StorageError),

    /// Record could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoordError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result type for coordination operations.
pub type CoordResult<T> = Result<T, CoordError>;
