//! Secret resolution error types.

use thiserror::Error;

/// Errors from secret resolution.
#[derive(Debug, Clone, Error)]
pub enum SecretsError {
    /// No backend or environment value exists for the name.
    #[error("secret not found: {0}")]
    NotFound(String),

    /// The resolved value is a placeholder, not a real credential.
    #[error("secret {0} is a placeholder value")]
    Placeholder(String),

    /// The backend failed.
    #[error("secret backend error: {0}")]
    Backend(String),
}

/// Result type for secret operations.
pub type SecretsResult<T> = Result<T, SecretsError>;
