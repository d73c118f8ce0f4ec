//! Core error types.

use thiserror::Error;

/// Errors from constructing core identity types.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    /// The phone number could not be normalized to E.164.
    #[error("invalid phone number: {0}")]
    InvalidPhoneNumber(String),

    /// The user id is empty or contains path-hostile characters.
    #[error("invalid user id: {0}")]
    InvalidUserId(String),

    /// The country code is not a two-letter ISO 3166 alpha-2 code.
    #[error("invalid country code: {0}")]
    InvalidCountryCode(String),
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
