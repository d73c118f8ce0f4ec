//! Configuration error types.

use thiserror::Error;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable was set to a value that does not parse.
    #[error("invalid value for {variable}: {message}")]
    InvalidValue {
        /// The environment variable.
        variable: &'static str,
        /// What was wrong.
        message: String,
    },

    /// A required variable is missing.
    #[error("missing required variable {variable}")]
    Missing {
        /// The environment variable.
        variable: &'static str,
    },

    /// The combination of settings is inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
