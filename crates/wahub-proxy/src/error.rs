//! Proxy allocation error types.

use thiserror::Error;
use wahub_core::CountryCode;

/// Errors from proxy allocation.
#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    /// The vendor has no IPs for the country (and fallback was exhausted
    /// or forbidden).
    #[error("PROXY_UNAVAILABLE:{0}")]
    Unavailable(CountryCode),

    /// The vendor failed transiently and retries were exhausted.
    #[error("PROXY_VENDOR_ERROR: {0}")]
    VendorError(String),

    /// Vendor credentials are missing or placeholders.
    #[error("proxy credentials invalid: {0}")]
    InvalidCredentials(String),

    /// The fallback oracle produced nothing usable.
    #[error("country fallback failed: {0}")]
    OracleFailed(String),

    /// No assignment exists for the session.
    #[error("no proxy assignment for {0}")]
    NotAssigned(String),
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;
