//! Pool error types.

use thiserror::Error;

/// Errors surfaced by pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The process is at its configured session cap.
    #[error("capacity reached ({0} sessions)")]
    CapacityReached(usize),

    /// Another healthy instance owns this session; the caller should
    /// redirect using the coordinator's placement answer.
    #[error("ownership denied for {0}")]
    OwnershipDenied(String),

    /// No session exists for the key.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The session exists but its socket is not open.
    #[error("no active connection for {0}")]
    NoActiveConnection(String),

    /// Reconnect attempts for the key exceeded the rolling-hour budget.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// A deadline elapsed; the operation was cancelled, not retried.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Proxy allocation failed.
    #[error(transparent)]
    Proxy(#[from] wahub_proxy::ProxyError),

    /// Protocol driver failure.
    #[error(transparent)]
    Protocol(#[from] wahub_protocol::ProtocolError),

    /// Projection write failure.
    #[error(transparent)]
    State(#[from] wahub_state::StateError),

    /// Credential blob storage failure.
    #[error(transparent)]
    Blob(#[from] wahub_session_store::SessionStoreError),

    /// Coordination failure.
    #[error(transparent)]
    Coordination(#[from] wahub_coordinator::CoordError),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;
