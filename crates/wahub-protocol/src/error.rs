//! Protocol seam error types.

use thiserror::Error;

/// Errors surfaced by a protocol driver.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    /// The socket could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The operation needs an open socket and there is none.
    #[error("not connected")]
    NotConnected,

    /// A send was accepted by neither the socket nor the server.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// A network-level fault (refused, timed out, proxy failure).
    ///
    /// The pool treats this class as rotate-proxy-then-reconnect.
    #[error("network error: {0}")]
    Network(String),

    /// The driver rejected the operation.
    #[error("protocol error: {0}")]
    Driver(String),
}

impl ProtocolError {
    /// True for faults that implicate the egress path rather than the
    /// session itself.
    #[must_use]
    pub fn is_network(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::SendFailed(msg) | Self::ConnectionFailed(msg) | Self::Driver(msg) => {
                let lower = msg.to_ascii_lowercase();
                lower.contains("econnrefused")
                    || lower.contains("etimedout")
                    || lower.contains("proxy")
            }
            Self::NotConnected => false,
        }
    }
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_classification() {
        assert!(ProtocolError::Network("socket hangup".into()).is_network());
        assert!(ProtocolError::SendFailed("connect ECONNREFUSED 1.2.3.4".into()).is_network());
        assert!(ProtocolError::SendFailed("ETIMEDOUT".into()).is_network());
        assert!(ProtocolError::Driver("proxy tunnel rejected".into()).is_network());
        assert!(!ProtocolError::SendFailed("message too large".into()).is_network());
        assert!(!ProtocolError::NotConnected.is_network());
    }
}
