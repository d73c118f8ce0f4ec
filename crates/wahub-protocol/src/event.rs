//! Events a protocol session emits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use wahub_core::CredentialBlob;

/// Close codes the service routes on.
///
/// The numeric values are the protocol's own disconnect reasons; everything
/// the lifecycle does not route specially collapses into [`Self::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectCode {
    /// Post-pairing restart demanded by the server (515).
    RestartRequired,
    /// The user logged out on the phone (401).
    LoggedOut,
    /// Another client took over this session (440).
    ConnectionReplaced,
    /// Any other close reason.
    Other(u16),
}

impl DisconnectCode {
    /// Map a raw protocol status code.
    #[must_use]
    pub fn from_code(code: u16) -> Self {
        match code {
            515 => Self::RestartRequired,
            401 => Self::LoggedOut,
            440 => Self::ConnectionReplaced,
            other => Self::Other(other),
        }
    }

    /// The raw protocol status code.
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::RestartRequired => 515,
            Self::LoggedOut => 401,
            Self::ConnectionReplaced => 440,
            Self::Other(code) => code,
        }
    }
}

/// How a message batch was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchKind {
    /// History sync batch replayed from the server.
    Append,
    /// Realtime delivery.
    Notify,
}

/// One message within a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolMessage {
    /// Protocol-assigned message id.
    pub id: String,
    /// Chat the message belongs to.
    pub chat: String,
    /// Sender identifier.
    pub sender: String,
    /// True when this device's account authored the message.
    pub from_me: bool,
    /// Server-recorded timestamp.
    pub timestamp: DateTime<Utc>,
    /// Message payload, opaque to the runtime.
    pub content: Value,
}

/// A batch of messages plus history-sync markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBatch {
    /// Delivery kind.
    pub kind: BatchKind,
    /// For history batches, whether this is the final one.
    pub is_latest: Option<bool>,
    /// Messages in server order.
    pub messages: Vec<ProtocolMessage>,
}

/// An event emitted by a protocol session, in socket order.
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    /// Credential material changed and must be persisted.
    CredentialsChanged(CredentialBlob),
    /// A QR code is ready for pairing.
    QrCode(String),
    /// The socket reached the open state.
    Opened,
    /// The socket closed.
    Closed {
        /// Why the socket closed.
        code: DisconnectCode,
        /// Driver-provided detail for logs.
        message: String,
    },
    /// A batch of messages arrived.
    Messages(MessageBatch),
    /// Delivery/read state changed for previously sent messages.
    MessageStatus(Value),
    /// A peer's presence changed.
    Presence(Value),
    /// Chat metadata changed.
    ChatUpdate(Value),
    /// Contact metadata changed.
    ContactUpdate(Value),
    /// Contacts received during history sync.
    ContactsUpsert(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_code_round_trip() {
        assert_eq!(DisconnectCode::from_code(515), DisconnectCode::RestartRequired);
        assert_eq!(DisconnectCode::from_code(401), DisconnectCode::LoggedOut);
        assert_eq!(DisconnectCode::from_code(440), DisconnectCode::ConnectionReplaced);
        assert_eq!(DisconnectCode::from_code(408), DisconnectCode::Other(408));
        assert_eq!(DisconnectCode::from_code(515).code(), 515);
    }
}
