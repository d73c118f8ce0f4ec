//! Connection status vocabulary.
//!
//! Two views exist: [`ConnectionPhase`] is the pool's in-memory state
//! machine, and [`ConnectionStatus`] is the external projection vocabulary
//! (a superset, adding `initializing`, `pending_recovery`, and
//! `logged_out`, which only other instances or shutdown paths write).

use std::fmt;

use serde::{Deserialize, Serialize};

/// In-memory lifecycle phase of a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    /// Socket is being established.
    Connecting,
    /// A QR code has been emitted and awaits scanning.
    QrPending,
    /// The protocol-mandated post-pairing restart is in flight.
    Restarting,
    /// Initial history import, contact stage.
    ImportingContacts,
    /// Initial history import, message stage.
    ImportingMessages,
    /// Steady state.
    Connected,
    /// Socket closed, no reconnect scheduled.
    Disconnected,
    /// Reconnect attempts exhausted or fatal error.
    Failed,
}

impl ConnectionPhase {
    /// The projection status this phase maps to.
    #[must_use]
    pub fn as_status(self) -> ConnectionStatus {
        match self {
            Self::Connecting => ConnectionStatus::Connecting,
            Self::QrPending => ConnectionStatus::QrPending,
            Self::Restarting => ConnectionStatus::Restarting,
            Self::ImportingContacts => ConnectionStatus::ImportingContacts,
            Self::ImportingMessages => ConnectionStatus::ImportingMessages,
            Self::Connected => ConnectionStatus::Connected,
            Self::Disconnected => ConnectionStatus::Disconnected,
            Self::Failed => ConnectionStatus::Failed,
        }
    }

    /// True while the session holds (or is about to hold) an open socket.
    #[must_use]
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Disconnected | Self::Failed)
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_status().as_str())
    }
}

/// Externally visible session status (the projection vocabulary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Waiting for the QR code to be scanned.
    QrPending,
    /// Socket is being established.
    Connecting,
    /// Post-connect setup before any state is known.
    Initializing,
    /// The protocol-mandated post-pairing restart is in flight.
    Restarting,
    /// History import, contact stage.
    ImportingContacts,
    /// History import, message stage.
    ImportingMessages,
    /// Steady state.
    Connected,
    /// Not connected; a user retry may succeed.
    Disconnected,
    /// Not connected; reconnects exhausted or fatal error.
    Failed,
    /// Instance shut down preserving the session; awaiting adoption.
    PendingRecovery,
    /// User logged out; credentials destroyed.
    LoggedOut,
}

impl ConnectionStatus {
    /// The snake_case wire form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QrPending => "qr_pending",
            Self::Connecting => "connecting",
            Self::Initializing => "initializing",
            Self::Restarting => "restarting",
            Self::ImportingContacts => "importing_contacts",
            Self::ImportingMessages => "importing_messages",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::PendingRecovery => "pending_recovery",
            Self::LoggedOut => "logged_out",
        }
    }

    /// Parse the snake_case wire form.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "qr_pending" => Some(Self::QrPending),
            "connecting" => Some(Self::Connecting),
            "initializing" => Some(Self::Initializing),
            "restarting" => Some(Self::Restarting),
            "importing_contacts" => Some(Self::ImportingContacts),
            "importing_messages" => Some(Self::ImportingMessages),
            "connected" => Some(Self::Connected),
            "disconnected" => Some(Self::Disconnected),
            "failed" => Some(Self::Failed),
            "pending_recovery" => Some(Self::PendingRecovery),
            "logged_out" => Some(Self::LoggedOut),
            _ => None,
        }
    }

    /// Terminal statuses end a session's presence on this instance.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::LoggedOut)
    }

    /// True during either import stage.
    #[must_use]
    pub fn is_importing(self) -> bool {
        matches!(self, Self::ImportingContacts | Self::ImportingMessages)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of the initial history import, derived from counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Import announced, nothing received yet.
    Started,
    /// Contacts are arriving.
    ImportingContacts,
    /// Messages are arriving.
    ImportingMessages,
    /// Terminal import marker observed.
    Completed,
}

impl SyncStatus {
    /// The snake_case wire form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::ImportingContacts => "importing_contacts",
            Self::ImportingMessages => "importing_messages",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            ConnectionStatus::QrPending,
            ConnectionStatus::Connecting,
            ConnectionStatus::Initializing,
            ConnectionStatus::Restarting,
            ConnectionStatus::ImportingContacts,
            ConnectionStatus::ImportingMessages,
            ConnectionStatus::Connected,
            ConnectionStatus::Disconnected,
            ConnectionStatus::Failed,
            ConnectionStatus::PendingRecovery,
            ConnectionStatus::LoggedOut,
        ] {
            assert_eq!(ConnectionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ConnectionStatus::parse("nonsense"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ConnectionStatus::Disconnected.is_terminal());
        assert!(ConnectionStatus::Failed.is_terminal());
        assert!(ConnectionStatus::LoggedOut.is_terminal());
        assert!(!ConnectionStatus::PendingRecovery.is_terminal());
        assert!(!ConnectionStatus::Connected.is_terminal());
    }

    #[test]
    fn test_phase_maps_restarting() {
        assert_eq!(
            ConnectionPhase::Restarting.as_status(),
            ConnectionStatus::Restarting
        );
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&ConnectionStatus::ImportingMessages).unwrap();
        assert_eq!(json, "\"importing_messages\"");
    }
}
