//! Domain event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wahub_core::{ConnectionStatus, CountryCode, SessionKey};

/// Metadata attached to every event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event id.
    pub event_id: Uuid,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Component that emitted the event, e.g. `"pool"`.
    pub source: String,
}

impl EventMetadata {
    /// Create metadata stamped with the current time.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
        }
    }
}

/// Events published on the hub's bus.
///
/// The lifecycle topics mirror what downstream consumers (UI, message
/// routers) subscribe to; the operational topics (`persist_failed`,
/// `capacity_reached`, `drift_alert`) exist for alerting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    /// A QR code is ready to be scanned.
    QrGenerated {
        /// Event metadata.
        metadata: EventMetadata,
        /// Session the QR belongs to.
        key: SessionKey,
        /// The QR payload string.
        qr: String,
    },
    /// A session's projected status changed.
    ConnectionUpdate {
        /// Event metadata.
        metadata: EventMetadata,
        /// Session that changed.
        key: SessionKey,
        /// New status.
        status: ConnectionStatus,
    },
    /// An API-originated outbound message was accepted by the protocol.
    MessageSent {
        /// Event metadata.
        metadata: EventMetadata,
        /// Sending session.
        key: SessionKey,
        /// Destination in E.164.
        to: String,
        /// Protocol-assigned message id.
        message_id: String,
    },
    /// A realtime inbound message arrived.
    MessageReceived {
        /// Event metadata.
        metadata: EventMetadata,
        /// Receiving session.
        key: SessionKey,
        /// Protocol message payload, forwarded verbatim.
        message: serde_json::Value,
    },
    /// Delivery/read state of a previously sent message changed.
    MessageStatusUpdate {
        /// Event metadata.
        metadata: EventMetadata,
        /// Session the update belongs to.
        key: SessionKey,
        /// Protocol status payload, forwarded verbatim.
        update: serde_json::Value,
    },
    /// Peer presence changed.
    PresenceUpdate {
        /// Event metadata.
        metadata: EventMetadata,
        /// Session the update belongs to.
        key: SessionKey,
        /// Protocol presence payload, forwarded verbatim.
        presence: serde_json::Value,
    },
    /// Chat metadata changed (archived, pinned, renamed).
    ChatUpdated {
        /// Event metadata.
        metadata: EventMetadata,
        /// Session the update belongs to.
        key: SessionKey,
        /// Protocol chat payload, forwarded verbatim.
        update: serde_json::Value,
    },
    /// Contact metadata changed.
    ContactUpdated {
        /// Event metadata.
        metadata: EventMetadata,
        /// Session the update belongs to.
        key: SessionKey,
        /// Protocol contact payload, forwarded verbatim.
        update: serde_json::Value,
    },
    /// A peer started or stopped typing.
    TypingIndicator {
        /// Event metadata.
        metadata: EventMetadata,
        /// Session the indicator belongs to.
        key: SessionKey,
        /// Chat the indicator applies to.
        chat: String,
        /// Whether typing started (`true`) or stopped.
        typing: bool,
    },
    /// The initial history import finished.
    HistorySynced {
        /// Event metadata.
        metadata: EventMetadata,
        /// Session that finished importing.
        key: SessionKey,
        /// Contacts imported.
        contacts: u64,
        /// Messages imported.
        messages: u64,
    },
    /// Contact import finished.
    ContactsSynced {
        /// Event metadata.
        metadata: EventMetadata,
        /// Session that finished.
        key: SessionKey,
        /// Contacts imported.
        count: u64,
    },
    /// Message import finished.
    MessagesSynced {
        /// Event metadata.
        metadata: EventMetadata,
        /// Session that finished.
        key: SessionKey,
        /// Messages imported.
        count: u64,
    },
    /// The initial history import began.
    SyncStarted {
        /// Event metadata.
        metadata: EventMetadata,
        /// Session that started importing.
        key: SessionKey,
    },
    /// Progress counts during the initial history import.
    SyncProgress {
        /// Event metadata.
        metadata: EventMetadata,
        /// Session being imported.
        key: SessionKey,
        /// Contacts so far.
        contacts: u64,
        /// Messages so far.
        messages: u64,
    },
    /// A projection write could not be persisted after retries.
    PersistFailed {
        /// Event metadata.
        metadata: EventMetadata,
        /// Session whose write failed.
        key: SessionKey,
        /// Status that could not be written.
        status: ConnectionStatus,
    },
    /// An attach was refused because the process is at capacity.
    CapacityReached {
        /// Event metadata.
        metadata: EventMetadata,
        /// Session that was refused.
        key: SessionKey,
        /// The configured limit.
        limit: usize,
    },
    /// A reconciliation sweep found an unusual number of drifts.
    DriftAlert {
        /// Event metadata.
        metadata: EventMetadata,
        /// Drifts detected in the sweep.
        detected: u64,
        /// Drifts repaired in the sweep.
        fixed: u64,
    },
    /// A session's egress IP was rotated after a network error.
    ProxyRotated {
        /// Event metadata.
        metadata: EventMetadata,
        /// Session whose proxy rotated.
        key: SessionKey,
        /// Country of the replacement IP.
        country: CountryCode,
    },
    /// This instance registered with the coordinator.
    InstanceStarted {
        /// Event metadata.
        metadata: EventMetadata,
        /// Instance id.
        instance_id: String,
    },
    /// This instance began shutting down.
    InstanceShutdown {
        /// Event metadata.
        metadata: EventMetadata,
        /// Instance id.
        instance_id: String,
    },
}

impl HubEvent {
    /// The snake_case topic name of this event.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::QrGenerated { .. } => "qr_generated",
            Self::ConnectionUpdate { .. } => "connection_update",
            Self::MessageSent { .. } => "message_sent",
            Self::MessageReceived { .. } => "message_received",
            Self::MessageStatusUpdate { .. } => "message_status_update",
            Self::PresenceUpdate { .. } => "presence_update",
            Self::ChatUpdated { .. } => "chat_update",
            Self::ContactUpdated { .. } => "contact_update",
            Self::TypingIndicator { .. } => "typing_indicator",
            Self::HistorySynced { .. } => "history_synced",
            Self::ContactsSynced { .. } => "contacts_synced",
            Self::MessagesSynced { .. } => "messages_synced",
            Self::SyncStarted { .. } => "sync_started",
            Self::SyncProgress { .. } => "sync_progress",
            Self::PersistFailed { .. } => "persist_failed",
            Self::CapacityReached { .. } => "capacity_reached",
            Self::DriftAlert { .. } => "drift_alert",
            Self::ProxyRotated { .. } => "proxy_rotated",
            Self::InstanceStarted { .. } => "instance_started",
            Self::InstanceShutdown { .. } => "instance_shutdown",
        }
    }

    /// The session key the event concerns, when it concerns one.
    #[must_use]
    pub fn session_key(&self) -> Option<&SessionKey> {
        match self {
            Self::QrGenerated { key, .. }
            | Self::ConnectionUpdate { key, .. }
            | Self::MessageSent { key, .. }
            | Self::MessageReceived { key, .. }
            | Self::MessageStatusUpdate { key, .. }
            | Self::PresenceUpdate { key, .. }
            | Self::ChatUpdated { key, .. }
            | Self::ContactUpdated { key, .. }
            | Self::TypingIndicator { key, .. }
            | Self::HistorySynced { key, .. }
            | Self::ContactsSynced { key, .. }
            | Self::MessagesSynced { key, .. }
            | Self::SyncStarted { key, .. }
            | Self::SyncProgress { key, .. }
            | Self::PersistFailed { key, .. }
            | Self::CapacityReached { key, .. }
            | Self::ProxyRotated { key, .. } => Some(key),
            Self::DriftAlert { .. }
            | Self::InstanceStarted { .. }
            | Self::InstanceShutdown { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SessionKey {
        SessionKey::parse("U1", "+12025550101").unwrap()
    }

    #[test]
    fn test_event_type_names() {
        let event = HubEvent::HistorySynced {
            metadata: EventMetadata::new("test"),
            key: key(),
            contacts: 10,
            messages: 250,
        };
        assert_eq!(event.event_type(), "history_synced");
    }

    #[test]
    fn test_serde_tagging() {
        let event = HubEvent::ConnectionUpdate {
            metadata: EventMetadata::new("test"),
            key: key(),
            status: ConnectionStatus::Connected,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "connection_update");
        assert_eq!(json["status"], "connected");
    }

    #[test]
    fn test_session_key_accessor() {
        let event = HubEvent::DriftAlert {
            metadata: EventMetadata::new("reconciler"),
            detected: 12,
            fixed: 11,
        };
        assert!(event.session_key().is_none());

        let event = HubEvent::SyncStarted {
            metadata: EventMetadata::new("pool"),
            key: key(),
        };
        assert_eq!(event.session_key(), Some(&key()));
    }
}
