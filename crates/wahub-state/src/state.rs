//! In-memory projection state and deltas.

use chrono::{DateTime, Utc};
use serde_json::Value;
use wahub_core::{ConnectionStatus, CountryCode, SessionKey, SyncStatus};
use wahub_storage::get_field;

/// The in-memory side of one session's projection.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    /// Session identity.
    pub key: SessionKey,
    /// Current projected status.
    pub status: ConnectionStatus,
    /// URL of the hosting instance.
    pub instance_url: String,
    /// Latest QR payload, while pairing.
    pub qr: Option<String>,
    /// True once the post-pairing restart has been observed (always true
    /// for recovered sessions).
    pub handshake_completed: bool,
    /// True once the initial history import finished (always true for
    /// recovered sessions).
    pub sync_completed: bool,
    /// True when this session was re-attached from a stored blob.
    pub is_recovery: bool,
    /// Errors observed since the projection row was created.
    pub error_count: u32,
    /// Human-readable last error.
    pub last_error: Option<String>,
    /// Country of the session's egress IP.
    pub proxy_country: Option<CountryCode>,
    /// Import progress, when known.
    pub sync_status: Option<SyncStatus>,
    /// Contacts imported so far.
    pub sync_contacts: u64,
    /// Messages imported so far.
    pub sync_messages: u64,
    /// When the session last reached `connected`.
    pub connected_at: Option<DateTime<Utc>>,
    /// Last local mutation time.
    pub last_updated: DateTime<Utc>,
}

impl ConnectionState {
    /// A fresh first-time state in `connecting`.
    #[must_use]
    pub fn new(key: SessionKey, instance_url: impl Into<String>) -> Self {
        Self {
            key,
            status: ConnectionStatus::Connecting,
            instance_url: instance_url.into(),
            qr: None,
            handshake_completed: false,
            sync_completed: false,
            is_recovery: false,
            error_count: 0,
            last_error: None,
            proxy_country: None,
            sync_status: None,
            sync_contacts: 0,
            sync_messages: 0,
            connected_at: None,
            last_updated: Utc::now(),
        }
    }

    /// A state for a recovered session: the pairing and import already
    /// happened in a previous life, so neither gate applies.
    #[must_use]
    pub fn recovered(key: SessionKey, instance_url: impl Into<String>) -> Self {
        let mut state = Self::new(key, instance_url);
        state.is_recovery = true;
        state.handshake_completed = true;
        state.sync_completed = true;
        state
    }
}

/// A partial update to a session's state. Only fields that are `Some` are
/// applied and written.
#[derive(Debug, Clone, Default)]
pub struct StateDelta {
    /// Requested status (subject to the write rules).
    pub status: Option<ConnectionStatus>,
    /// New QR payload.
    pub qr: Option<String>,
    /// Egress country.
    pub proxy_country: Option<CountryCode>,
    /// Error message to surface.
    pub last_error: Option<String>,
    /// Bump the error counter by this much.
    pub error_increment: u32,
    /// Pairing-restart gate observed.
    pub handshake_completed: Option<bool>,
    /// Import-completion gate observed.
    pub sync_completed: Option<bool>,
}

impl StateDelta {
    /// A delta that only changes status.
    #[must_use]
    pub fn status(status: ConnectionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// What an external reader sees in the document store for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionRow {
    /// Session identity (parsed from the document id).
    pub key: SessionKey,
    /// Projected status.
    pub status: Option<ConnectionStatus>,
    /// Import status string.
    pub sync_status: Option<SyncStatus>,
    /// Last write time.
    pub last_updated: Option<DateTime<Utc>>,
    /// Hosting instance.
    pub instance_url: Option<String>,
    /// Country of the session's egress IP, if one was recorded.
    pub proxy_country: Option<CountryCode>,
}

impl ProjectionRow {
    /// Parse a projection row out of a raw document.
    #[must_use]
    pub fn from_doc(key: SessionKey, doc: &Value) -> Self {
        let field = |name: &str| get_field(doc, &format!("session_doc.whatsapp_web.{name}"));
        let status = field("status")
            .and_then(Value::as_str)
            .and_then(ConnectionStatus::parse);
        let sync_status = field("sync_status").and_then(Value::as_str).and_then(|s| {
            match s {
                "started" => Some(SyncStatus::Started),
                "importing_contacts" => Some(SyncStatus::ImportingContacts),
                "importing_messages" => Some(SyncStatus::ImportingMessages),
                "completed" => Some(SyncStatus::Completed),
                _ => None,
            }
        });
        let last_updated = field("last_updated")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));
        let instance_url = field("instance_url")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        let proxy_country = field("proxy_country")
            .and_then(Value::as_str)
            .and_then(|s| CountryCode::parse(s).ok());
        Self {
            key,
            status,
            sync_status,
            last_updated,
            instance_url,
            proxy_country,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_recovered_state_gates_open() {
        let key = SessionKey::parse("U1", "+12025550101").unwrap();
        let state = ConnectionState::recovered(key, "http://a:8080");
        assert!(state.handshake_completed);
        assert!(state.sync_completed);
        assert!(state.is_recovery);
    }

    #[test]
    fn test_projection_row_parsing() {
        let key = SessionKey::parse("U1", "+12025550101").unwrap();
        let doc = json!({
            "session_doc": {
                "whatsapp_web": {
                    "status": "importing_messages",
                    "sync_status": "importing_messages",
                    "last_updated": "2026-03-01T12:00:00Z",
                    "instance_url": "http://a:8080"
                }
            }
        });
        let row = ProjectionRow::from_doc(key, &doc);
        assert_eq!(row.status, Some(ConnectionStatus::ImportingMessages));
        assert_eq!(row.sync_status, Some(SyncStatus::ImportingMessages));
        assert!(row.last_updated.is_some());
        assert_eq!(row.instance_url.as_deref(), Some("http://a:8080"));
    }

    #[test]
    fn test_projection_row_tolerates_junk() {
        let key = SessionKey::parse("U1", "+12025550101").unwrap();
        let row = ProjectionRow::from_doc(key, &json!({"unrelated": true}));
        assert_eq!(row.status, None);
        assert_eq!(row.sync_status, None);
    }
}
