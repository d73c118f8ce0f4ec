//! Per-session connection records.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use wahub_core::{ConnectionPhase, CountryCode, SessionKey};
use wahub_protocol::ProtocolSession;

/// Mutable per-session state, owned by the session's owner task.
///
/// Other tasks read snapshots; only the owner task writes.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    /// Session identity.
    pub key: SessionKey,
    /// Lifecycle phase.
    pub phase: ConnectionPhase,
    /// Latest QR payload while pairing.
    pub qr: Option<String>,
    /// Egress country in use.
    pub country: CountryCode,
    /// True once the post-pairing restart has been observed.
    pub handshake_completed: bool,
    /// True once the initial history import finished.
    pub sync_completed: bool,
    /// True when the session was attached from a stored blob.
    pub is_recovery: bool,
    /// True once the egress IP was released after stable open.
    pub proxy_released: bool,
    /// True once the socket has reached open at least once.
    pub connected_once: bool,
    /// Reconnect attempts for the current disconnect cause.
    pub reconnect_attempts: u32,
    /// Realtime messages handled.
    pub message_count: u64,
    /// Contacts seen during the initial import.
    pub sync_contacts: u64,
    /// Messages seen during the initial import.
    pub sync_messages: u64,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the socket last reached open.
    pub opened_at: Option<DateTime<Utc>>,
}

impl ConnectionRecord {
    /// A fresh record in `connecting`.
    #[must_use]
    pub fn new(key: SessionKey, country: CountryCode, is_recovery: bool) -> Self {
        Self {
            key,
            phase: ConnectionPhase::Connecting,
            qr: None,
            country,
            handshake_completed: is_recovery,
            sync_completed: is_recovery,
            is_recovery,
            proxy_released: false,
            connected_once: false,
            reconnect_attempts: 0,
            message_count: 0,
            sync_contacts: 0,
            sync_messages: 0,
            created_at: Utc::now(),
            opened_at: None,
        }
    }

    /// True while the socket is open (importing or connected).
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(
            self.phase,
            ConnectionPhase::ImportingContacts
                | ConnectionPhase::ImportingMessages
                | ConnectionPhase::Connected
        )
    }
}

/// A read-only copy of a record, handed to callers outside the owner task.
pub type RecordSnapshot = ConnectionRecord;

/// What a detach intends to happen to the session's credentials and
/// projection.
#[derive(Debug, Clone)]
pub(crate) enum DetachIntent {
    /// Close the socket, keep the blob, project `disconnected`.
    Preserve {
        /// Reason surfaced as `last_error`.
        reason: String,
    },
    /// Protocol logout, delete the blob, project `logged_out`.
    Logout,
    /// Close the socket, keep the blob, project `pending_recovery` so
    /// another instance may adopt the session.
    ShutdownPreserving,
}

/// Commands other tasks send to a session's owner task.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    /// Close the current socket and reconnect, optionally rotating the
    /// egress IP first.
    Reconnect {
        /// Rotate the proxy before reconnecting.
        rotate: bool,
    },
}

/// Shared handle to one live session.
pub(crate) struct SessionHandle {
    /// The record; owner task writes, everyone else snapshots.
    pub(crate) record: Arc<RwLock<ConnectionRecord>>,
    /// Current socket, swapped by the owner task on reconnect.
    pub(crate) socket: Arc<RwLock<Option<Arc<dyn ProtocolSession>>>>,
    /// Cancels the owner task.
    pub(crate) cancel: CancellationToken,
    /// What cancellation should do; set before cancelling.
    pub(crate) detach_intent: Arc<Mutex<Option<DetachIntent>>>,
    /// Command channel into the owner task.
    pub(crate) commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Snapshot the record.
    pub(crate) async fn snapshot(&self) -> RecordSnapshot {
        self.record.read().await.clone()
    }

    /// Whether the underlying socket reports open.
    pub(crate) async fn socket_open(&self) -> bool {
        self.socket
            .read()
            .await
            .as_ref()
            .is_some_and(|socket| socket.is_open())
    }
}
