//! The connection state manager.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use wahub_core::{ConnectionStatus, SessionKey, SyncStatus};
use wahub_events::{EventBus, EventMetadata, HubEvent};
use wahub_storage::{DocPath, DocumentStore, FieldPatch, StorageError};

use crate::error::StateResult;
use crate::state::{ConnectionState, ProjectionRow, StateDelta};

const SESSIONS: &str = "sessions";
const FIELD_ROOT: &str = "session_doc.whatsapp_web";

/// State manager settings.
#[derive(Debug, Clone)]
pub struct StateManagerConfig {
    /// URL written into every projection row.
    pub instance_url: String,
    /// Heartbeat cadence while `connected`.
    pub heartbeat_interval: Duration,
    /// How long a disconnected session stays in memory.
    pub eviction_delay: Duration,
    /// Delays between retries when a document is absent for an active
    /// status.
    pub retry_delays: Vec<Duration>,
}

impl Default for StateManagerConfig {
    fn default() -> Self {
        Self {
            instance_url: "http://localhost:8080".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            eviction_delay: Duration::from_secs(60),
            retry_delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ],
        }
    }
}

/// Mirrors in-memory session state into the external document store.
pub struct StateManager {
    store: Arc<dyn DocumentStore>,
    bus: EventBus,
    config: StateManagerConfig,
    states: DashMap<SessionKey, ConnectionState>,
    write_locks: DashMap<SessionKey, Arc<Mutex<()>>>,
    heartbeats: DashMap<SessionKey, CancellationToken>,
}

impl StateManager {
    /// Create a state manager.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, bus: EventBus, config: StateManagerConfig) -> Self {
        Self {
            store,
            bus,
            config,
            states: DashMap::new(),
            write_locks: DashMap::new(),
            heartbeats: DashMap::new(),
        }
    }

    fn doc_path(key: &SessionKey) -> StateResult<DocPath> {
        Ok(DocPath::new(SESSIONS, key.to_string())?)
    }

    fn field(name: &str) -> String {
        format!("{FIELD_ROOT}.{name}")
    }

    fn write_lock_for(&self, key: &SessionKey) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Create or merge the projection row and start the session's
    /// heartbeat loop.
    ///
    /// First-time sessions start at `connecting`. A recovery re-attach
    /// does not touch the status: the row most likely still says
    /// `connected` from the session's previous life, and observers should
    /// never see a recovered session dip back to `connecting`.
    ///
    /// # Errors
    ///
    /// Surfaces document-store failures.
    pub async fn initialize(
        self: &Arc<Self>,
        key: &SessionKey,
        is_recovery: bool,
    ) -> StateResult<()> {
        let lock = self.write_lock_for(key);
        let _guard = lock.lock().await;

        {
            let mut entry = self.states.entry(key.clone()).or_insert_with(|| {
                if is_recovery {
                    ConnectionState::recovered(key.clone(), self.config.instance_url.clone())
                } else {
                    ConnectionState::new(key.clone(), self.config.instance_url.clone())
                }
            });
            let state = entry.value_mut();
            if !is_recovery {
                state.status = ConnectionStatus::Connecting;
            }
            state.last_updated = Utc::now();
        }

        let mut patch = FieldPatch::new();
        if !is_recovery {
            patch.insert(Self::field("status"), Value::from("connecting"));
        }
        patch.insert(
            Self::field("instance_url"),
            Value::from(self.config.instance_url.clone()),
        );
        patch.insert(
            Self::field("last_updated"),
            Value::from(Utc::now().to_rfc3339()),
        );
        self.store.merge_fields(&Self::doc_path(key)?, &patch).await?;

        self.start_heartbeat(key);
        if !is_recovery {
            self.bus.publish(HubEvent::ConnectionUpdate {
                metadata: EventMetadata::new("state"),
                key: key.clone(),
                status: ConnectionStatus::Connecting,
            });
        }
        debug!(session = %key, is_recovery, "Projection initialized");
        Ok(())
    }

    /// Merge a delta into memory and write the corresponding dotted-field
    /// patch, applying the status write rules.
    ///
    /// Returns the status actually written, which may differ from the
    /// requested one (rewritten) or be `None` (suppressed or not
    /// requested).
    ///
    /// # Errors
    ///
    /// Surfaces document-store failures other than the handled
    /// absent-document cases.
    pub async fn update(
        &self,
        key: &SessionKey,
        delta: StateDelta,
    ) -> StateResult<Option<ConnectionStatus>> {
        let lock = self.write_lock_for(key);
        let _guard = lock.lock().await;
        self.update_locked(key, delta).await
    }

    async fn update_locked(
        &self,
        key: &SessionKey,
        delta: StateDelta,
    ) -> StateResult<Option<ConnectionStatus>> {
        let (patch, effective, previous, rule_status) = {
            let mut entry = self.states.entry(key.clone()).or_insert_with(|| {
                ConnectionState::new(key.clone(), self.config.instance_url.clone())
            });
            let state = entry.value_mut();
            let previous = state.status;

            if let Some(flag) = delta.handshake_completed {
                state.handshake_completed = flag;
            }
            if let Some(flag) = delta.sync_completed {
                state.sync_completed = flag;
            }
            if let Some(qr) = &delta.qr {
                state.qr = Some(qr.clone());
            }
            if let Some(country) = &delta.proxy_country {
                state.proxy_country = Some(country.clone());
            }
            if let Some(error) = &delta.last_error {
                state.last_error = Some(error.clone());
            }
            state.error_count = state.error_count.saturating_add(delta.error_increment);

            let effective = delta.status.and_then(|requested| {
                Self::resolve_status(state, requested)
            });
            if let Some(status) = effective {
                state.status = status;
                if status == ConnectionStatus::Connected {
                    state.connected_at = Some(Utc::now());
                }
            }
            state.last_updated = Utc::now();

            let mut patch = FieldPatch::new();
            if let Some(status) = effective {
                patch.insert(Self::field("status"), Value::from(status.as_str()));
            }
            if let Some(qr) = &delta.qr {
                patch.insert(Self::field("qr_code"), Value::from(qr.clone()));
            }
            if let Some(country) = &delta.proxy_country {
                patch.insert(Self::field("proxy_country"), Value::from(country.as_str()));
            }
            if delta.last_error.is_some() || delta.error_increment > 0 {
                if let Some(error) = &state.last_error {
                    patch.insert(Self::field("last_error"), Value::from(error.clone()));
                }
                patch.insert(Self::field("error_count"), Value::from(state.error_count));
            }
            if !patch.is_empty() {
                patch.insert(
                    Self::field("last_updated"),
                    Value::from(Utc::now().to_rfc3339()),
                );
            }
            let rule_status = effective.unwrap_or(state.status);
            (patch, effective, previous, rule_status)
        };

        self.write_patch(key, patch, rule_status).await?;

        if let Some(status) = effective
            && status != previous
        {
            self.bus.publish(HubEvent::ConnectionUpdate {
                metadata: EventMetadata::new("state"),
                key: key.clone(),
                status,
            });
        }
        Ok(effective)
    }

    /// The status write rules: suppression during first-time pairing,
    /// suppression of regressions out of a first-time import, and the
    /// `connected` → `importing_messages` rewrite before the initial
    /// import completes.
    fn resolve_status(
        state: &ConnectionState,
        requested: ConnectionStatus,
    ) -> Option<ConnectionStatus> {
        let pairing = !state.handshake_completed
            && !state.is_recovery
            && state.status == ConnectionStatus::QrPending;
        if pairing && requested != ConnectionStatus::QrPending && !requested.is_terminal() {
            debug!(session = %state.key, requested = %requested,
                "Status suppressed until pairing restart completes");
            return None;
        }

        // A first-time import in flight pins the projection: reconnect
        // chatter (connecting, restarting) never regresses `importing_*`.
        // Teardown and handoff stay visible.
        let importing = !state.sync_completed
            && !state.is_recovery
            && state.status.is_importing();
        if importing
            && !requested.is_importing()
            && requested != ConnectionStatus::Connected
            && requested != ConnectionStatus::PendingRecovery
            && !requested.is_terminal()
        {
            debug!(session = %state.key, requested = %requested,
                "Status suppressed until the initial import completes");
            return None;
        }

        if requested == ConnectionStatus::Connected && !state.sync_completed {
            debug!(session = %state.key,
                "Rewriting connected to importing_messages until sync completes");
            return Some(ConnectionStatus::ImportingMessages);
        }
        Some(requested)
    }

    async fn write_patch(
        &self,
        key: &SessionKey,
        patch: FieldPatch,
        status: ConnectionStatus,
    ) -> StateResult<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let path = Self::doc_path(key)?;
        match self.store.update_fields(&path, &patch).await {
            Ok(()) => return Ok(()),
            Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        if status.is_terminal() {
            // The row was deliberately deleted; a terminal write must not
            // resurrect it.
            debug!(session = %key, status = %status, "Skipping write to deleted projection");
            return Ok(());
        }

        for delay in &self.config.retry_delays {
            tokio::time::sleep(*delay).await;
            match self.store.update_fields(&path, &patch).await {
                Ok(()) => return Ok(()),
                Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        warn!(session = %key, status = %status,
            "Projection document still absent after retries");
        self.bus.publish(HubEvent::PersistFailed {
            metadata: EventMetadata::new("state"),
            key: key.clone(),
            status,
        });
        Ok(())
    }

    /// Mark a session connected (subject to the sync gate).
    ///
    /// # Errors
    ///
    /// See [`Self::update`].
    pub async fn mark_connected(&self, key: &SessionKey) -> StateResult<Option<ConnectionStatus>> {
        self.update(key, StateDelta::status(ConnectionStatus::Connected))
            .await
    }

    /// Mark a session disconnected, stop its heartbeat, and schedule its
    /// memory eviction.
    ///
    /// # Errors
    ///
    /// See [`Self::update`].
    pub async fn mark_disconnected(
        self: &Arc<Self>,
        key: &SessionKey,
        reason: &str,
    ) -> StateResult<()> {
        let delta = StateDelta {
            status: Some(ConnectionStatus::Disconnected),
            last_error: Some(reason.to_string()),
            ..StateDelta::default()
        };
        self.update(key, delta).await?;
        self.stop_heartbeat(key);
        self.schedule_eviction(key.clone());
        Ok(())
    }

    /// Mark a session failed and stop its heartbeat.
    ///
    /// # Errors
    ///
    /// See [`Self::update`].
    pub async fn mark_failed(&self, key: &SessionKey, error: &str) -> StateResult<()> {
        let delta = StateDelta {
            status: Some(ConnectionStatus::Failed),
            last_error: Some(error.to_string()),
            error_increment: 1,
            ..StateDelta::default()
        };
        self.update(key, delta).await?;
        self.stop_heartbeat(key);
        Ok(())
    }

    /// Persist import progress; `done` closes the sync gate.
    ///
    /// # Errors
    ///
    /// See [`Self::update`].
    pub async fn update_sync_progress(
        &self,
        key: &SessionKey,
        contacts: u64,
        messages: u64,
        done: bool,
    ) -> StateResult<SyncStatus> {
        let lock = self.write_lock_for(key);
        let _guard = lock.lock().await;

        let sync_status = if done {
            SyncStatus::Completed
        } else if messages > 0 {
            SyncStatus::ImportingMessages
        } else if contacts > 0 {
            SyncStatus::ImportingContacts
        } else {
            SyncStatus::Started
        };

        let (patch, rule_status) = {
            let mut entry = self.states.entry(key.clone()).or_insert_with(|| {
                ConnectionState::new(key.clone(), self.config.instance_url.clone())
            });
            let state = entry.value_mut();
            state.sync_contacts = contacts;
            state.sync_messages = messages;
            state.sync_status = Some(sync_status);
            if done {
                state.sync_completed = true;
            }
            state.last_updated = Utc::now();

            let mut patch = FieldPatch::new();
            patch.insert(Self::field("sync_status"), Value::from(sync_status.as_str()));
            patch.insert(Self::field("sync_contacts_count"), Value::from(contacts));
            patch.insert(Self::field("sync_messages_count"), Value::from(messages));
            if done {
                patch.insert(
                    Self::field("sync_completed_at"),
                    Value::from(Utc::now().to_rfc3339()),
                );
            }
            patch.insert(
                Self::field("last_updated"),
                Value::from(Utc::now().to_rfc3339()),
            );
            (patch, state.status)
        };

        self.write_patch(key, patch, rule_status).await?;
        Ok(sync_status)
    }

    /// Rebuild in-memory projections from the document store at process
    /// start, skipping logged-out sessions.
    ///
    /// # Errors
    ///
    /// Surfaces document-store failures.
    pub async fn recover_all(&self) -> StateResult<Vec<ConnectionState>> {
        let mut recovered = Vec::new();
        for (id, doc) in self.store.list(SESSIONS).await? {
            let Some((user, phone)) = id.split_once(':') else {
                continue;
            };
            let Ok(key) = SessionKey::parse(user, phone) else {
                continue;
            };
            let row = ProjectionRow::from_doc(key.clone(), &doc);
            match row.status {
                None | Some(ConnectionStatus::LoggedOut) => continue,
                Some(status) => {
                    let mut state =
                        ConnectionState::recovered(key.clone(), self.config.instance_url.clone());
                    state.status = status;
                    state.proxy_country = row.proxy_country.clone();
                    self.states.insert(key, state.clone());
                    recovered.push(state);
                }
            }
        }
        Ok(recovered)
    }

    /// Snapshot of one session's in-memory state.
    #[must_use]
    pub fn snapshot(&self, key: &SessionKey) -> Option<ConnectionState> {
        self.states.get(key).map(|entry| entry.value().clone())
    }

    /// Snapshots of every in-memory state.
    #[must_use]
    pub fn all_states(&self) -> Vec<ConnectionState> {
        self.states.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Drop a session from memory and stop its heartbeat.
    pub fn evict(&self, key: &SessionKey) {
        self.stop_heartbeat(key);
        self.states.remove(key);
        self.write_locks.remove(key);
    }

    /// Read one projection row straight from the document store.
    ///
    /// # Errors
    ///
    /// Surfaces document-store failures.
    pub async fn read_projection(&self, key: &SessionKey) -> StateResult<Option<ProjectionRow>> {
        let doc = self.store.get(&Self::doc_path(key)?).await?;
        Ok(doc.map(|doc| ProjectionRow::from_doc(key.clone(), &doc)))
    }

    /// Read every projection row from the document store.
    ///
    /// # Errors
    ///
    /// Surfaces document-store failures.
    pub async fn list_projections(&self) -> StateResult<Vec<ProjectionRow>> {
        let mut rows = Vec::new();
        for (id, doc) in self.store.list(SESSIONS).await? {
            let Some((user, phone)) = id.split_once(':') else {
                continue;
            };
            if let Ok(key) = SessionKey::parse(user, phone) {
                rows.push(ProjectionRow::from_doc(key, &doc));
            }
        }
        Ok(rows)
    }

    /// Touch `last_heartbeat`/`last_seen`, only while locally `connected`.
    pub async fn heartbeat_touch(&self, key: &SessionKey) {
        let connected = self
            .states
            .get(key)
            .is_some_and(|state| state.status == ConnectionStatus::Connected);
        if !connected {
            return;
        }
        let now = Value::from(Utc::now().to_rfc3339());
        let mut patch = FieldPatch::new();
        patch.insert(Self::field("last_heartbeat"), now.clone());
        patch.insert(Self::field("last_seen"), now);
        let Ok(path) = Self::doc_path(key) else {
            return;
        };
        match self.store.update_fields(&path, &patch).await {
            Ok(()) | Err(StorageError::NotFound(_)) => {}
            Err(e) => warn!(session = %key, error = %e, "Heartbeat write failed"),
        }
    }

    fn start_heartbeat(self: &Arc<Self>, key: &SessionKey) {
        if self.heartbeats.contains_key(key) {
            return;
        }
        let token = CancellationToken::new();
        self.heartbeats.insert(key.clone(), token.clone());
        let manager = Arc::clone(self);
        let key = key.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.heartbeat_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => manager.heartbeat_touch(&key).await,
                    () = token.cancelled() => return,
                }
            }
        });
    }

    fn stop_heartbeat(&self, key: &SessionKey) {
        if let Some((_, token)) = self.heartbeats.remove(key) {
            token.cancel();
        }
    }

    fn schedule_eviction(self: &Arc<Self>, key: SessionKey) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(manager.config.eviction_delay).await;
            let still_terminal = manager
                .states
                .get(&key)
                .is_some_and(|state| state.status.is_terminal());
            if still_terminal {
                manager.evict(&key);
                debug!(session = %key, "Evicted disconnected session from memory");
            }
        });
    }
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("sessions", &self.states.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wahub_storage::{MemoryDocumentStore, get_field};

    fn key() -> SessionKey {
        SessionKey::parse("U1", "+12025550101").unwrap()
    }

    fn manager_with(
        store: Arc<MemoryDocumentStore>,
    ) -> (Arc<StateManager>, EventBus) {
        let bus = EventBus::new();
        let manager = Arc::new(StateManager::new(
            Arc::clone(&store) as Arc<dyn DocumentStore>,
            bus.clone(),
            StateManagerConfig {
                retry_delays: vec![Duration::from_millis(5)],
                eviction_delay: Duration::from_millis(20),
                ..StateManagerConfig::default()
            },
        ));
        (manager, bus)
    }

    async fn doc_status(store: &MemoryDocumentStore, key: &SessionKey) -> Option<String> {
        let doc = store
            .get(&DocPath::new(SESSIONS, key.to_string()).unwrap())
            .await
            .unwrap()?;
        get_field(&doc, "session_doc.whatsapp_web.status")
            .and_then(Value::as_str)
            .map(ToString::to_string)
    }

    #[tokio::test]
    async fn test_initialize_creates_row() {
        let store = Arc::new(MemoryDocumentStore::new());
        let (manager, _bus) = manager_with(Arc::clone(&store));
        manager.initialize(&key(), false).await.unwrap();
        assert_eq!(doc_status(&store, &key()).await.as_deref(), Some("connecting"));
        assert_eq!(
            manager.snapshot(&key()).unwrap().status,
            ConnectionStatus::Connecting
        );
    }

    #[tokio::test]
    async fn test_pairing_suppresses_non_qr_status() {
        let store = Arc::new(MemoryDocumentStore::new());
        let (manager, _bus) = manager_with(Arc::clone(&store));
        manager.initialize(&key(), false).await.unwrap();
        manager
            .update(&key(), StateDelta::status(ConnectionStatus::QrPending))
            .await
            .unwrap();

        // Reconnect-ish statuses are suppressed while pairing
        let written = manager
            .update(&key(), StateDelta::status(ConnectionStatus::Connecting))
            .await
            .unwrap();
        assert_eq!(written, None);
        assert_eq!(doc_status(&store, &key()).await.as_deref(), Some("qr_pending"));

        // Once the pairing restart is observed, the transition goes through
        let delta = StateDelta {
            status: Some(ConnectionStatus::Restarting),
            handshake_completed: Some(true),
            ..StateDelta::default()
        };
        let written = manager.update(&key(), delta).await.unwrap();
        assert_eq!(written, Some(ConnectionStatus::Restarting));
        assert_eq!(doc_status(&store, &key()).await.as_deref(), Some("restarting"));
    }

    #[tokio::test]
    async fn test_terminal_status_not_suppressed_during_pairing() {
        let store = Arc::new(MemoryDocumentStore::new());
        let (manager, _bus) = manager_with(Arc::clone(&store));
        manager.initialize(&key(), false).await.unwrap();
        manager
            .update(&key(), StateDelta::status(ConnectionStatus::QrPending))
            .await
            .unwrap();

        // QR timeout tears the session down; that must be visible
        let written = manager
            .update(&key(), StateDelta::status(ConnectionStatus::Disconnected))
            .await
            .unwrap();
        assert_eq!(written, Some(ConnectionStatus::Disconnected));
    }

    #[tokio::test]
    async fn test_import_blocks_regression_to_connecting() {
        let store = Arc::new(MemoryDocumentStore::new());
        let (manager, _bus) = manager_with(Arc::clone(&store));
        manager.initialize(&key(), false).await.unwrap();
        let delta = StateDelta {
            status: Some(ConnectionStatus::ImportingMessages),
            handshake_completed: Some(true),
            ..StateDelta::default()
        };
        manager.update(&key(), delta).await.unwrap();

        // A reconnect mid-import must not surface as connecting
        let written = manager
            .update(&key(), StateDelta::status(ConnectionStatus::Connecting))
            .await
            .unwrap();
        assert_eq!(written, None);
        assert_eq!(
            doc_status(&store, &key()).await.as_deref(),
            Some("importing_messages")
        );
        let written = manager
            .update(&key(), StateDelta::status(ConnectionStatus::Restarting))
            .await
            .unwrap();
        assert_eq!(written, None);

        // Teardown is still visible
        let written = manager
            .update(&key(), StateDelta::status(ConnectionStatus::Disconnected))
            .await
            .unwrap();
        assert_eq!(written, Some(ConnectionStatus::Disconnected));
    }

    #[tokio::test]
    async fn test_import_allows_handoff_to_pending_recovery() {
        let store = Arc::new(MemoryDocumentStore::new());
        let (manager, _bus) = manager_with(Arc::clone(&store));
        manager.initialize(&key(), false).await.unwrap();
        let delta = StateDelta {
            status: Some(ConnectionStatus::ImportingMessages),
            handshake_completed: Some(true),
            ..StateDelta::default()
        };
        manager.update(&key(), delta).await.unwrap();

        let written = manager
            .update(&key(), StateDelta::status(ConnectionStatus::PendingRecovery))
            .await
            .unwrap();
        assert_eq!(written, Some(ConnectionStatus::PendingRecovery));
    }

    #[tokio::test]
    async fn test_connected_rewritten_until_sync_completes() {
        let store = Arc::new(MemoryDocumentStore::new());
        let (manager, _bus) = manager_with(Arc::clone(&store));
        manager.initialize(&key(), false).await.unwrap();
        let delta = StateDelta {
            status: Some(ConnectionStatus::Connected),
            handshake_completed: Some(true),
            ..StateDelta::default()
        };
        let written = manager.update(&key(), delta).await.unwrap();
        assert_eq!(written, Some(ConnectionStatus::ImportingMessages));

        manager.update_sync_progress(&key(), 10, 200, true).await.unwrap();
        let written = manager.mark_connected(&key()).await.unwrap();
        assert_eq!(written, Some(ConnectionStatus::Connected));
        assert_eq!(doc_status(&store, &key()).await.as_deref(), Some("connected"));
    }

    #[tokio::test]
    async fn test_recovery_session_skips_gates() {
        let store = Arc::new(MemoryDocumentStore::new());
        let (manager, _bus) = manager_with(Arc::clone(&store));
        manager.initialize(&key(), true).await.unwrap();
        let written = manager.mark_connected(&key()).await.unwrap();
        assert_eq!(written, Some(ConnectionStatus::Connected));
    }

    #[tokio::test]
    async fn test_terminal_write_does_not_resurrect_deleted_row() {
        let store = Arc::new(MemoryDocumentStore::new());
        let (manager, _bus) = manager_with(Arc::clone(&store));
        manager.initialize(&key(), true).await.unwrap();

        // The row is deliberately deleted by another service
        store
            .delete(&DocPath::new(SESSIONS, key().to_string()).unwrap())
            .await
            .unwrap();

        manager.mark_disconnected(&key(), "user removed").await.unwrap();
        assert_eq!(doc_status(&store, &key()).await, None);
    }

    #[tokio::test]
    async fn test_active_write_on_missing_row_emits_persist_failed() {
        let store = Arc::new(MemoryDocumentStore::new());
        let (manager, bus) = manager_with(Arc::clone(&store));
        let mut receiver = bus.subscribe();

        // No initialize: the document does not exist
        let delta = StateDelta {
            status: Some(ConnectionStatus::ImportingMessages),
            handshake_completed: Some(true),
            ..StateDelta::default()
        };
        manager.update(&key(), delta).await.unwrap();

        let mut saw_persist_failed = false;
        while let Some(event) = receiver.try_recv() {
            if event.event_type() == "persist_failed" {
                saw_persist_failed = true;
            }
        }
        assert!(saw_persist_failed);
    }

    #[tokio::test]
    async fn test_sync_progress_derivation() {
        let store = Arc::new(MemoryDocumentStore::new());
        let (manager, _bus) = manager_with(Arc::clone(&store));
        manager.initialize(&key(), false).await.unwrap();

        assert_eq!(
            manager.update_sync_progress(&key(), 0, 0, false).await.unwrap(),
            SyncStatus::Started
        );
        assert_eq!(
            manager.update_sync_progress(&key(), 12, 0, false).await.unwrap(),
            SyncStatus::ImportingContacts
        );
        assert_eq!(
            manager.update_sync_progress(&key(), 12, 340, false).await.unwrap(),
            SyncStatus::ImportingMessages
        );
        assert_eq!(
            manager.update_sync_progress(&key(), 12, 350, true).await.unwrap(),
            SyncStatus::Completed
        );
        assert!(manager.snapshot(&key()).unwrap().sync_completed);
    }

    #[tokio::test]
    async fn test_patch_preserves_unrelated_subfields() {
        let store = Arc::new(MemoryDocumentStore::new());
        let (manager, _bus) = manager_with(Arc::clone(&store));

        // Another service wrote sibling data into the same document
        let path = DocPath::new(SESSIONS, key().to_string()).unwrap();
        store
            .set(
                &path,
                serde_json::json!({
                    "session_doc": {"telegram": {"status": "connected"}},
                    "profile": {"name": "Dana"}
                }),
            )
            .await
            .unwrap();

        manager.initialize(&key(), false).await.unwrap();
        let doc = store.get(&path).await.unwrap().unwrap();
        assert_eq!(
            get_field(&doc, "session_doc.telegram.status").and_then(Value::as_str),
            Some("connected")
        );
        assert_eq!(
            get_field(&doc, "profile.name").and_then(Value::as_str),
            Some("Dana")
        );
        assert_eq!(
            get_field(&doc, "session_doc.whatsapp_web.status").and_then(Value::as_str),
            Some("connecting")
        );
    }

    #[tokio::test]
    async fn test_recover_all_skips_logged_out() {
        let store = Arc::new(MemoryDocumentStore::new());
        let (manager, _bus) = manager_with(Arc::clone(&store));

        for (id, status) in [
            ("U1:+12025550101", "connected"),
            ("U2:+447700900123", "logged_out"),
            ("U3:+3212345678", "disconnected"),
        ] {
            store
                .set(
                    &DocPath::new(SESSIONS, id).unwrap(),
                    serde_json::json!({
                        "session_doc": {"whatsapp_web": {"status": status}}
                    }),
                )
                .await
                .unwrap();
        }

        let recovered = manager.recover_all().await.unwrap();
        assert_eq!(recovered.len(), 2);
        assert!(recovered.iter().all(|state| state.is_recovery));
        assert!(
            !recovered
                .iter()
                .any(|state| state.status == ConnectionStatus::LoggedOut)
        );
    }

    #[tokio::test]
    async fn test_eviction_after_disconnect() {
        let store = Arc::new(MemoryDocumentStore::new());
        let (manager, _bus) = manager_with(Arc::clone(&store));
        manager.initialize(&key(), true).await.unwrap();
        manager.mark_disconnected(&key(), "bye").await.unwrap();
        assert!(manager.snapshot(&key()).is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(manager.snapshot(&key()).is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_touch_only_while_connected() {
        let store = Arc::new(MemoryDocumentStore::new());
        let (manager, _bus) = manager_with(Arc::clone(&store));
        manager.initialize(&key(), true).await.unwrap();

        manager.heartbeat_touch(&key()).await;
        let path = DocPath::new(SESSIONS, key().to_string()).unwrap();
        let doc = store.get(&path).await.unwrap().unwrap();
        assert!(get_field(&doc, "session_doc.whatsapp_web.last_heartbeat").is_none());

        manager.mark_connected(&key()).await.unwrap();
        manager.heartbeat_touch(&key()).await;
        let doc = store.get(&path).await.unwrap().unwrap();
        assert!(get_field(&doc, "session_doc.whatsapp_web.last_heartbeat").is_some());
    }
}
