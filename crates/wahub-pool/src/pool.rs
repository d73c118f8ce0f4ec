//! The connection pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wahub_coordinator::InstanceCoordinator;
use wahub_core::{ConnectionPhase, ConnectionStatus, CountryCode, PhoneNumber, SessionKey};
use wahub_events::{EventBus, EventMetadata, HubEvent};
use wahub_protocol::{ConnectOptions, ProtocolConnector, ProxyEndpoint};
use wahub_proxy::ProxyAllocator;
use wahub_session_store::SessionStore;
use wahub_state::{ConnectionState, StateDelta, StateManager};

use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::rate_limit::ReconnectRateLimiter;
use crate::record::{ConnectionRecord, DetachIntent, RecordSnapshot, SessionCommand, SessionHandle};
use crate::session_task;

/// Options for [`ConnectionPool::attach`].
#[derive(Debug, Clone, Default)]
pub struct AttachOptions {
    /// Requested egress country; defaults to the stored or configured one.
    pub country: Option<CountryCode>,
    /// Browser name override for this session.
    pub browser_name: Option<String>,
    /// Attach from a stored blob, skipping QR and import.
    pub is_recovery: bool,
}

/// Options for [`ConnectionPool::detach`].
#[derive(Debug, Clone)]
pub struct DetachOptions {
    /// Keep the credential blob (close without protocol logout).
    pub preserve_session: bool,
    /// Reason surfaced in the projection.
    pub reason: String,
}

/// Result vocabulary of [`ConnectionPool::reconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// The session reached (or already had) an open socket.
    Connected,
    /// The session needs a fresh QR pairing.
    NeedsQr,
    /// The session entered `failed`.
    Failed,
    /// The per-key reconnect budget is exhausted.
    RateLimited,
    /// No session and no stored credentials exist.
    SessionNotFound,
    /// The deadline elapsed before any terminal observation.
    Timeout,
    /// The attach/connect itself failed.
    ConnectionFailed,
}

/// How [`ConnectionPool::shutdown`] treats sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Close sockets without logout and project `pending_recovery` so
    /// another instance may adopt the sessions.
    Preserving,
    /// Protocol logout, blob deletion, `logged_out` projection.
    Logout,
}

/// The central session runtime.
pub struct ConnectionPool {
    pub(crate) connector: Arc<dyn ProtocolConnector>,
    pub(crate) allocator: Option<Arc<ProxyAllocator>>,
    pub(crate) blobs: Arc<SessionStore>,
    pub(crate) coordinator: Arc<InstanceCoordinator>,
    pub(crate) state: Arc<StateManager>,
    pub(crate) bus: EventBus,
    pub(crate) config: PoolConfig,
    sessions: RwLock<HashMap<SessionKey, Arc<SessionHandle>>>,
    sent_by_api: DashMap<String, Instant>,
    rate_limiter: ReconnectRateLimiter,
}

impl ConnectionPool {
    /// Create a pool. `allocator` is `None` only when `use_proxy` is off.
    #[must_use]
    pub fn new(
        connector: Arc<dyn ProtocolConnector>,
        allocator: Option<Arc<ProxyAllocator>>,
        blobs: Arc<SessionStore>,
        coordinator: Arc<InstanceCoordinator>,
        state: Arc<StateManager>,
        bus: EventBus,
        config: PoolConfig,
    ) -> Self {
        let rate_limiter = ReconnectRateLimiter::new(config.reconnect_rate_limit);
        Self {
            connector,
            allocator,
            blobs,
            coordinator,
            state,
            bus,
            config,
            sessions: RwLock::new(HashMap::new()),
            sent_by_api: DashMap::new(),
            rate_limiter,
        }
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Snapshot one session's record.
    pub async fn snapshot_of(&self, key: &SessionKey) -> Option<RecordSnapshot> {
        let handle = self.sessions.read().await.get(key).cloned()?;
        Some(handle.snapshot().await)
    }

    /// Snapshot every live record.
    pub async fn all_snapshots(&self) -> Vec<RecordSnapshot> {
        let handles: Vec<Arc<SessionHandle>> =
            self.sessions.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            snapshots.push(handle.snapshot().await);
        }
        snapshots
    }

    /// Whether the session's socket reports open right now.
    pub async fn socket_open(&self, key: &SessionKey) -> bool {
        let handle = self.sessions.read().await.get(key).cloned();
        match handle {
            Some(handle) => handle.socket_open().await,
            None => false,
        }
    }

    /// Attach a session: acquire ownership, allocate an egress IP, restore
    /// credentials, and spawn the protocol session with its owner task.
    ///
    /// Attaching an already-active session is an idempotent success.
    ///
    /// # Errors
    ///
    /// [`PoolError::CapacityReached`], [`PoolError::OwnershipDenied`],
    /// proxy and connect failures. On failure nothing is left behind: the
    /// ownership claim and any proxy assignment are released.
    pub async fn attach(
        self: &Arc<Self>,
        key: SessionKey,
        options: AttachOptions,
    ) -> PoolResult<RecordSnapshot> {
        // Attach holds the session-map writer for the whole admission so
        // two racing attaches for one key resolve to a single record.
        let mut sessions = self.sessions.write().await;

        if let Some(handle) = sessions.get(&key).cloned() {
            let snapshot = handle.snapshot().await;
            if snapshot.phase.is_active() {
                debug!(session = %key, "Attach on active session is idempotent");
                return Ok(snapshot);
            }
            // A terminal record is replaced by the fresh attach.
            handle.cancel.cancel();
            sessions.remove(&key);
        }

        if sessions.len() >= self.config.max_connections {
            self.bus.publish(HubEvent::CapacityReached {
                metadata: EventMetadata::new("pool"),
                key: key.clone(),
                limit: self.config.max_connections,
            });
            return Err(PoolError::CapacityReached(self.config.max_connections));
        }

        if !self.coordinator.request_ownership(&key).await? {
            return Err(PoolError::OwnershipDenied(key.to_string()));
        }

        let requested_country = match options.country {
            Some(country) => country,
            None => self.stored_country(&key).await,
        };

        // The fallback oracle may land the session in a different country
        // than requested; the assignment's country is what gets recorded.
        let (proxy, country) = match self.assign_proxy(&key, &requested_country).await {
            Ok(Some(assignment)) => {
                let endpoint = ProxyEndpoint {
                    ip: assignment.ip.clone(),
                    port: assignment.port,
                };
                (Some(endpoint), assignment.country)
            }
            Ok(None) => (None, requested_country),
            Err(e) => {
                let _ = self.coordinator.release_ownership(&key).await;
                return Err(e);
            }
        };

        if let Err(e) = self.state.initialize(&key, options.is_recovery).await {
            self.unwind_attach(&key).await;
            return Err(e.into());
        }
        if proxy.is_some() {
            let delta = StateDelta {
                proxy_country: Some(country.clone()),
                ..StateDelta::default()
            };
            if let Err(e) = self.state.update(&key, delta).await {
                warn!(session = %key, error = %e, "Failed to project proxy country");
            }
        }

        let blob = match self.blobs.load(&key).await {
            Ok(blob) => blob,
            Err(e) => {
                self.unwind_attach(&key).await;
                return Err(e.into());
            }
        };

        let connect_options = ConnectOptions {
            key: key.clone(),
            blob,
            proxy,
            browser_name: options
                .browser_name
                .unwrap_or_else(|| self.config.browser_name.clone()),
        };
        let connect = tokio::time::timeout(
            self.config.timings.attach_deadline,
            self.connector.connect(connect_options),
        )
        .await;
        let (socket, events) = match connect {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                self.unwind_attach(&key).await;
                let _ = self
                    .state
                    .mark_disconnected(&key, &format!("connection failed: {e}"))
                    .await;
                return Err(e.into());
            }
            Err(_) => {
                self.unwind_attach(&key).await;
                let _ = self
                    .state
                    .mark_disconnected(&key, "timed out establishing connection")
                    .await;
                return Err(PoolError::Timeout(format!("attach {key}")));
            }
        };

        let record = ConnectionRecord::new(key.clone(), country, options.is_recovery);
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let handle = Arc::new(SessionHandle {
            record: Arc::new(RwLock::new(record)),
            socket: Arc::new(RwLock::new(Some(socket))),
            cancel: CancellationToken::new(),
            detach_intent: Arc::new(Mutex::new(None)),
            commands: commands_tx,
        });
        sessions.insert(key.clone(), Arc::clone(&handle));
        drop(sessions);

        let snapshot = handle.snapshot().await;
        tokio::spawn(session_task::run(
            Arc::clone(self),
            Arc::clone(&handle),
            events,
            commands_rx,
        ));
        info!(session = %key, is_recovery = options.is_recovery, "Session attached");
        Ok(snapshot)
    }

    async fn stored_country(&self, key: &SessionKey) -> CountryCode {
        if let Some(state) = self.state.snapshot(key)
            && let Some(country) = state.proxy_country
        {
            return country;
        }
        if let Ok(Some(row)) = self.state.read_projection(key).await
            && let Some(country) = row.proxy_country
        {
            return country;
        }
        self.config.default_country.clone()
    }

    async fn assign_proxy(
        &self,
        key: &SessionKey,
        country: &CountryCode,
    ) -> PoolResult<Option<wahub_proxy::ProxyAssignment>> {
        if !self.config.use_proxy {
            return Ok(None);
        }
        let allocator = self
            .allocator
            .as_ref()
            .ok_or_else(|| PoolError::Internal("proxy enabled without allocator".to_string()))?;
        Ok(Some(allocator.assign(key, country).await?))
    }

    async fn unwind_attach(&self, key: &SessionKey) {
        if let Some(allocator) = &self.allocator {
            allocator.release_for(key).await;
        }
        if let Err(e) = self.coordinator.release_ownership(key).await {
            warn!(session = %key, error = %e, "Failed to release ownership during unwind");
        }
    }

    /// Detach a session. Unknown keys are a no-op (detach is idempotent).
    ///
    /// # Errors
    ///
    /// Currently infallible beyond type plumbing; kept fallible for parity
    /// with the other operations.
    pub async fn detach(&self, key: &SessionKey, options: DetachOptions) -> PoolResult<()> {
        let handle = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(key)
        };
        let Some(handle) = handle else {
            debug!(session = %key, "Detach on unknown session is a no-op");
            return Ok(());
        };
        let intent = if options.preserve_session {
            DetachIntent::Preserve {
                reason: options.reason,
            }
        } else {
            DetachIntent::Logout
        };
        *handle.detach_intent.lock().await = Some(intent);
        handle.cancel.cancel();
        info!(session = %key, preserve = options.preserve_session, "Session detach requested");
        Ok(())
    }

    /// Send a message through an open session.
    ///
    /// # Errors
    ///
    /// [`PoolError::SessionNotFound`] / [`PoolError::NoActiveConnection`]
    /// when there is nothing open to send through; protocol errors
    /// otherwise. A network-class error also triggers a proxy rotation and
    /// reconnect in the background.
    pub async fn send(
        &self,
        key: &SessionKey,
        to: &PhoneNumber,
        content: &Value,
    ) -> PoolResult<String> {
        let handle = self
            .sessions
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| PoolError::SessionNotFound(key.to_string()))?;

        let snapshot = handle.snapshot().await;
        if !snapshot.is_open() {
            return Err(PoolError::NoActiveConnection(key.to_string()));
        }
        let socket = handle
            .socket
            .read()
            .await
            .clone()
            .ok_or_else(|| PoolError::NoActiveConnection(key.to_string()))?;

        match socket.send(to, content).await {
            Ok(message_id) => {
                self.prune_sent();
                self.sent_by_api.insert(message_id.clone(), Instant::now());
                {
                    let mut record = handle.record.write().await;
                    record.message_count = record.message_count.saturating_add(1);
                }
                if let Err(e) = self.coordinator.update_activity(key).await {
                    warn!(session = %key, error = %e, "Failed to bump session activity");
                }
                self.bus.publish(HubEvent::MessageSent {
                    metadata: EventMetadata::new("pool"),
                    key: key.clone(),
                    to: to.to_string(),
                    message_id: message_id.clone(),
                });
                Ok(message_id)
            }
            Err(e) => {
                if e.is_network() {
                    warn!(session = %key, error = %e,
                        "Network-class send failure, rotating proxy and reconnecting");
                    let _ = handle
                        .commands
                        .try_send(SessionCommand::Reconnect { rotate: true });
                }
                Err(e.into())
            }
        }
    }

    /// The session's projection snapshot.
    pub async fn status(&self, key: &SessionKey) -> Option<ConnectionState> {
        self.state.snapshot(key)
    }

    /// Force a reconnect, re-attaching from stored credentials when the
    /// session is not live. Rate limited per key.
    ///
    /// # Errors
    ///
    /// Infrastructure failures only; lifecycle outcomes are reported in
    /// [`ReconnectOutcome`].
    pub async fn reconnect(
        self: &Arc<Self>,
        key: &SessionKey,
        force_new: bool,
    ) -> PoolResult<ReconnectOutcome> {
        if !self.rate_limiter.try_acquire(key) {
            return Ok(ReconnectOutcome::RateLimited);
        }

        let handle = self.sessions.read().await.get(key).cloned();
        match handle {
            Some(handle) if force_new => {
                drop(handle);
                self.detach(
                    key,
                    DetachOptions {
                        preserve_session: true,
                        reason: "forced re-pair".to_string(),
                    },
                )
                .await?;
                self.blobs.delete(key).await?;
                if let Err(e) = self
                    .attach(key.clone(), AttachOptions::default())
                    .await
                {
                    warn!(session = %key, error = %e, "Forced reconnect attach failed");
                    return Ok(ReconnectOutcome::ConnectionFailed);
                }
                Ok(self.poll_outcome(key).await)
            }
            Some(handle) => {
                let snapshot = handle.snapshot().await;
                if snapshot.phase == ConnectionPhase::Connected {
                    return Ok(ReconnectOutcome::Connected);
                }
                if handle
                    .commands
                    .try_send(SessionCommand::Reconnect { rotate: false })
                    .is_err()
                {
                    return Ok(ReconnectOutcome::ConnectionFailed);
                }
                Ok(self.poll_outcome(key).await)
            }
            None => {
                let has_blob = self.blobs.load(key).await?.is_some();
                if !has_blob {
                    return Ok(ReconnectOutcome::SessionNotFound);
                }
                let options = AttachOptions {
                    is_recovery: true,
                    ..AttachOptions::default()
                };
                if let Err(e) = self.attach(key.clone(), options).await {
                    warn!(session = %key, error = %e, "Reconnect attach failed");
                    return Ok(ReconnectOutcome::ConnectionFailed);
                }
                Ok(self.poll_outcome(key).await)
            }
        }
    }

    /// Watch a session until it reaches a reportable state.
    async fn poll_outcome(&self, key: &SessionKey) -> ReconnectOutcome {
        let deadline = Instant::now();
        loop {
            if deadline.elapsed() > self.config.timings.attach_deadline {
                return ReconnectOutcome::Timeout;
            }
            match self.snapshot_of(key).await {
                Some(snapshot) => match snapshot.phase {
                    ConnectionPhase::Connected
                    | ConnectionPhase::ImportingContacts
                    | ConnectionPhase::ImportingMessages => return ReconnectOutcome::Connected,
                    ConnectionPhase::QrPending => return ReconnectOutcome::NeedsQr,
                    ConnectionPhase::Failed => return ReconnectOutcome::Failed,
                    ConnectionPhase::Disconnected => return ReconnectOutcome::ConnectionFailed,
                    ConnectionPhase::Connecting | ConnectionPhase::Restarting => {}
                },
                None => return ReconnectOutcome::ConnectionFailed,
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Re-attach every persisted session at process start.
    ///
    /// Recovery attaches inherit completed pairing and import gates and
    /// the stored egress country; the country is never re-detected.
    ///
    /// # Errors
    ///
    /// Surfaces store scan failures; individual attach failures are logged
    /// and skipped.
    pub async fn recover_on_startup(self: &Arc<Self>) -> PoolResult<usize> {
        let rows = self.state.recover_all().await?;
        let statuses: HashMap<SessionKey, ConnectionStatus> = rows
            .iter()
            .map(|state| (state.key.clone(), state.status))
            .collect();
        let countries: HashMap<SessionKey, CountryCode> = rows
            .iter()
            .filter_map(|state| {
                state
                    .proxy_country
                    .clone()
                    .map(|country| (state.key.clone(), country))
            })
            .collect();

        let mut recovered = 0_usize;
        for key in self.blobs.list_all().await? {
            if statuses.get(&key) == Some(&ConnectionStatus::LoggedOut) {
                continue;
            }
            if self.session_count().await >= self.config.max_connections {
                warn!("Recovery stopped at capacity");
                break;
            }
            let options = AttachOptions {
                country: countries.get(&key).cloned(),
                browser_name: None,
                is_recovery: true,
            };
            match self.attach(key.clone(), options).await {
                Ok(_) => recovered = recovered.saturating_add(1),
                Err(e) => warn!(session = %key, error = %e, "Recovery attach failed"),
            }
        }
        info!(recovered, "Startup recovery complete");
        Ok(recovered)
    }

    /// Shut the pool down, then release this instance's registrations.
    pub async fn shutdown(&self, mode: ShutdownMode) {
        let handles: Vec<(SessionKey, Arc<SessionHandle>)> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .map(|(key, handle)| (key.clone(), Arc::clone(handle)))
                .collect()
        };
        info!(sessions = handles.len(), ?mode, "Pool shutdown");
        for (_, handle) in &handles {
            let intent = match mode {
                ShutdownMode::Preserving => DetachIntent::ShutdownPreserving,
                ShutdownMode::Logout => DetachIntent::Logout,
            };
            *handle.detach_intent.lock().await = Some(intent);
            handle.cancel.cancel();
        }

        // Owner tasks remove themselves as they finalize.
        let deadline = Instant::now();
        while self.session_count().await > 0 {
            if deadline.elapsed() > Duration::from_secs(10) {
                let remaining = self.session_count().await;
                warn!(remaining, "Shutdown wait expired");
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        if let Err(e) = self.coordinator.shutdown().await {
            warn!(error = %e, "Coordinator shutdown failed");
        }
        self.bus.publish(HubEvent::InstanceShutdown {
            metadata: EventMetadata::new("pool"),
            instance_id: self.coordinator.instance_id().to_string(),
        });
    }

    // ---- helpers for the owner task ----

    pub(crate) async fn take_intent(&self, handle: &SessionHandle) -> DetachIntent {
        handle
            .detach_intent
            .lock()
            .await
            .take()
            .unwrap_or(DetachIntent::Preserve {
                reason: "detached".to_string(),
            })
    }

    pub(crate) async fn close_socket(&self, handle: &SessionHandle) {
        let socket = handle.socket.write().await.take();
        if let Some(socket) = socket {
            let _ = socket.close().await;
        }
    }

    /// Tear a session down after its owner task observed a detach intent
    /// or a terminal close.
    ///
    /// When a newer attach has already superseded this handle for the same
    /// key, only this handle's own socket is closed; the proxy, ownership,
    /// and projection now belong to the successor.
    pub(crate) async fn finalize(&self, handle: &Arc<SessionHandle>, intent: DetachIntent) {
        let key = handle.record.read().await.key.clone();

        let socket = handle.socket.write().await.take();
        if let Some(socket) = socket {
            match intent {
                DetachIntent::Logout => {
                    if let Err(e) = socket.logout().await {
                        warn!(session = %key, error = %e, "Protocol logout failed");
                    }
                }
                _ => {
                    let _ = socket.close().await;
                }
            }
        }
        {
            let mut record = handle.record.write().await;
            record.phase = ConnectionPhase::Disconnected;
        }

        if !self.remove_handle_if_current(&key, handle).await {
            debug!(session = %key, "Superseded by a newer attach; socket closed only");
            return;
        }

        let proxy_released = handle.record.read().await.proxy_released;
        if !proxy_released && let Some(allocator) = &self.allocator {
            allocator.release_for(&key).await;
        }

        match intent {
            DetachIntent::Preserve { reason } => {
                if let Err(e) = self.state.mark_disconnected(&key, &reason).await {
                    warn!(session = %key, error = %e, "Failed to project disconnected");
                }
            }
            DetachIntent::Logout => {
                if let Err(e) = self.blobs.delete(&key).await {
                    warn!(session = %key, error = %e, "Failed to delete credential blob");
                }
                if let Err(e) = self
                    .state
                    .update(&key, StateDelta::status(ConnectionStatus::LoggedOut))
                    .await
                {
                    warn!(session = %key, error = %e, "Failed to project logged_out");
                }
                self.state.evict(&key);
            }
            DetachIntent::ShutdownPreserving => {
                if let Err(e) = self
                    .state
                    .update(&key, StateDelta::status(ConnectionStatus::PendingRecovery))
                    .await
                {
                    warn!(session = %key, error = %e, "Failed to project pending_recovery");
                }
            }
        }

        // Ownership goes last, strictly after socket closure.
        if let Err(e) = self.coordinator.release_ownership(&key).await {
            warn!(session = %key, error = %e, "Failed to release ownership");
        }
        debug!(session = %key, "Session finalized");
    }

    pub(crate) async fn fail_session(&self, handle: &Arc<SessionHandle>, reason: &str) {
        let key = {
            let mut record = handle.record.write().await;
            record.phase = ConnectionPhase::Failed;
            record.key.clone()
        };
        self.close_socket(handle).await;
        if !self.remove_handle_if_current(&key, handle).await {
            return;
        }
        if let Some(allocator) = &self.allocator {
            allocator.release_for(&key).await;
        }
        if let Err(e) = self.state.mark_failed(&key, reason).await {
            warn!(session = %key, error = %e, "Failed to project failed");
        }
        if let Err(e) = self.coordinator.release_ownership(&key).await {
            warn!(session = %key, error = %e, "Failed to release ownership");
        }
        warn!(session = %key, reason, "Session failed");
    }

    pub(crate) async fn rotate_proxy(&self, handle: &SessionHandle) {
        let Some(allocator) = &self.allocator else {
            return;
        };
        let key = handle.record.read().await.key.clone();
        match allocator.rotate(&key).await {
            Ok(assignment) => {
                {
                    let mut record = handle.record.write().await;
                    record.country = assignment.country.clone();
                    record.proxy_released = false;
                }
                self.bus.publish(HubEvent::ProxyRotated {
                    metadata: EventMetadata::new("pool"),
                    key: key.clone(),
                    country: assignment.country,
                });
            }
            Err(e) => warn!(session = %key, error = %e, "Proxy rotation failed"),
        }
    }

    /// Open a replacement socket for an existing session.
    pub(crate) async fn reconnect_socket(
        &self,
        handle: &SessionHandle,
    ) -> PoolResult<wahub_protocol::EventStream> {
        let (key, country) = {
            let record = handle.record.read().await;
            (record.key.clone(), record.country.clone())
        };

        let proxy = if self.config.use_proxy {
            let allocator = self.allocator.as_ref().ok_or_else(|| {
                PoolError::Internal("proxy enabled without allocator".to_string())
            })?;
            let assignment = match allocator.assignment_of(&key) {
                Some(assignment) => assignment,
                None => {
                    let assignment = allocator.assign(&key, &country).await?;
                    let mut record = handle.record.write().await;
                    record.proxy_released = false;
                    record.country = assignment.country.clone();
                    assignment
                }
            };
            Some(ProxyEndpoint {
                ip: assignment.ip,
                port: assignment.port,
            })
        } else {
            None
        };

        let blob = self.blobs.load(&key).await?;
        let options = ConnectOptions {
            key: key.clone(),
            blob,
            proxy,
            browser_name: self.config.browser_name.clone(),
        };
        let connect = tokio::time::timeout(
            self.config.timings.attach_deadline,
            self.connector.connect(options),
        )
        .await;
        match connect {
            Ok(Ok((socket, events))) => {
                *handle.socket.write().await = Some(socket);
                debug!(session = %key, "Replacement socket established");
                Ok(events)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(PoolError::Timeout(format!("reconnect {key}"))),
        }
    }

    pub(crate) async fn release_proxy_after_stable_open(&self, handle: &SessionHandle) {
        let (key, eligible) = {
            let record = handle.record.read().await;
            (
                record.key.clone(),
                record.is_open() && record.connected_once && !record.proxy_released,
            )
        };
        if !eligible {
            return;
        }
        if let Some(allocator) = &self.allocator {
            allocator.release_for(&key).await;
        }
        handle.record.write().await.proxy_released = true;
        info!(session = %key, "Session stable, egress IP released");
    }

    /// Consume a sent-by-API marker, pruning expired entries as a side
    /// effect. Returns whether the id was API-originated.
    pub(crate) fn take_sent_by_api(&self, message_id: &str) -> bool {
        self.prune_sent();
        self.sent_by_api.remove(message_id).is_some()
    }

    fn prune_sent(&self) {
        let ttl = self.config.timings.sent_ttl;
        self.sent_by_api.retain(|_, sent_at| sent_at.elapsed() < ttl);
    }

    /// Remove the map entry for `key` if it still points at `handle`.
    ///
    /// Returns `true` when this handle was the key's last occupant (entry
    /// removed here, or already gone); `false` when a newer handle has
    /// taken the key over.
    pub(crate) async fn remove_handle_if_current(
        &self,
        key: &SessionKey,
        handle: &Arc<SessionHandle>,
    ) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(key) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                sessions.remove(key);
                true
            }
            Some(_) => false,
            None => true,
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("max_connections", &self.config.max_connections)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wahub_coordinator::CoordinatorConfig;
    use wahub_protocol::testing::ScriptedConnector;
    use wahub_secrets::{SecretStore, StaticSecretProvider, names};
    use wahub_session_store::{SessionStoreConfig, StoreMode};
    use wahub_state::StateManagerConfig;
    use wahub_storage::{DocumentStore, MemoryDocumentStore};

    const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    struct Rig {
        pool: Arc<ConnectionPool>,
        connector: Arc<ScriptedConnector>,
        docs: Arc<MemoryDocumentStore>,
        _dir: tempfile::TempDir,
    }

    async fn rig(connector: ScriptedConnector, max_connections: usize) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let docs = Arc::new(MemoryDocumentStore::new());
        let secrets = Arc::new(SecretStore::new(Arc::new(
            StaticSecretProvider::new().with(names::SESSION_ENCRYPTION_KEY, KEY_HEX),
        )));
        let blobs = Arc::new(
            SessionStore::new(
                SessionStoreConfig {
                    mode: StoreMode::Local,
                    root: dir.path().to_path_buf(),
                    backup_interval: Duration::from_secs(300),
                },
                None,
                secrets,
            )
            .unwrap(),
        );
        let coordinator = Arc::new(InstanceCoordinator::new(
            Arc::clone(&docs) as Arc<dyn DocumentStore>,
            CoordinatorConfig {
                instance_id: "pool-test".to_string(),
                ..CoordinatorConfig::default()
            },
        ));
        coordinator.start().await.unwrap();
        let bus = EventBus::new();
        let state = Arc::new(StateManager::new(
            Arc::clone(&docs) as Arc<dyn DocumentStore>,
            bus.clone(),
            StateManagerConfig {
                retry_delays: vec![Duration::from_millis(5)],
                ..StateManagerConfig::default()
            },
        ));
        let connector = Arc::new(connector);
        let config = PoolConfig {
            max_connections,
            use_proxy: false,
            reconnect_delay: Duration::from_millis(10),
            ..PoolConfig::default()
        };
        let pool = Arc::new(ConnectionPool::new(
            Arc::clone(&connector) as Arc<dyn ProtocolConnector>,
            None,
            blobs,
            coordinator,
            state,
            bus,
            config,
        ));
        Rig {
            pool,
            connector,
            docs,
            _dir: dir,
        }
    }

    fn key(phone: &str) -> SessionKey {
        SessionKey::parse("U1", phone).unwrap()
    }

    #[tokio::test]
    async fn test_attach_is_idempotent() {
        let rig = rig(ScriptedConnector::manual(), 10).await;
        let k = key("+12025550101");

        let first = rig.pool.attach(k.clone(), AttachOptions::default()).await.unwrap();
        let second = rig.pool.attach(k.clone(), AttachOptions::default()).await.unwrap();
        assert_eq!(first.key, second.key);
        assert_eq!(rig.connector.connect_count(), 1);
        assert_eq!(rig.pool.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_capacity_refused_with_event() {
        let rig = rig(ScriptedConnector::manual(), 1).await;
        let mut receiver = rig.pool.bus.subscribe();

        rig.pool
            .attach(key("+12025550101"), AttachOptions::default())
            .await
            .unwrap();
        let err = rig
            .pool
            .attach(key("+12025550102"), AttachOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::CapacityReached(1)));

        let mut saw_capacity = false;
        while let Some(event) = receiver.try_recv() {
            if event.event_type() == "capacity_reached" {
                saw_capacity = true;
            }
        }
        assert!(saw_capacity);
    }

    #[tokio::test]
    async fn test_ownership_denied_when_other_instance_owns() {
        let rig = rig(ScriptedConnector::manual(), 10).await;
        let k = key("+12025550101");

        // Another live instance owns the session
        let other = InstanceCoordinator::new(
            Arc::clone(&rig.docs) as Arc<dyn DocumentStore>,
            CoordinatorConfig {
                instance_id: "other".to_string(),
                ..CoordinatorConfig::default()
            },
        );
        other.start().await.unwrap();
        other.heartbeat().await.unwrap();
        assert!(other.request_ownership(&k).await.unwrap());

        let err = rig
            .pool
            .attach(k.clone(), AttachOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::OwnershipDenied(_)));
        assert_eq!(rig.connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_detach_unknown_is_noop() {
        let rig = rig(ScriptedConnector::manual(), 10).await;
        rig.pool
            .detach(
                &key("+12025550101"),
                DetachOptions {
                    preserve_session: true,
                    reason: "test".to_string(),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_without_session() {
        let rig = rig(ScriptedConnector::manual(), 10).await;
        let to = PhoneNumber::parse("+3212345678").unwrap();
        let err = rig
            .pool
            .send(&key("+12025550101"), &to, &serde_json::json!({"text": "hi"}))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_send_before_open_is_no_active_connection() {
        let rig = rig(ScriptedConnector::manual(), 10).await;
        let k = key("+12025550101");
        rig.pool.attach(k.clone(), AttachOptions::default()).await.unwrap();

        let to = PhoneNumber::parse("+3212345678").unwrap();
        let err = rig
            .pool
            .send(&k, &to, &serde_json::json!({"text": "hi"}))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::NoActiveConnection(_)));
    }
}
