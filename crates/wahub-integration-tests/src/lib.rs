//! Test harness assembling the full session runtime over in-memory
//! backends: scripted protocol driver, fake proxy vendor, memory document
//! and object stores, and a temp-dir blob store.

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![allow(clippy::unwrap_used, clippy::missing_panics_doc, missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use wahub_coordinator::{CoordinatorConfig, InstanceCoordinator};
use wahub_core::{ConnectionPhase, ConnectionStatus, SessionKey};
use wahub_events::{EventBus, EventReceiver, HubEvent};
use wahub_pool::{ConnectionPool, PoolConfig, PoolTimings};
use wahub_protocol::ProtocolConnector;
use wahub_protocol::testing::{ScriptedConnector, ScriptedSession};
use wahub_proxy::testing::FakeVendor;
use wahub_proxy::{AllocatorConfig, ProxyAllocator, ProxyVendor, RegionTableOracle};
use wahub_secrets::{SecretStore, StaticSecretProvider, names};
use wahub_session_store::{SessionStore, SessionStoreConfig, StoreMode};
use wahub_state::{StateManager, StateManagerConfig};
use wahub_storage::{DocumentStore, MemoryDocumentStore, MemoryObjectStore, ObjectStore};

pub const TEST_KEY_HEX: &str =
    "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

/// Short-duration timings so lifecycle tests finish in milliseconds.
#[must_use]
pub fn test_timings() -> PoolTimings {
    PoolTimings {
        attach_deadline: Duration::from_secs(2),
        qr_timeout: Duration::from_millis(300),
        stable_open: Duration::from_millis(120),
        sync_grace: Duration::from_millis(40),
        sync_timeout: Duration::from_secs(2),
        replaced_wait: Duration::from_millis(80),
        sent_ttl: Duration::from_secs(300),
    }
}

pub struct HarnessBuilder {
    auto_open: bool,
    use_proxy: bool,
    vendor: FakeVendor,
    strict_proxy: bool,
    max_connections: usize,
    max_reconnect_attempts: u32,
    reconnect_rate_limit: u32,
    instance_id: String,
    docs: Option<Arc<MemoryDocumentStore>>,
    objects: Option<Arc<MemoryObjectStore>>,
    blob_root: Option<PathBuf>,
}

impl HarnessBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            auto_open: false,
            use_proxy: false,
            vendor: FakeVendor::new(),
            strict_proxy: false,
            max_connections: 10,
            max_reconnect_attempts: 5,
            reconnect_rate_limit: 50,
            instance_id: "test-instance".to_string(),
            docs: None,
            objects: None,
            blob_root: None,
        }
    }

    /// Sessions emit `Opened` as soon as they connect.
    #[must_use]
    pub fn auto_open(mut self) -> Self {
        self.auto_open = true;
        self
    }

    #[must_use]
    pub fn with_proxy(mut self, vendor: FakeVendor) -> Self {
        self.use_proxy = true;
        self.vendor = vendor;
        self
    }

    #[must_use]
    pub fn strict_proxy(mut self) -> Self {
        self.strict_proxy = true;
        self
    }

    #[must_use]
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    #[must_use]
    pub fn max_reconnect_attempts(mut self, max: u32) -> Self {
        self.max_reconnect_attempts = max;
        self
    }

    #[must_use]
    pub fn reconnect_rate_limit(mut self, limit: u32) -> Self {
        self.reconnect_rate_limit = limit;
        self
    }

    #[must_use]
    pub fn instance_id(mut self, id: &str) -> Self {
        self.instance_id = id.to_string();
        self
    }

    /// Share backing stores with another harness (multi-instance tests).
    #[must_use]
    pub fn sharing(mut self, other: &Harness) -> Self {
        self.docs = Some(Arc::clone(&other.docs));
        self.objects = Some(Arc::clone(&other.objects));
        self
    }

    /// Reuse an existing blob directory (restart tests).
    #[must_use]
    pub fn blob_root(mut self, root: PathBuf) -> Self {
        self.blob_root = Some(root);
        self
    }

    pub async fn build(self) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let blob_root = self.blob_root.unwrap_or_else(|| dir.path().to_path_buf());
        let docs = self.docs.unwrap_or_else(|| Arc::new(MemoryDocumentStore::new()));
        let objects = self
            .objects
            .unwrap_or_else(|| Arc::new(MemoryObjectStore::new()));
        let secrets = Arc::new(SecretStore::new(Arc::new(
            StaticSecretProvider::new().with(names::SESSION_ENCRYPTION_KEY, TEST_KEY_HEX),
        )));
        let blobs = Arc::new(
            SessionStore::new(
                SessionStoreConfig {
                    mode: StoreMode::Hybrid,
                    root: blob_root,
                    backup_interval: Duration::from_secs(300),
                },
                Some(Arc::clone(&objects) as Arc<dyn ObjectStore>),
                secrets,
            )
            .unwrap(),
        );

        let vendor = Arc::new(self.vendor);
        let allocator = if self.use_proxy {
            Some(Arc::new(ProxyAllocator::new(
                Arc::clone(&vendor) as Arc<dyn ProxyVendor>,
                Arc::new(RegionTableOracle::new()),
                AllocatorConfig {
                    strict: self.strict_proxy,
                    backoff_base: Duration::from_millis(1),
                    ..AllocatorConfig::default()
                },
            )))
        } else {
            None
        };

        let coordinator = Arc::new(InstanceCoordinator::new(
            Arc::clone(&docs) as Arc<dyn DocumentStore>,
            CoordinatorConfig {
                instance_id: self.instance_id.clone(),
                instance_url: format!("http://{}:8080", self.instance_id),
                max_connections: self.max_connections,
                ..CoordinatorConfig::default()
            },
        ));
        coordinator.start().await.unwrap();
        coordinator.heartbeat().await.unwrap();

        let bus = EventBus::new();
        let state = Arc::new(StateManager::new(
            Arc::clone(&docs) as Arc<dyn DocumentStore>,
            bus.clone(),
            StateManagerConfig {
                instance_url: format!("http://{}:8080", self.instance_id),
                retry_delays: vec![Duration::from_millis(5)],
                eviction_delay: Duration::from_secs(60),
                ..StateManagerConfig::default()
            },
        ));

        let connector = Arc::new(if self.auto_open {
            ScriptedConnector::auto_opening()
        } else {
            ScriptedConnector::manual()
        });

        let pool = Arc::new(ConnectionPool::new(
            Arc::clone(&connector) as Arc<dyn ProtocolConnector>,
            allocator.clone(),
            Arc::clone(&blobs),
            Arc::clone(&coordinator),
            Arc::clone(&state),
            bus.clone(),
            PoolConfig {
                max_connections: self.max_connections,
                auto_reconnect: true,
                max_reconnect_attempts: self.max_reconnect_attempts,
                reconnect_delay: Duration::from_millis(15),
                use_proxy: self.use_proxy,
                reconnect_rate_limit: self.reconnect_rate_limit,
                timings: test_timings(),
                ..PoolConfig::default()
            },
        ));

        Harness {
            pool,
            connector,
            vendor,
            allocator,
            docs,
            objects,
            blobs,
            state,
            coordinator,
            bus,
            _dir: dir,
        }
    }
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Harness {
    pub pool: Arc<ConnectionPool>,
    pub connector: Arc<ScriptedConnector>,
    pub vendor: Arc<FakeVendor>,
    pub allocator: Option<Arc<ProxyAllocator>>,
    pub docs: Arc<MemoryDocumentStore>,
    pub objects: Arc<MemoryObjectStore>,
    pub blobs: Arc<SessionStore>,
    pub state: Arc<StateManager>,
    pub coordinator: Arc<InstanceCoordinator>,
    pub bus: EventBus,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        HarnessBuilder::new().build().await
    }

    /// The `i`-th scripted session handed out by the connector, waiting
    /// briefly for it to appear.
    pub async fn session(&self, i: usize) -> Arc<ScriptedSession> {
        for _ in 0..100 {
            if let Some(session) = self.connector.session(i).await {
                return session;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {i} never connected");
    }

    /// Wait until the pool record reaches the phase.
    pub async fn wait_phase(&self, key: &SessionKey, phase: ConnectionPhase) -> bool {
        for _ in 0..200 {
            if let Some(snapshot) = self.pool.snapshot_of(key).await
                && snapshot.phase == phase
            {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Wait until the pool has no record for the key.
    pub async fn wait_absent(&self, key: &SessionKey) -> bool {
        for _ in 0..200 {
            if self.pool.snapshot_of(key).await.is_none() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// The projection row's status, straight from the document store.
    pub async fn doc_status(&self, key: &SessionKey) -> Option<ConnectionStatus> {
        self.state
            .read_projection(key)
            .await
            .unwrap()
            .and_then(|row| row.status)
    }

    /// Wait until the projected status equals `status`.
    pub async fn wait_doc_status(&self, key: &SessionKey, status: ConnectionStatus) -> bool {
        for _ in 0..200 {
            if self.doc_status(key).await == Some(status) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

#[must_use]
pub fn key(user: &str, phone: &str) -> SessionKey {
    SessionKey::parse(user, phone).unwrap()
}

/// Drain every pending event, returning the status of each
/// `connection_update` in publish order.
#[must_use]
pub fn drain_status_updates(receiver: &mut EventReceiver) -> Vec<ConnectionStatus> {
    let mut statuses = Vec::new();
    while let Some(event) = receiver.try_recv() {
        if let HubEvent::ConnectionUpdate { status, .. } = event.as_ref() {
            statuses.push(*status);
        }
    }
    statuses
}

/// Drain every pending event, returning the topic names in order.
#[must_use]
pub fn drain_event_types(receiver: &mut EventReceiver) -> Vec<&'static str> {
    let mut types = Vec::new();
    while let Some(event) = receiver.try_recv() {
        types.push(event.event_type());
    }
    types
}
