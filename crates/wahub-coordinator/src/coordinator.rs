//! The instance coordinator.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashSet;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wahub_core::SessionKey;
use wahub_storage::{DocPath, DocumentStore, FieldPatch};

use crate::error::CoordResult;
use crate::records::{
    InstanceRecord, InstanceStatus, LoadSampler, NoopSampler, OwnershipRecord, PlacementStrategy,
};

const INSTANCES: &str = "instances";
const OWNERSHIP: &str = "session_ownership";

/// Coordinator settings.
#[derive(Clone)]
pub struct CoordinatorConfig {
    /// This instance's id; generated when empty.
    pub instance_id: String,
    /// Hostname reported in the registry.
    pub hostname: String,
    /// URL front doors route to.
    pub instance_url: String,
    /// Heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which an instance is stale.
    pub instance_timeout: Duration,
    /// Stale-instance sweep cadence.
    pub cleanup_interval: Duration,
    /// Ownership cap for this instance.
    pub max_connections: usize,
    /// Placement policy for advisory routing.
    pub strategy: PlacementStrategy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            instance_id: String::new(),
            hostname: "localhost".to_string(),
            instance_url: "http://localhost:8080".to_string(),
            heartbeat_interval: Duration::from_secs(15),
            instance_timeout: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(60),
            max_connections: 50,
            strategy: PlacementStrategy::default(),
        }
    }
}

/// Cluster-wide coordination: instance registry, heartbeats, and
/// session ownership.
pub struct InstanceCoordinator {
    store: Arc<dyn DocumentStore>,
    config: CoordinatorConfig,
    instance_id: String,
    sampler: Arc<dyn LoadSampler>,
    owned: DashSet<SessionKey>,
    round_robin: AtomicUsize,
}

impl InstanceCoordinator {
    /// Create a coordinator with a no-op load sampler.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, config: CoordinatorConfig) -> Self {
        Self::with_sampler(store, config, Arc::new(NoopSampler))
    }

    /// Create a coordinator with an injected load sampler.
    #[must_use]
    pub fn with_sampler(
        store: Arc<dyn DocumentStore>,
        config: CoordinatorConfig,
        sampler: Arc<dyn LoadSampler>,
    ) -> Self {
        let instance_id = if config.instance_id.is_empty() {
            format!("wahub-{}", Uuid::new_v4())
        } else {
            config.instance_id.clone()
        };
        Self {
            store,
            config,
            instance_id,
            sampler,
            owned: DashSet::new(),
            round_robin: AtomicUsize::new(0),
        }
    }

    /// This instance's id.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Sessions this instance currently owns.
    #[must_use]
    pub fn owned_count(&self) -> usize {
        self.owned.len()
    }

    fn instance_path(&self, instance_id: &str) -> CoordResult<DocPath> {
        Ok(DocPath::new(INSTANCES, instance_id)?)
    }

    fn ownership_path(key: &SessionKey) -> CoordResult<DocPath> {
        Ok(DocPath::new(OWNERSHIP, key.to_string())?)
    }

    /// Register this instance with status `starting`.
    ///
    /// # Errors
    ///
    /// Surfaces document-store failures.
    pub async fn start(&self) -> CoordResult<()> {
        let snapshot = self.sampler.sample();
        let record = InstanceRecord {
            instance_id: self.instance_id.clone(),
            hostname: self.config.hostname.clone(),
            instance_url: self.config.instance_url.clone(),
            started_at: Utc::now(),
            last_heartbeat: Utc::now(),
            status: InstanceStatus::Starting,
            connection_count: 0,
            max_connections: self.config.max_connections,
            memory_ratio: snapshot.memory_ratio,
            cpu_ratio: snapshot.cpu_ratio,
        };
        let path = self.instance_path(&self.instance_id)?;
        self.store.set(&path, serde_json::to_value(&record)?).await?;
        info!(instance_id = %self.instance_id, "Instance registered");
        Ok(())
    }

    /// Refresh this instance's registry record.
    ///
    /// # Errors
    ///
    /// Surfaces document-store failures.
    pub async fn heartbeat(&self) -> CoordResult<()> {
        let snapshot = self.sampler.sample();
        let mut patch = FieldPatch::new();
        patch.insert(
            "last_heartbeat".to_string(),
            serde_json::to_value(Utc::now())?,
        );
        patch.insert("status".to_string(), Value::from("healthy"));
        patch.insert("connection_count".to_string(), Value::from(self.owned.len()));
        patch.insert("memory_ratio".to_string(), Value::from(snapshot.memory_ratio));
        patch.insert("cpu_ratio".to_string(), Value::from(snapshot.cpu_ratio));
        let path = self.instance_path(&self.instance_id)?;
        self.store.merge_fields(&path, &patch).await?;
        Ok(())
    }

    /// Heartbeat driver. Runs until cancelled.
    pub async fn heartbeat_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        warn!(error = %e, "Heartbeat failed");
                    }
                }
                () = cancel.cancelled() => return,
            }
        }
    }

    /// Try to acquire ownership of a session.
    ///
    /// Returns `true` when this instance now owns the session: a fresh
    /// claim, an idempotent re-acquire, or a takeover from a stale owner.
    /// Returns `false` when a live instance owns it or this instance is at
    /// its cap.
    ///
    /// # Errors
    ///
    /// Surfaces document-store failures.
    pub async fn request_ownership(&self, key: &SessionKey) -> CoordResult<bool> {
        if !self.owned.contains(key) && self.owned.len() >= self.config.max_connections {
            warn!(session = %key, cap = self.config.max_connections,
                "Ownership refused: instance at capacity");
            return Ok(false);
        }

        let path = Self::ownership_path(key)?;
        let current = self.store.get(&path).await?;

        match current {
            None => {
                let record = OwnershipRecord::acquire(&self.instance_id);
                let acquired = self
                    .store
                    .compare_and_swap(&path, None, Some(serde_json::to_value(&record)?))
                    .await?;
                if acquired {
                    self.owned.insert(key.clone());
                    debug!(session = %key, "Ownership acquired");
                }
                Ok(acquired)
            }
            Some(doc) => {
                let record: OwnershipRecord = serde_json::from_value(doc.clone())?;
                if record.instance_id == self.instance_id {
                    self.owned.insert(key.clone());
                    self.update_activity(key).await?;
                    return Ok(true);
                }
                if self.owner_is_live(&record.instance_id).await? {
                    debug!(session = %key, owner = %record.instance_id,
                        "Ownership denied: live owner exists");
                    return Ok(false);
                }
                // Stale owner: take over with a CAS so two takers race safely.
                let new_record = OwnershipRecord::acquire(&self.instance_id);
                let taken = self
                    .store
                    .compare_and_swap(&path, Some(&doc), Some(serde_json::to_value(&new_record)?))
                    .await?;
                if taken {
                    self.owned.insert(key.clone());
                    info!(session = %key, previous_owner = %record.instance_id,
                        "Took over session from stale owner");
                }
                Ok(taken)
            }
        }
    }

    async fn owner_is_live(&self, instance_id: &str) -> CoordResult<bool> {
        let path = self.instance_path(instance_id)?;
        let Some(doc) = self.store.get(&path).await? else {
            return Ok(false);
        };
        let record: InstanceRecord = serde_json::from_value(doc)?;
        if matches!(record.status, InstanceStatus::Failed) {
            return Ok(false);
        }
        let age = Utc::now().signed_duration_since(record.last_heartbeat);
        Ok(age.to_std().unwrap_or(Duration::ZERO) <= self.config.instance_timeout)
    }

    /// Release ownership of a session. A no-op when this instance does not
    /// own it.
    ///
    /// # Errors
    ///
    /// Surfaces document-store failures.
    pub async fn release_ownership(&self, key: &SessionKey) -> CoordResult<()> {
        let path = Self::ownership_path(key)?;
        if let Some(doc) = self.store.get(&path).await? {
            let record: OwnershipRecord = serde_json::from_value(doc.clone())?;
            if record.instance_id == self.instance_id {
                self.store.compare_and_swap(&path, Some(&doc), None).await?;
                debug!(session = %key, "Ownership released");
            }
        }
        self.owned.remove(key);
        Ok(())
    }

    /// Bump a session's activity timestamp.
    ///
    /// # Errors
    ///
    /// Surfaces document-store failures.
    pub async fn update_activity(&self, key: &SessionKey) -> CoordResult<()> {
        let path = Self::ownership_path(key)?;
        let mut patch = FieldPatch::new();
        patch.insert(
            "last_activity".to_string(),
            serde_json::to_value(Utc::now())?,
        );
        match self.store.update_fields(&path, &patch).await {
            Ok(()) | Err(wahub_storage::StorageError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Advisory placement: the best instance to host a new session, or
    /// `None` when nothing has capacity.
    ///
    /// # Errors
    ///
    /// Surfaces document-store failures.
    pub async fn best_instance_for(&self, _key: &SessionKey) -> CoordResult<Option<String>> {
        let mut eligible: Vec<InstanceRecord> = Vec::new();
        for (_, doc) in self.store.list(INSTANCES).await? {
            let record: InstanceRecord = serde_json::from_value(doc)?;
            let age = Utc::now().signed_duration_since(record.last_heartbeat);
            let fresh = age.to_std().unwrap_or(Duration::ZERO) <= self.config.instance_timeout;
            if fresh && record.has_capacity() {
                eligible.push(record);
            }
        }
        if eligible.is_empty() {
            return Ok(None);
        }
        eligible.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        let chosen = match self.config.strategy {
            PlacementStrategy::LeastConnections => eligible
                .iter()
                .min_by_key(|record| record.connection_count)
                .map(|record| record.instance_id.clone()),
            PlacementStrategy::ResourceBased => eligible
                .iter()
                .max_by(|a, b| {
                    a.resource_score()
                        .partial_cmp(&b.resource_score())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|record| record.instance_id.clone()),
            PlacementStrategy::RoundRobin => {
                let n = self.round_robin.fetch_add(1, Ordering::Relaxed);
                eligible
                    .get(n.checked_rem(eligible.len()).unwrap_or(0))
                    .map(|record| record.instance_id.clone())
            }
        };
        Ok(chosen)
    }

    /// Sweep the registry: mark stale instances `failed` and delete their
    /// ownership records so others can acquire. Returns the number of
    /// ownership records freed.
    ///
    /// # Errors
    ///
    /// Surfaces document-store failures.
    pub async fn cleanup_tick(&self) -> CoordResult<usize> {
        let mut dead: Vec<String> = Vec::new();
        for (id, doc) in self.store.list(INSTANCES).await? {
            let record: InstanceRecord = serde_json::from_value(doc)?;
            let age = Utc::now().signed_duration_since(record.last_heartbeat);
            let stale = age.to_std().unwrap_or(Duration::ZERO) > self.config.instance_timeout;
            if stale {
                if !matches!(record.status, InstanceStatus::Failed) {
                    let mut patch = FieldPatch::new();
                    patch.insert("status".to_string(), Value::from("failed"));
                    self.store
                        .merge_fields(&self.instance_path(&id)?, &patch)
                        .await?;
                    warn!(instance_id = %id, "Marked stale instance failed");
                }
                dead.push(id);
            }
        }

        let mut freed = 0_usize;
        if dead.is_empty() {
            return Ok(freed);
        }
        for (id, doc) in self.store.list(OWNERSHIP).await? {
            let record: OwnershipRecord = serde_json::from_value(doc)?;
            if dead.contains(&record.instance_id) {
                self.store.delete(&DocPath::new(OWNERSHIP, id)?).await?;
                freed = freed.saturating_add(1);
            }
        }
        if freed > 0 {
            info!(freed, "Freed ownership records of failed instances");
        }
        Ok(freed)
    }

    /// Cleanup driver. Runs until cancelled.
    pub async fn cleanup_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.cleanup_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.cleanup_tick().await {
                        warn!(error = %e, "Cleanup sweep failed");
                    }
                }
                () = cancel.cancelled() => return,
            }
        }
    }

    /// Mark this instance shutting down and release every owned session.
    ///
    /// # Errors
    ///
    /// Surfaces document-store failures.
    pub async fn shutdown(&self) -> CoordResult<()> {
        let mut patch = FieldPatch::new();
        patch.insert("status".to_string(), Value::from("shutting_down"));
        let path = self.instance_path(&self.instance_id)?;
        self.store.merge_fields(&path, &patch).await?;

        let keys: Vec<SessionKey> = self.owned.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            self.release_ownership(&key).await?;
        }
        info!(instance_id = %self.instance_id, "Instance shut down");
        Ok(())
    }
}

impl std::fmt::Debug for InstanceCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceCoordinator")
            .field("instance_id", &self.instance_id)
            .field("owned", &self.owned.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wahub_storage::MemoryDocumentStore;

    fn key(phone: &str) -> SessionKey {
        SessionKey::parse("U1", phone).unwrap()
    }

    fn config(id: &str) -> CoordinatorConfig {
        CoordinatorConfig {
            instance_id: id.to_string(),
            instance_url: format!("http://{id}:8080"),
            ..CoordinatorConfig::default()
        }
    }

    fn pair(store: &Arc<MemoryDocumentStore>) -> (InstanceCoordinator, InstanceCoordinator) {
        let store_a: Arc<dyn DocumentStore> = Arc::clone(store) as Arc<dyn DocumentStore>;
        let store_b: Arc<dyn DocumentStore> = Arc::clone(store) as Arc<dyn DocumentStore>;
        (
            InstanceCoordinator::new(store_a, config("instance-a")),
            InstanceCoordinator::new(store_b, config("instance-b")),
        )
    }

    async fn age_heartbeat(store: &MemoryDocumentStore, instance_id: &str, secs: i64) {
        let path = DocPath::new(INSTANCES, instance_id).unwrap();
        let mut patch = FieldPatch::new();
        let old = Utc::now()
            .checked_sub_signed(chrono::Duration::seconds(secs))
            .unwrap();
        patch.insert(
            "last_heartbeat".to_string(),
            serde_json::to_value(old).unwrap(),
        );
        store.merge_fields(&path, &patch).await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_and_idempotent_reacquire() {
        let store = Arc::new(MemoryDocumentStore::new());
        let (a, _b) = pair(&store);
        a.start().await.unwrap();

        assert!(a.request_ownership(&key("+12025550101")).await.unwrap());
        assert!(a.request_ownership(&key("+12025550101")).await.unwrap());
        assert_eq!(a.owned_count(), 1);
    }

    #[tokio::test]
    async fn test_live_owner_denies_second_instance() {
        let store = Arc::new(MemoryDocumentStore::new());
        let (a, b) = pair(&store);
        a.start().await.unwrap();
        b.start().await.unwrap();
        a.heartbeat().await.unwrap();

        assert!(a.request_ownership(&key("+12025550101")).await.unwrap());
        assert!(!b.request_ownership(&key("+12025550101")).await.unwrap());
    }

    #[tokio::test]
    async fn test_takeover_after_stale_heartbeat() {
        let store = Arc::new(MemoryDocumentStore::new());
        let (a, b) = pair(&store);
        a.start().await.unwrap();
        b.start().await.unwrap();
        let session = SessionKey::parse("U4", "+819012345678").unwrap();
        assert!(a.request_ownership(&session).await.unwrap());

        age_heartbeat(&store, "instance-a", 120).await;

        assert!(b.request_ownership(&session).await.unwrap());
        // The record now names instance-b
        let doc = store
            .get(&DocPath::new(OWNERSHIP, session.to_string()).unwrap())
            .await
            .unwrap()
            .unwrap();
        let record: OwnershipRecord = serde_json::from_value(doc).unwrap();
        assert_eq!(record.instance_id, "instance-b");
    }

    #[tokio::test]
    async fn test_missing_instance_record_is_stale() {
        let store = Arc::new(MemoryDocumentStore::new());
        let (a, b) = pair(&store);
        // A never registered; its claim is planted directly
        let session = key("+12025550101");
        let record = OwnershipRecord::acquire("instance-gone");
        store
            .set(
                &DocPath::new(OWNERSHIP, session.to_string()).unwrap(),
                serde_json::to_value(&record).unwrap(),
            )
            .await
            .unwrap();
        drop(a);
        b.start().await.unwrap();
        assert!(b.request_ownership(&session).await.unwrap());
    }

    #[tokio::test]
    async fn test_capacity_cap_refuses() {
        let store = Arc::new(MemoryDocumentStore::new());
        let store_dyn: Arc<dyn DocumentStore> = Arc::clone(&store) as Arc<dyn DocumentStore>;
        let coordinator = InstanceCoordinator::new(
            store_dyn,
            CoordinatorConfig {
                max_connections: 1,
                ..config("small")
            },
        );
        coordinator.start().await.unwrap();
        assert!(coordinator.request_ownership(&key("+12025550101")).await.unwrap());
        assert!(!coordinator.request_ownership(&key("+12025550102")).await.unwrap());
        // Re-acquire of an owned session still succeeds at the cap
        assert!(coordinator.request_ownership(&key("+12025550101")).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_then_other_acquires() {
        let store = Arc::new(MemoryDocumentStore::new());
        let (a, b) = pair(&store);
        a.start().await.unwrap();
        b.start().await.unwrap();
        a.heartbeat().await.unwrap();

        let session = key("+12025550101");
        assert!(a.request_ownership(&session).await.unwrap());
        a.release_ownership(&session).await.unwrap();
        assert_eq!(a.owned_count(), 0);
        assert!(b.request_ownership(&session).await.unwrap());
        // Releasing something we no longer own is a no-op
        a.release_ownership(&session).await.unwrap();
        assert!(b.owned.contains(&session));
    }

    #[tokio::test]
    async fn test_cleanup_frees_dead_instances() {
        let store = Arc::new(MemoryDocumentStore::new());
        let (a, b) = pair(&store);
        a.start().await.unwrap();
        b.start().await.unwrap();
        b.heartbeat().await.unwrap();
        let session = key("+12025550101");
        assert!(a.request_ownership(&session).await.unwrap());

        age_heartbeat(&store, "instance-a", 120).await;
        let freed = b.cleanup_tick().await.unwrap();
        assert_eq!(freed, 1);

        // Ownership record is gone, b can acquire immediately
        assert!(b.request_ownership(&session).await.unwrap());
    }

    #[tokio::test]
    async fn test_best_instance_least_connections() {
        let store = Arc::new(MemoryDocumentStore::new());
        let (a, b) = pair(&store);
        a.start().await.unwrap();
        b.start().await.unwrap();
        assert!(a.request_ownership(&key("+12025550101")).await.unwrap());
        a.heartbeat().await.unwrap();
        b.heartbeat().await.unwrap();

        let best = b.best_instance_for(&key("+12025550199")).await.unwrap();
        assert_eq!(best.as_deref(), Some("instance-b"));
    }

    #[tokio::test]
    async fn test_round_robin_rotates() {
        let store = Arc::new(MemoryDocumentStore::new());
        let store_dyn: Arc<dyn DocumentStore> = Arc::clone(&store) as Arc<dyn DocumentStore>;
        let coordinator = InstanceCoordinator::new(
            store_dyn,
            CoordinatorConfig {
                strategy: PlacementStrategy::RoundRobin,
                ..config("rr")
            },
        );
        coordinator.start().await.unwrap();
        let (a, b) = pair(&store);
        a.start().await.unwrap();
        b.start().await.unwrap();

        let k = key("+12025550101");
        let first = coordinator.best_instance_for(&k).await.unwrap();
        let second = coordinator.best_instance_for(&k).await.unwrap();
        assert_ne!(first, second);
    }
}
