//! Three-view drift repair.
//!
//! Memory, socket, and projection can disagree after crashes, races, and
//! lost events. Every sweep walks the projection rows and repairs, per
//! key (never cross-key, no global transactions):
//!
//! 1. projection ≠ memory → write the memory status
//! 2. projection `connected` with no live session → `disconnected`
//!    (after a second look at the pool, to ride out attach races)
//! 3. projection stuck in `connecting`/`initializing` with no socket →
//!    `disconnected` (no auto-retry; whatever broke the attach may still
//!    be broken)
//! 4. projection stuck in `importing_*` with no progress → force
//!    `connected` with `sync_status=completed` (the terminal import event
//!    never arrived)

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wahub_core::{ConnectionStatus, SessionKey};
use wahub_events::{EventMetadata, HubEvent};
use wahub_state::{ProjectionRow, StateDelta};

use crate::pool::ConnectionPool;

/// Reconciler settings.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Sweep cadence.
    pub interval: Duration,
    /// Age after which `connecting`/`initializing` counts as stuck.
    pub stuck_connecting: Duration,
    /// Age after which `importing_*` counts as stuck.
    pub stuck_importing: Duration,
    /// Drifts per sweep above which an alert event is published.
    pub alert_threshold: u64,
    /// How many recent drift events are retained.
    pub recent_capacity: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(120),
            stuck_connecting: Duration::from_secs(120),
            stuck_importing: Duration::from_secs(60),
            alert_threshold: 10,
            recent_capacity: 50,
        }
    }
}

/// What kind of drift was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftKind {
    /// Projection status disagreed with memory.
    StatusMismatch,
    /// Projection said connected with no live session.
    OrphanProjection,
    /// Projection sat in connecting/initializing too long.
    StuckConnecting,
    /// Projection sat in importing too long.
    StuckImport,
}

/// One observed drift.
#[derive(Debug, Clone)]
pub struct DriftEvent {
    /// Session the drift concerned.
    pub key: SessionKey,
    /// Drift classification.
    pub kind: DriftKind,
    /// When the sweep observed it.
    pub at: DateTime<Utc>,
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Drifts observed.
    pub detected: u64,
    /// Drifts repaired.
    pub fixed: u64,
    /// Repairs that errored.
    pub failed: u64,
}

/// The periodic drift repair loop.
pub struct Reconciler {
    pool: Arc<ConnectionPool>,
    config: ReconcileConfig,
    total_detected: AtomicU64,
    total_fixed: AtomicU64,
    total_failed: AtomicU64,
    recent: std::sync::Mutex<VecDeque<DriftEvent>>,
}

impl Reconciler {
    /// Create a reconciler over the pool.
    #[must_use]
    pub fn new(pool: Arc<ConnectionPool>, config: ReconcileConfig) -> Self {
        Self {
            pool,
            config,
            total_detected: AtomicU64::new(0),
            total_fixed: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            recent: std::sync::Mutex::new(VecDeque::new()),
        }
    }

    /// Lifetime totals: `(detected, fixed, failed)`.
    #[must_use]
    pub fn totals(&self) -> (u64, u64, u64) {
        (
            self.total_detected.load(Ordering::Relaxed),
            self.total_fixed.load(Ordering::Relaxed),
            self.total_failed.load(Ordering::Relaxed),
        )
    }

    /// The most recent drift events, newest last.
    #[must_use]
    pub fn recent(&self) -> Vec<DriftEvent> {
        self.recent
            .lock()
            .map(|recent| recent.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Run one sweep.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let rows = match self.pool.state.list_projections().await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "Reconciliation sweep could not list projections");
                return report;
            }
        };

        for row in rows {
            if let Some(kind) = self.reconcile_row(&row, &mut report).await {
                self.record_drift(row.key.clone(), kind);
            }
        }

        self.total_detected.fetch_add(report.detected, Ordering::Relaxed);
        self.total_fixed.fetch_add(report.fixed, Ordering::Relaxed);
        self.total_failed.fetch_add(report.failed, Ordering::Relaxed);

        if report.detected > self.config.alert_threshold {
            warn!(detected = report.detected, "Excessive drift in one sweep");
            self.pool.bus.publish(HubEvent::DriftAlert {
                metadata: EventMetadata::new("reconciler"),
                detected: report.detected,
                fixed: report.fixed,
            });
        }
        if report.detected > 0 {
            info!(
                detected = report.detected,
                fixed = report.fixed,
                failed = report.failed,
                "Reconciliation sweep complete"
            );
        }
        report
    }

    async fn reconcile_row(
        &self,
        row: &ProjectionRow,
        report: &mut SweepReport,
    ) -> Option<DriftKind> {
        let key = &row.key;
        let projected = row.status?;
        if projected == ConnectionStatus::LoggedOut {
            return None;
        }
        let record = self.pool.snapshot_of(key).await;

        // Rule 1: memory is the source of truth when a session lives here.
        if let Some(record) = &record {
            let mem_status = record.phase.as_status();
            if projected != mem_status {
                report.detected = report.detected.saturating_add(1);
                debug!(session = %key, projected = %projected, memory = %mem_status,
                    "Projection drifted from memory");
                match self
                    .pool
                    .state
                    .update(key, StateDelta::status(mem_status))
                    .await
                {
                    Ok(Some(_)) => report.fixed = report.fixed.saturating_add(1),
                    // The write rules suppressed the value (a first-time
                    // import or pairing gate); the projection already
                    // shows the safer state, nothing to repair.
                    Ok(None) => {}
                    Err(e) => {
                        warn!(session = %key, error = %e, "Drift repair failed");
                        report.failed = report.failed.saturating_add(1);
                    }
                }
                return Some(DriftKind::StatusMismatch);
            }
            return None;
        }

        // Rule 2: connected with no session here. Look again before
        // repairing; an attach may have landed between the two reads.
        if projected == ConnectionStatus::Connected {
            if self.pool.snapshot_of(key).await.is_some() {
                return None;
            }
            report.detected = report.detected.saturating_add(1);
            match self
                .pool
                .state
                .mark_disconnected(key, "no live session for connected projection")
                .await
            {
                Ok(()) => report.fixed = report.fixed.saturating_add(1),
                Err(e) => {
                    warn!(session = %key, error = %e, "Orphan repair failed");
                    report.failed = report.failed.saturating_add(1);
                }
            }
            return Some(DriftKind::OrphanProjection);
        }

        let age = row
            .last_updated
            .map(|at| Utc::now().signed_duration_since(at))
            .and_then(|age| age.to_std().ok());

        // Rule 3: stuck connecting with no socket. The user must retry;
        // the underlying cause (proxy outage, vendor trouble) may still
        // be unresolved, so no automatic re-attach.
        if matches!(
            projected,
            ConnectionStatus::Connecting | ConnectionStatus::Initializing
        ) && age.is_some_and(|age| age > self.config.stuck_connecting)
            && !self.pool.socket_open(key).await
        {
            report.detected = report.detected.saturating_add(1);
            let delta = StateDelta {
                status: Some(ConnectionStatus::Disconnected),
                last_error: Some("connection attempt stalled".to_string()),
                ..StateDelta::default()
            };
            match self.pool.state.update(key, delta).await {
                Ok(_) => report.fixed = report.fixed.saturating_add(1),
                Err(e) => {
                    warn!(session = %key, error = %e, "Stuck-connecting repair failed");
                    report.failed = report.failed.saturating_add(1);
                }
            }
            return Some(DriftKind::StuckConnecting);
        }

        // Rule 4: stuck import whose terminal event never arrived.
        if projected.is_importing() && age.is_some_and(|age| age > self.config.stuck_importing) {
            report.detected = report.detected.saturating_add(1);
            let (contacts, messages) = self
                .pool
                .state
                .snapshot(key)
                .map_or((0, 0), |state| (state.sync_contacts, state.sync_messages));
            let result = async {
                self.pool
                    .state
                    .update_sync_progress(key, contacts, messages, true)
                    .await?;
                let delta = StateDelta {
                    status: Some(ConnectionStatus::Connected),
                    sync_completed: Some(true),
                    ..StateDelta::default()
                };
                self.pool.state.update(key, delta).await
            }
            .await;
            match result {
                Ok(_) => report.fixed = report.fixed.saturating_add(1),
                Err(e) => {
                    warn!(session = %key, error = %e, "Stuck-import repair failed");
                    report.failed = report.failed.saturating_add(1);
                }
            }
            return Some(DriftKind::StuckImport);
        }

        None
    }

    fn record_drift(&self, key: SessionKey, kind: DriftKind) {
        if let Ok(mut recent) = self.recent.lock() {
            recent.push_back(DriftEvent {
                key,
                kind,
                at: Utc::now(),
            });
            while recent.len() > self.config.recent_capacity {
                recent.pop_front();
            }
        }
    }

    /// Sweep driver. Runs until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                () = cancel.cancelled() => return,
            }
        }
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (detected, fixed, failed) = self.totals();
        f.debug_struct("Reconciler")
            .field("detected", &detected)
            .field("fixed", &fixed)
            .field("failed", &failed)
            .finish_non_exhaustive()
    }
}
