//! Registry record types and load sampling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health of a registered instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Registered, not yet heartbeating.
    Starting,
    /// Heartbeating normally.
    Healthy,
    /// Heartbeating but resource-constrained.
    Degraded,
    /// Graceful shutdown in progress.
    ShuttingDown,
    /// Declared dead by the cleanup sweep.
    Failed,
}

/// One instance's row in the shared registry.
///
/// Mutated only by the owning instance's heartbeat; read by everyone for
/// placement and staleness decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Unique instance id.
    pub instance_id: String,
    /// Hostname, for operators.
    pub hostname: String,
    /// URL front doors should route attaches to.
    pub instance_url: String,
    /// When the instance registered.
    pub started_at: DateTime<Utc>,
    /// Last heartbeat time.
    pub last_heartbeat: DateTime<Utc>,
    /// Health status.
    pub status: InstanceStatus,
    /// Live sessions owned.
    pub connection_count: usize,
    /// Ownership cap.
    pub max_connections: usize,
    /// Memory pressure in `[0, 1]`.
    pub memory_ratio: f64,
    /// CPU pressure in `[0, 1]`.
    pub cpu_ratio: f64,
}

impl InstanceRecord {
    /// Whether this instance can host more sessions.
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        matches!(self.status, InstanceStatus::Starting | InstanceStatus::Healthy)
            && self.connection_count < self.max_connections
    }

    /// Placement score for the resource-based strategy.
    #[must_use]
    pub fn resource_score(&self) -> f64 {
        (1.0 - self.memory_ratio.clamp(0.0, 1.0)) * (1.0 - self.cpu_ratio.clamp(0.0, 1.0))
    }
}

/// State of a session ownership claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipStatus {
    /// The owner is hosting the session.
    Active,
    /// The owner is handing the session off.
    Transferring,
    /// The claim is released (record about to disappear).
    Released,
}

/// A session's ownership row, globally unique per session key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnershipRecord {
    /// Owning instance.
    pub instance_id: String,
    /// When the claim was acquired.
    pub acquired_at: DateTime<Utc>,
    /// Last time the owner touched the session.
    pub last_activity: DateTime<Utc>,
    /// Claim state.
    pub status: OwnershipStatus,
}

impl OwnershipRecord {
    /// A fresh active claim for the given instance.
    #[must_use]
    pub fn acquire(instance_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.into(),
            acquired_at: now,
            last_activity: now,
            status: OwnershipStatus::Active,
        }
    }
}

/// Advisory placement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlacementStrategy {
    /// Fewest live connections wins.
    #[default]
    LeastConnections,
    /// Highest `(1 - mem) * (1 - cpu)` wins.
    ResourceBased,
    /// Rotate through eligible instances.
    RoundRobin,
}

/// A point-in-time resource reading.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceSnapshot {
    /// Memory pressure in `[0, 1]`.
    pub memory_ratio: f64,
    /// CPU pressure in `[0, 1]`.
    pub cpu_ratio: f64,
}

/// Supplies resource ratios for heartbeats.
///
/// Injected so deployments can wire cgroup or host metrics without this
/// crate growing platform probes.
pub trait LoadSampler: Send + Sync {
    /// Read current ratios.
    fn sample(&self) -> ResourceSnapshot;
}

/// Sampler reporting zero pressure; placement then degrades to
/// least-connections ordering.
#[derive(Debug, Default)]
pub struct NoopSampler;

impl LoadSampler for NoopSampler {
    fn sample(&self) -> ResourceSnapshot {
        ResourceSnapshot::default()
    }
}
