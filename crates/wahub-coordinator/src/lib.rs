//! Wahub Coordinator - at-most-one ownership across a scaled fleet.
//!
//! Every instance registers itself in a shared instance registry and
//! refreshes its record with a heartbeat. Before the pool spawns a
//! protocol session it must acquire the session's ownership record here;
//! acquisition is a compare-and-swap against the shared document store, so
//! two instances racing for the same session resolve to exactly one
//! winner. Owners whose heartbeat goes stale lose their claims to the
//! periodic cleanup sweep, which is how sessions migrate off dead
//! instances.
//!
//! The coordinator also answers advisory placement questions
//! ([`InstanceCoordinator::best_instance_for`]) used by front doors to
//! route attach requests.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod coordinator;
mod error;
mod records;

pub use coordinator::{CoordinatorConfig, InstanceCoordinator};
pub use error::{CoordError, CoordResult};
pub use records::{
    InstanceRecord, InstanceStatus, LoadSampler, NoopSampler, OwnershipRecord, OwnershipStatus,
    PlacementStrategy, ResourceSnapshot,
};
