//! Wahub State - the authoritative external projection of session status.
//!
//! Other services (UIs, routers) never see the pool's memory; they read a
//! per-session row in the external document store. This crate owns that
//! projection: it mirrors in-memory state changes as **dotted-field
//! patches** (whole-object writes would trample fields written by
//! unrelated processes), serializes writes per session key, and enforces
//! the ordering rules that make pairing observable without lying:
//!
//! - no non-QR status escapes while a first-time pairing is at
//!   `qr_pending` (until the post-pairing restart is observed)
//! - `connected` is rewritten to `importing_messages` until the initial
//!   history import completes
//! - a missing document is retried for active statuses (eventual
//!   consistency) but left absent for terminal ones (it was deliberately
//!   deleted; do not resurrect it)
//!
//! A 30-second heartbeat touches `last_heartbeat` while a session is
//! `connected`, and disconnected sessions are evicted from memory after a
//! grace period.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod manager;
mod state;

pub use error::{StateError, StateResult};
pub use manager::{StateManager, StateManagerConfig};
pub use state::{ConnectionState, ProjectionRow, StateDelta};
