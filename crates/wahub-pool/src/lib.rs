//! Wahub Pool - the central session runtime.
//!
//! The pool owns one [`ConnectionRecord`] per live session and drives
//! each through its lifecycle:
//!
//! ```text
//! attach → connecting → qr_pending → (pair, restart 515) → restarting
//!        → open → importing_messages → connected
//!        → close → reconnecting / disconnected / failed
//! ```
//!
//! Each session has exactly one owner task consuming its protocol events
//! in order; all record mutation happens there. The pool coordinates every
//! other component: ownership before sockets (coordinator), an egress IP
//! per session (allocator), credential persistence (session store), the
//! external projection (state manager), and domain events (bus).
//!
//! The [`reconcile`] module runs the periodic three-view drift repair
//! sweep over memory, sockets, and projections.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod config;
mod error;
mod pool;
mod rate_limit;
pub mod reconcile;
mod record;
mod session_task;

pub use config::{PoolConfig, PoolTimings};
pub use error::{PoolError, PoolResult};
pub use pool::{AttachOptions, ConnectionPool, DetachOptions, ReconnectOutcome, ShutdownMode};
pub use record::{ConnectionRecord, RecordSnapshot};
