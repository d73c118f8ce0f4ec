//! Wahub Protocol - the seam for the external WhatsApp Web library.
//!
//! The wire protocol itself is out of scope for this service; what the
//! runtime needs from it is narrow and captured here:
//!
//! - a [`ProtocolConnector`] that opens a session socket given credentials
//!   and an egress proxy, returning a [`ProtocolSession`] handle and an
//!   ordered stream of [`ProtocolEvent`]s
//! - a send primitive on the handle
//! - credential material surfaced as [`wahub_core::CredentialBlob`]
//!
//! The [`testing`] module provides a scripted in-memory implementation used
//! by the pool's tests and the integration suite.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod event;
mod session;
pub mod testing;

pub use error::{ProtocolError, ProtocolResult};
pub use event::{BatchKind, DisconnectCode, MessageBatch, ProtocolEvent, ProtocolMessage};
pub use session::{
    ConnectOptions, EventStream, NullConnector, ProtocolConnector, ProtocolSession, ProxyEndpoint,
};
