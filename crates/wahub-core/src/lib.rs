//! Wahub Core - shared identity and status types for the session hosting service.
//!
//! This crate provides:
//! - Session identity (`UserId`, `PhoneNumber`, `SessionKey`)
//! - The connection status vocabulary shared between the in-memory pool
//!   and the external projection
//! - ISO 3166 country codes used for proxy placement
//!
//! Every other crate in the workspace depends on these types; nothing here
//! performs I/O.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod blob;
mod country;
mod error;
mod identity;
mod status;

pub use blob::CredentialBlob;
pub use country::CountryCode;
pub use error::{CoreError, CoreResult};
pub use identity::{PhoneNumber, SessionKey, UserId};
pub use status::{ConnectionPhase, ConnectionStatus, SyncStatus};
