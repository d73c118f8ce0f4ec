//! Wahub Session Store - durable per-session credential blobs.
//!
//! The protocol library hands the service an opaque set of credential
//! files after pairing; losing them means re-pairing with a QR scan. This
//! crate persists those blobs, indexed by session key, in one of three
//! modes:
//!
//! - **local**: process filesystem only
//! - **cloud**: object store only, encrypted
//! - **hybrid** (default): filesystem primary, with a periodic encrypted
//!   object-store backup and restore-on-miss
//!
//! Backups are encrypted per file with AES-256-CBC; a fresh random IV is
//! prepended to each ciphertext. The 32-byte key comes from the secret
//! store. Writes are serialized per session so a backup never observes a
//! torn blob.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod crypto;
mod error;
mod store;

pub use crypto::BlobCipher;
pub use error::{SessionStoreError, SessionStoreResult};
pub use store::{SessionStore, SessionStoreConfig, StoreMode};
