//! Wahub Secrets - lazily resolved credentials with TTL caching.
//!
//! Signed credentials (proxy API passwords, the session encryption key, the
//! oracle API key) live in a secret backend. This crate resolves them on
//! first use, caches them with a TTL, and falls back to the process
//! environment when the backend has no value.
//!
//! There is no global singleton: the store is constructed once at startup
//! and injected into the components that need it. Tests substitute a
//! [`StaticSecretProvider`].
//!
//! Placeholder values (`changeme`, `your-key-here`, empty strings) are
//! rejected; [`SecretStore::require_valid`] blocks startup until the
//! critical secrets resolve to real values.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod provider;
mod store;

pub use error::{SecretsError, SecretsResult};
pub use provider::{EnvSecretProvider, SecretProvider, StaticSecretProvider};
pub use store::{SecretStore, names};
