//! Wahub Config - environment-driven configuration.
//!
//! The service is configured entirely through environment variables (the
//! deployment substrate injects them). [`ServiceConfig::from_env`] reads
//! every recognized variable, applies defaults, and validates the result;
//! an invalid value fails startup with a [`ConfigError`] naming the
//! variable.
//!
//! Component crates define their own narrow config structs; the binary maps
//! a validated [`ServiceConfig`] onto those.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod types;

pub use error::{ConfigError, ConfigResult};
pub use types::{
    LoadBalanceStrategy, ProxyType, ProxyVendorConfig, ServiceConfig, StorageMode,
};
