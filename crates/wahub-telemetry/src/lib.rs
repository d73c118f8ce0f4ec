//! Wahub Telemetry - logging and tracing setup for the session hosting service.
//!
//! This crate provides:
//! - Configurable logging setup with multiple formats
//! - Environment-filter directives per component
//!
//! # Example
//!
//! ```rust,no_run
//! use wahub_telemetry::{LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), wahub_telemetry::TelemetryError> {
//! let config = LogConfig::new("info")
//!     .with_format(LogFormat::Json)
//!     .with_directive("wahub_pool=debug");
//!
//! setup_logging(&config)?;
//! tracing::info!("Service starting");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod logging;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{LogConfig, LogFormat, setup_default_logging, setup_logging};
