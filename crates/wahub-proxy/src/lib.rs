//! Wahub Proxy - per-session egress IP allocation.
//!
//! Every session carries a dedicated egress IP purchased from an upstream
//! proxy vendor. This crate provides:
//!
//! - [`ProxyVendor`], the vendor API seam, with an HTTP implementation
//! - [`ProxyAllocator`], which owns the per-session assignment map, the
//!   TTL'd per-country availability cache, retry/backoff on vendor faults,
//!   and the country fallback path
//! - [`CountryOracle`], which picks an adjacent country when the requested
//!   one has no IPs: a static regional-proximity table, or an LLM call
//!
//! Allocation is exclusive: a session owns at most one IP, and an IP
//! belongs to at most one session. Release is best-effort and idempotent;
//! the vendor keeps billing until an IP is released, so the pool releases
//! eagerly (QR timeout, disconnect, stable-open confirmation).

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod allocator;
mod error;
mod oracle;
pub mod testing;
mod vendor;

pub use allocator::{AllocatorConfig, ProxyAllocator, ProxyAssignment};
pub use error::{ProxyError, ProxyResult};
pub use oracle::{CountryOracle, LlmOracle, LlmOracleConfig, RegionTableOracle};
pub use vendor::{HttpProxyVendor, ProxyVendor, VendorConfig};
