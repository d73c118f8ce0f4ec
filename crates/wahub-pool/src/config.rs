//! Pool configuration.

use std::time::Duration;

use wahub_core::CountryCode;

/// Every deadline and grace period the lifecycle uses.
///
/// Production uses the defaults; tests shrink them to milliseconds.
#[derive(Debug, Clone)]
pub struct PoolTimings {
    /// Deadline for a fresh attach to produce a QR or reach open.
    pub attach_deadline: Duration,
    /// How long an emitted QR may wait for pairing.
    pub qr_timeout: Duration,
    /// How long a session must stay open before its proxy is released.
    pub stable_open: Duration,
    /// Grace between the final history batch and `connected`.
    pub sync_grace: Duration,
    /// How long a first-time session may sit in import with no data
    /// before the stall is logged (status stays `importing_messages`).
    pub sync_timeout: Duration,
    /// Wait before deciding what a pre-open `connectionReplaced` means.
    pub replaced_wait: Duration,
    /// TTL of the sent-by-API message id set.
    pub sent_ttl: Duration,
}

impl Default for PoolTimings {
    fn default() -> Self {
        Self {
            attach_deadline: Duration::from_secs(30),
            qr_timeout: Duration::from_secs(90),
            stable_open: Duration::from_secs(30),
            sync_grace: Duration::from_secs(3),
            sync_timeout: Duration::from_secs(90),
            replaced_wait: Duration::from_secs(10),
            sent_ttl: Duration::from_secs(300),
        }
    }
}

/// Pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Cap on live sessions in this process.
    pub max_connections: usize,
    /// Browser name shown on paired phones.
    pub browser_name: String,
    /// Whether unexpected closes schedule reconnects.
    pub auto_reconnect: bool,
    /// Reconnect attempt cap per disconnect cause.
    pub max_reconnect_attempts: u32,
    /// Base reconnect delay (doubled per attempt).
    pub reconnect_delay: Duration,
    /// Country used when an attach does not name one.
    pub default_country: CountryCode,
    /// Whether sessions get a dedicated egress IP.
    pub use_proxy: bool,
    /// Reconnect attempts allowed per key per rolling hour.
    pub reconnect_rate_limit: u32,
    /// Lifecycle deadlines.
    pub timings: PoolTimings,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            browser_name: "wahub".to_string(),
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(5),
            default_country: CountryCode::parse("us").unwrap_or_else(|_| unreachable!()),
            use_proxy: true,
            reconnect_rate_limit: 50,
            timings: PoolTimings::default(),
        }
    }
}
