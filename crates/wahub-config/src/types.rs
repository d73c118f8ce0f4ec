//! The service configuration and its parsing.

use std::path::PathBuf;
use std::time::Duration;

use tracing::debug;
use wahub_core::CountryCode;

use crate::error::{ConfigError, ConfigResult};

/// Where session credential blobs live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageMode {
    /// Process filesystem only.
    Local,
    /// Object store only.
    Cloud,
    /// Filesystem primary with periodic encrypted object-store backup.
    #[default]
    Hybrid,
}

/// Advisory placement policy for new sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalanceStrategy {
    /// Fewest live connections wins.
    #[default]
    LeastConnections,
    /// Score `(1 - mem) * (1 - cpu)`, highest wins.
    ResourceBased,
    /// Rotate through healthy instances.
    RoundRobin,
}

/// Proxy vendor IP product type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyType {
    /// Static ISP IPs; no implicit country fallback.
    #[default]
    Isp,
    /// Residential pool; country fallback permitted.
    Residential,
}

/// Proxy vendor credentials and endpoints.
#[derive(Debug, Clone)]
pub struct ProxyVendorConfig {
    /// Vendor gateway host sessions dial through.
    pub host: String,
    /// Vendor gateway port.
    pub port: u16,
    /// Vendor account id.
    pub customer: String,
    /// Vendor zone name.
    pub zone: String,
    /// Zone password. Resolved through the secret store at startup; the
    /// environment value is a fallback.
    pub password: String,
    /// IP product type.
    pub proxy_type: ProxyType,
}

/// The full service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Global cap on live sessions in this process (`MAX_CONNECTIONS`).
    pub max_connections: usize,
    /// Reconciliation sweep interval (`HEALTH_CHECK_INTERVAL`).
    pub health_check_interval: Duration,
    /// Stale-instance cleanup interval (`SESSION_CLEANUP_INTERVAL`).
    pub session_cleanup_interval: Duration,
    /// Public URL of this instance (`INSTANCE_URL`).
    pub instance_url: String,
    /// Session blob storage mode (`SESSION_STORAGE_TYPE`).
    pub session_storage_type: StorageMode,
    /// Local blob directory (`SESSION_STORAGE_PATH`).
    pub session_storage_path: PathBuf,
    /// Hybrid backup cadence (`SESSION_BACKUP_INTERVAL`).
    pub session_backup_interval: Duration,
    /// Object store bucket for cloud/hybrid modes (`STORAGE_BUCKET`).
    pub storage_bucket: Option<String>,
    /// Ownership cap for this instance (`MAX_CONNECTIONS_PER_INSTANCE`).
    pub max_connections_per_instance: usize,
    /// Instance registry heartbeat cadence (`INSTANCE_HEARTBEAT_INTERVAL`).
    pub instance_heartbeat_interval: Duration,
    /// Heartbeat age after which an owner is stale (`INSTANCE_TIMEOUT`).
    pub instance_timeout: Duration,
    /// Attach deadline for reaching the open state (`SESSION_TIMEOUT`).
    pub session_timeout: Duration,
    /// Placement policy (`LOAD_BALANCE_STRATEGY`).
    pub load_balance_strategy: LoadBalanceStrategy,
    /// Whether close events schedule reconnects (`AUTO_RECONNECT`).
    pub auto_reconnect: bool,
    /// Reconnect attempt cap (`MAX_RECONNECT_ATTEMPTS`).
    pub max_reconnect_attempts: u32,
    /// Base reconnect delay (`RECONNECT_DELAY`).
    pub reconnect_delay: Duration,
    /// Countries probed first for availability (`PRIORITY_COUNTRIES`).
    pub priority_countries: Vec<CountryCode>,
    /// Whether sessions get a dedicated egress IP (`USE_PROXY`).
    pub use_proxy: bool,
    /// Proxy vendor settings; present when `use_proxy` is set.
    pub proxy: Option<ProxyVendorConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            health_check_interval: Duration::from_secs(120),
            session_cleanup_interval: Duration::from_secs(60),
            instance_url: "http://localhost:8080".to_string(),
            session_storage_type: StorageMode::default(),
            session_storage_path: PathBuf::from("./sessions"),
            session_backup_interval: Duration::from_secs(300),
            storage_bucket: None,
            max_connections_per_instance: 50,
            instance_heartbeat_interval: Duration::from_secs(15),
            instance_timeout: Duration::from_secs(60),
            session_timeout: Duration::from_secs(30),
            load_balance_strategy: LoadBalanceStrategy::default(),
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(5),
            priority_countries: Vec::new(),
            use_proxy: true,
            proxy: None,
        }
    }
}

impl ServiceConfig {
    /// Load from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the first variable that fails to
    /// parse, or describing an inconsistent combination.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load through an arbitrary variable lookup (tests inject maps here).
    ///
    /// # Errors
    ///
    /// See [`Self::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Self> {
        let mut config = Self::default();

        if let Some(v) = lookup("MAX_CONNECTIONS") {
            config.max_connections = parse_number("MAX_CONNECTIONS", &v)?;
        }
        if let Some(v) = lookup("HEALTH_CHECK_INTERVAL") {
            config.health_check_interval = parse_seconds("HEALTH_CHECK_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("SESSION_CLEANUP_INTERVAL") {
            config.session_cleanup_interval = parse_seconds("SESSION_CLEANUP_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("INSTANCE_URL") {
            config.instance_url = v;
        }
        if let Some(v) = lookup("SESSION_STORAGE_TYPE") {
            config.session_storage_type = match v.as_str() {
                "local" => StorageMode::Local,
                "cloud" => StorageMode::Cloud,
                "hybrid" => StorageMode::Hybrid,
                other => {
                    return Err(ConfigError::InvalidValue {
                        variable: "SESSION_STORAGE_TYPE",
                        message: format!("expected local|cloud|hybrid, got `{other}`"),
                    });
                }
            };
        }
        if let Some(v) = lookup("SESSION_STORAGE_PATH") {
            config.session_storage_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("SESSION_BACKUP_INTERVAL") {
            config.session_backup_interval = parse_seconds("SESSION_BACKUP_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("STORAGE_BUCKET") {
            config.storage_bucket = Some(v);
        }
        if let Some(v) = lookup("MAX_CONNECTIONS_PER_INSTANCE") {
            config.max_connections_per_instance =
                parse_number("MAX_CONNECTIONS_PER_INSTANCE", &v)?;
        }
        if let Some(v) = lookup("INSTANCE_HEARTBEAT_INTERVAL") {
            config.instance_heartbeat_interval = parse_seconds("INSTANCE_HEARTBEAT_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("INSTANCE_TIMEOUT") {
            config.instance_timeout = parse_seconds("INSTANCE_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("SESSION_TIMEOUT") {
            config.session_timeout = parse_seconds("SESSION_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("LOAD_BALANCE_STRATEGY") {
            config.load_balance_strategy = match v.as_str() {
                "least_connections" => LoadBalanceStrategy::LeastConnections,
                "resource_based" => LoadBalanceStrategy::ResourceBased,
                "round_robin" => LoadBalanceStrategy::RoundRobin,
                other => {
                    return Err(ConfigError::InvalidValue {
                        variable: "LOAD_BALANCE_STRATEGY",
                        message: format!(
                            "expected round_robin|least_connections|resource_based, got `{other}`"
                        ),
                    });
                }
            };
        }
        if let Some(v) = lookup("AUTO_RECONNECT") {
            config.auto_reconnect = parse_bool("AUTO_RECONNECT", &v)?;
        }
        if let Some(v) = lookup("MAX_RECONNECT_ATTEMPTS") {
            config.max_reconnect_attempts = parse_number("MAX_RECONNECT_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("RECONNECT_DELAY") {
            config.reconnect_delay = parse_seconds("RECONNECT_DELAY", &v)?;
        }
        if let Some(v) = lookup("PRIORITY_COUNTRIES") {
            config.priority_countries = v
                .split(',')
                .filter(|part| !part.trim().is_empty())
                .map(|part| {
                    CountryCode::parse(part).map_err(|e| ConfigError::InvalidValue {
                        variable: "PRIORITY_COUNTRIES",
                        message: e.to_string(),
                    })
                })
                .collect::<ConfigResult<Vec<_>>>()?;
        }
        if let Some(v) = lookup("USE_PROXY") {
            config.use_proxy = parse_bool("USE_PROXY", &v)?;
        }

        config.proxy = Self::proxy_from_lookup(&lookup)?;
        config.validate()?;

        debug!(
            max_connections = config.max_connections,
            storage = ?config.session_storage_type,
            use_proxy = config.use_proxy,
            "Configuration loaded"
        );
        Ok(config)
    }

    fn proxy_from_lookup(
        lookup: &impl Fn(&str) -> Option<String>,
    ) -> ConfigResult<Option<ProxyVendorConfig>> {
        let Some(host) = lookup("PROXY_HOST") else {
            return Ok(None);
        };
        let port = match lookup("PROXY_PORT") {
            Some(v) => parse_number("PROXY_PORT", &v)?,
            None => 22225,
        };
        let customer = lookup("PROXY_CUSTOMER").ok_or(ConfigError::Missing {
            variable: "PROXY_CUSTOMER",
        })?;
        let zone = lookup("PROXY_ZONE").ok_or(ConfigError::Missing {
            variable: "PROXY_ZONE",
        })?;
        let password = lookup("PROXY_PASSWORD").unwrap_or_default();
        let proxy_type = match lookup("PROXY_TYPE").as_deref() {
            None | Some("isp") => ProxyType::Isp,
            Some("residential") => ProxyType::Residential,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    variable: "PROXY_TYPE",
                    message: format!("expected isp|residential, got `{other}`"),
                });
            }
        };
        Ok(Some(ProxyVendorConfig {
            host,
            port,
            customer,
            zone,
            password,
            proxy_type,
        }))
    }

    /// Check cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for inconsistent combinations.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "MAX_CONNECTIONS must be at least 1".to_string(),
            ));
        }
        if self.use_proxy && self.proxy.is_none() {
            return Err(ConfigError::Invalid(
                "USE_PROXY is set but PROXY_HOST/PROXY_CUSTOMER/PROXY_ZONE are not".to_string(),
            ));
        }
        if self.session_storage_type != StorageMode::Local && self.storage_bucket.is_none() {
            return Err(ConfigError::Invalid(
                "SESSION_STORAGE_TYPE cloud/hybrid requires STORAGE_BUCKET".to_string(),
            ));
        }
        if self.instance_timeout < self.instance_heartbeat_interval {
            return Err(ConfigError::Invalid(
                "INSTANCE_TIMEOUT must be at least INSTANCE_HEARTBEAT_INTERVAL".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(variable: &'static str, raw: &str) -> ConfigResult<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue {
            variable,
            message: e.to_string(),
        })
}

fn parse_seconds(variable: &'static str, raw: &str) -> ConfigResult<Duration> {
    let secs: u64 = parse_number(variable, raw)?;
    Ok(Duration::from_secs(secs))
}

fn parse_bool(variable: &'static str, raw: &str) -> ConfigResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            variable,
            message: format!("expected a boolean, got `{other}`"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn minimal() -> Vec<(&'static str, &'static str)> {
        vec![
            ("USE_PROXY", "false"),
            ("SESSION_STORAGE_TYPE", "local"),
        ]
    }

    #[test]
    fn test_defaults_apply() {
        let config = ServiceConfig::from_lookup(lookup_from(&minimal())).unwrap();
        assert_eq!(config.max_connections, 50);
        assert_eq!(config.instance_heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert!(config.auto_reconnect);
    }

    #[test]
    fn test_parses_overrides() {
        let mut pairs = minimal();
        pairs.push(("MAX_CONNECTIONS", "10"));
        pairs.push(("RECONNECT_DELAY", "2"));
        pairs.push(("LOAD_BALANCE_STRATEGY", "resource_based"));
        pairs.push(("PRIORITY_COUNTRIES", "us,nl, de"));
        let config = ServiceConfig::from_lookup(lookup_from(&pairs)).unwrap();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.reconnect_delay, Duration::from_secs(2));
        assert_eq!(
            config.load_balance_strategy,
            LoadBalanceStrategy::ResourceBased
        );
        assert_eq!(config.priority_countries.len(), 3);
    }

    #[test]
    fn test_bad_value_names_variable() {
        let mut pairs = minimal();
        pairs.push(("MAX_CONNECTIONS", "lots"));
        let err = ServiceConfig::from_lookup(lookup_from(&pairs)).unwrap_err();
        assert!(err.to_string().contains("MAX_CONNECTIONS"));
    }

    #[test]
    fn test_proxy_requires_credentials() {
        let pairs = vec![("SESSION_STORAGE_TYPE", "local")];
        let err = ServiceConfig::from_lookup(lookup_from(&pairs)).unwrap_err();
        assert!(err.to_string().contains("USE_PROXY"));
    }

    #[test]
    fn test_proxy_block_parsed() {
        let pairs = vec![
            ("SESSION_STORAGE_TYPE", "local"),
            ("PROXY_HOST", "zproxy.lum-superproxy.io"),
            ("PROXY_PORT", "22225"),
            ("PROXY_CUSTOMER", "c_123"),
            ("PROXY_ZONE", "isp_zone"),
            ("PROXY_PASSWORD", "pw"),
            ("PROXY_TYPE", "isp"),
        ];
        let config = ServiceConfig::from_lookup(lookup_from(&pairs)).unwrap();
        let proxy = config.proxy.unwrap();
        assert_eq!(proxy.customer, "c_123");
        assert_eq!(proxy.proxy_type, ProxyType::Isp);
    }

    #[test]
    fn test_cloud_requires_bucket() {
        let pairs = vec![
            ("USE_PROXY", "false"),
            ("SESSION_STORAGE_TYPE", "cloud"),
        ];
        let err = ServiceConfig::from_lookup(lookup_from(&pairs)).unwrap_err();
        assert!(err.to_string().contains("STORAGE_BUCKET"));
    }

    #[test]
    fn test_heartbeat_vs_timeout_validation() {
        let mut pairs = minimal();
        pairs.push(("INSTANCE_HEARTBEAT_INTERVAL", "120"));
        pairs.push(("INSTANCE_TIMEOUT", "60"));
        assert!(ServiceConfig::from_lookup(lookup_from(&pairs)).is_err());
    }
}
