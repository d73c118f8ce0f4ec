//! Logging configuration and subscriber installation.

use tracing_subscriber::EnvFilter;

use crate::error::{TelemetryError, TelemetryResult};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable multi-line output for development.
    Pretty,
    /// Single-line output.
    #[default]
    Compact,
    /// Structured JSON, one object per line.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base level filter, e.g. `"info"` or `"debug"`.
    level: String,
    /// Output format.
    format: LogFormat,
    /// Extra per-target directives, e.g. `"wahub_pool=trace"`.
    directives: Vec<String>,
}

impl LogConfig {
    /// Create a config with the given base level.
    #[must_use]
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            format: LogFormat::default(),
            directives: Vec::new(),
        }
    }

    /// Set the output format.
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Add a per-target directive.
    #[must_use]
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    fn build_filter(&self) -> TelemetryResult<EnvFilter> {
        let mut spec = self.level.clone();
        for directive in &self.directives {
            spec.push(',');
            spec.push_str(directive);
        }
        spec.parse::<EnvFilter>()
            .map_err(|e| TelemetryError::ConfigError(format!("bad filter `{spec}`: {e}")))
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG`, when set, overrides the configured level and directives.
///
/// # Errors
///
/// Returns [`TelemetryError::ConfigError`] for an unparseable filter and
/// [`TelemetryError::InitError`] if a global subscriber is already set.
pub fn setup_logging(config: &LogConfig) -> TelemetryResult<()> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(spec) => spec
            .parse::<EnvFilter>()
            .map_err(|e| TelemetryError::ConfigError(format!("bad RUST_LOG `{spec}`: {e}")))?,
        Err(_) => config.build_filter()?,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match config.format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| TelemetryError::InitError(e.to_string()))
}

/// Install a default `info`-level compact subscriber.
///
/// # Errors
///
/// See [`setup_logging`].
pub fn setup_default_logging() -> TelemetryResult<()> {
    setup_logging(&LogConfig::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_includes_directives() {
        let config = LogConfig::new("info")
            .with_directive("wahub_pool=debug")
            .with_directive("wahub_proxy=trace");
        assert!(config.build_filter().is_ok());
    }

    #[test]
    fn test_bad_level_is_rejected() {
        let config = LogConfig::new("not-a-level=");
        assert!(config.build_filter().is_err());
    }

    #[test]
    fn test_default_format_is_compact() {
        let config = LogConfig::new("info");
        assert_eq!(config.format, LogFormat::Compact);
    }
}
