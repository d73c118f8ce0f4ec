//! Country fallback oracles.
//!
//! When the vendor has no IPs for a requested country, an oracle picks an
//! adjacent one. Two implementations: a static regional-proximity table,
//! and an LLM call for the long tail the table does not cover.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};
use wahub_core::CountryCode;

use crate::error::{ProxyError, ProxyResult};

/// Picks the next country to try.
#[async_trait]
pub trait CountryOracle: Send + Sync {
    /// Suggest a country adjacent to `original` that is not in
    /// `already_tried` (which always includes `original`).
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::OracleFailed`] when no usable suggestion
    /// exists.
    async fn next_country(
        &self,
        original: &CountryCode,
        already_tried: &[CountryCode],
    ) -> ProxyResult<CountryCode>;
}

/// Regional proximity table.
///
/// Neighbors are ordered by how well their IP ranges substitute for the
/// original in practice (latency and carrier mix, not strict geography).
const REGION_TABLE: &[(&str, &[&str])] = &[
    ("at", &["de", "ch", "it"]),
    ("au", &["nz", "sg"]),
    ("be", &["nl", "de", "fr"]),
    ("br", &["ar", "cl", "us"]),
    ("ca", &["us"]),
    ("ch", &["de", "at", "fr"]),
    ("cz", &["de", "pl", "at"]),
    ("de", &["nl", "at", "fr"]),
    ("dk", &["se", "de", "nl"]),
    ("es", &["pt", "fr"]),
    ("fr", &["be", "es", "de"]),
    ("gb", &["ie", "nl", "de"]),
    ("ie", &["gb", "nl"]),
    ("in", &["sg", "ae"]),
    ("it", &["ch", "at", "fr"]),
    ("jp", &["kr", "sg"]),
    ("kr", &["jp", "sg"]),
    ("mx", &["us"]),
    ("nl", &["be", "de"]),
    ("no", &["se", "dk"]),
    ("nz", &["au"]),
    ("pl", &["de", "cz"]),
    ("pt", &["es", "fr"]),
    ("se", &["no", "dk", "de"]),
    ("sg", &["my", "id", "jp"]),
    ("us", &["ca", "mx"]),
];

/// Countries tried when nothing regional is left.
const GLOBAL_FALLBACKS: &[&str] = &["us", "nl", "de", "sg"];

/// Static regional-proximity oracle.
#[derive(Debug, Default)]
pub struct RegionTableOracle;

impl RegionTableOracle {
    /// Create the oracle.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CountryOracle for RegionTableOracle {
    async fn next_country(
        &self,
        original: &CountryCode,
        already_tried: &[CountryCode],
    ) -> ProxyResult<CountryCode> {
        let neighbors = REGION_TABLE
            .iter()
            .find(|(code, _)| *code == original.as_str())
            .map(|(_, neighbors)| *neighbors)
            .unwrap_or_default();

        for candidate in neighbors.iter().chain(GLOBAL_FALLBACKS) {
            let candidate = CountryCode::parse(candidate)
                .map_err(|e| ProxyError::OracleFailed(e.to_string()))?;
            if candidate != *original && !already_tried.contains(&candidate) {
                return Ok(candidate);
            }
        }
        Err(ProxyError::OracleFailed(format!(
            "no untried neighbor for {original}"
        )))
    }
}

/// Configuration for the LLM oracle.
#[derive(Clone)]
pub struct LlmOracleConfig {
    /// API key for the messages endpoint.
    pub api_key: String,
    /// Model id; a small fast model is plenty for a two-letter answer.
    pub model: String,
    /// API base URL.
    pub base_url: String,
}

impl LlmOracleConfig {
    /// Config with the default model and endpoint.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: "claude-3-5-haiku-latest".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
        }
    }
}

impl std::fmt::Debug for LlmOracleConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmOracleConfig")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// LLM-backed oracle.
///
/// Asks a small model for the nearest substitute country at temperature
/// zero and expects a bare two-letter answer. Retries 3 times with
/// `5 s × 2^n` backoff; every answer is validated against the tried set
/// before being accepted.
pub struct LlmOracle {
    client: reqwest::Client,
    config: LlmOracleConfig,
}

const ANTHROPIC_VERSION: &str = "2023-06-01";
const ORACLE_ATTEMPTS: u32 = 3;
const ORACLE_BACKOFF_BASE: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

impl LlmOracle {
    /// Create an oracle client.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::OracleFailed`] if the HTTP client cannot be
    /// built.
    pub fn new(config: LlmOracleConfig) -> ProxyResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| ProxyError::OracleFailed(e.to_string()))?;
        Ok(Self { client, config })
    }

    async fn ask(
        &self,
        original: &CountryCode,
        already_tried: &[CountryCode],
    ) -> ProxyResult<String> {
        let tried: Vec<&str> = already_tried.iter().map(CountryCode::as_str).collect();
        let prompt = format!(
            "Proxy IPs are unavailable in country `{original}`. Name the closest \
             substitute country for routing WhatsApp traffic (geographic and \
             carrier proximity). Do not suggest any of: {}. Answer with only \
             the ISO 3166-1 alpha-2 code, lowercase, nothing else.",
            tried.join(", ")
        );
        let body = serde_json::json!({
            "model": self.config.model,
            "max_tokens": 8,
            "temperature": 0,
            "messages": [{"role": "user", "content": prompt}],
        });
        let response = self
            .client
            .post(format!(
                "{}/v1/messages",
                self.config.base_url.trim_end_matches('/')
            ))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProxyError::OracleFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ProxyError::OracleFailed(format!(
                "oracle API status {}",
                response.status()
            )));
        }
        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ProxyError::OracleFailed(e.to_string()))?;
        Ok(parsed
            .content
            .first()
            .map(|block| block.text.trim().to_string())
            .unwrap_or_default())
    }
}

#[async_trait]
impl CountryOracle for LlmOracle {
    async fn next_country(
        &self,
        original: &CountryCode,
        already_tried: &[CountryCode],
    ) -> ProxyResult<CountryCode> {
        let mut last_error = String::new();
        for attempt in 0..ORACLE_ATTEMPTS {
            if attempt > 0 {
                let backoff = ORACLE_BACKOFF_BASE.saturating_mul(2_u32.saturating_pow(attempt));
                tokio::time::sleep(backoff).await;
            }
            match self.ask(original, already_tried).await {
                Ok(answer) => match CountryCode::parse(&answer) {
                    Ok(candidate)
                        if candidate != *original && !already_tried.contains(&candidate) =>
                    {
                        debug!(%original, %candidate, "Oracle suggested fallback country");
                        return Ok(candidate);
                    }
                    Ok(candidate) => {
                        warn!(%original, %candidate, "Oracle repeated a tried country");
                        last_error = format!("suggested already-tried {candidate}");
                    }
                    Err(_) => {
                        warn!(%original, answer, "Oracle answer is not a country code");
                        last_error = format!("unparseable answer `{answer}`");
                    }
                },
                Err(e) => {
                    warn!(%original, error = %e, attempt, "Oracle call failed");
                    last_error = e.to_string();
                }
            }
        }
        Err(ProxyError::OracleFailed(last_error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cc(s: &str) -> CountryCode {
        CountryCode::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_region_table_prefers_neighbors() {
        let oracle = RegionTableOracle::new();
        let next = oracle.next_country(&cc("be"), &[cc("be")]).await.unwrap();
        assert_eq!(next, cc("nl"));
    }

    #[tokio::test]
    async fn test_region_table_skips_tried() {
        let oracle = RegionTableOracle::new();
        let next = oracle
            .next_country(&cc("be"), &[cc("be"), cc("nl")])
            .await
            .unwrap();
        assert_eq!(next, cc("de"));
    }

    #[tokio::test]
    async fn test_region_table_falls_back_globally() {
        let oracle = RegionTableOracle::new();
        // Unknown country: no neighbors, global list applies
        let next = oracle.next_country(&cc("zz"), &[cc("zz")]).await.unwrap();
        assert_eq!(next, cc("us"));
    }

    #[tokio::test]
    async fn test_region_table_exhaustion() {
        let oracle = RegionTableOracle::new();
        let tried = [
            cc("zz"), cc("us"), cc("nl"), cc("de"), cc("sg"),
        ];
        assert!(oracle.next_country(&cc("zz"), &tried).await.is_err());
    }
}
