//! The proxy vendor API seam and its HTTP implementation.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};
use wahub_core::CountryCode;

use crate::error::{ProxyError, ProxyResult};

/// Timeout for any single vendor API call.
const VENDOR_TIMEOUT: Duration = Duration::from_secs(30);

/// The upstream proxy vendor.
///
/// `purchase_ip` buys exactly one IP; billing runs until `release_ip`.
#[async_trait]
pub trait ProxyVendor: Send + Sync {
    /// Purchase one IP in the given country.
    ///
    /// Returns [`ProxyError::Unavailable`] when the vendor has no stock for
    /// the country and [`ProxyError::VendorError`] for transient faults.
    async fn purchase_ip(&self, country: &CountryCode) -> ProxyResult<String>;

    /// Release a previously purchased IP.
    async fn release_ip(&self, ip: &str) -> ProxyResult<()>;

    /// Whether the vendor currently has stock for the country.
    async fn country_available(&self, country: &CountryCode) -> ProxyResult<bool>;
}

/// Configuration for the HTTP vendor client.
#[derive(Debug, Clone)]
pub struct VendorConfig {
    /// API base, e.g. `https://api.brightdata.com`.
    pub api_base: String,
    /// Account id sent as `customer`.
    pub customer: String,
    /// Zone name sent as `zone`.
    pub zone: String,
    /// Zone API token, sent as a bearer token.
    pub token: String,
}

/// HTTP client for the vendor's zone-IP API.
///
/// Wire shape:
/// - `POST /zone/ips {customer, zone, count, country}` → `{new_ips: [ip]}`
/// - `DELETE /zone/ips {customer, zone, ips: [ip]}`
/// - `GET /zone/ips/availability?customer&zone&country` → `{available}`
pub struct HttpProxyVendor {
    client: reqwest::Client,
    config: VendorConfig,
}

#[derive(Deserialize)]
struct PurchaseResponse {
    new_ips: Vec<String>,
}

#[derive(Deserialize)]
struct AvailabilityResponse {
    available: bool,
}

impl HttpProxyVendor {
    /// Create a vendor client.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::InvalidCredentials`] if any credential field
    /// is empty and [`ProxyError::VendorError`] if the HTTP client cannot
    /// be built.
    pub fn new(config: VendorConfig) -> ProxyResult<Self> {
        if config.customer.is_empty() || config.zone.is_empty() || config.token.is_empty() {
            return Err(ProxyError::InvalidCredentials(
                "customer, zone, and token are required".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(VENDOR_TIMEOUT)
            .build()
            .map_err(|e| ProxyError::VendorError(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.api_base.trim_end_matches('/'))
    }

    /// Map a vendor response status to the error taxonomy. 4xx means the
    /// request itself was refused (no stock for the country); anything else
    /// non-success is a transient vendor fault the caller may retry.
    async fn check_status(
        response: reqwest::Response,
        country: Option<&CountryCode>,
    ) -> ProxyResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_client_error()
            && let Some(country) = country
        {
            warn!(%country, %status, body = %body, "Vendor has no IPs for country");
            return Err(ProxyError::Unavailable(country.clone()));
        }
        Err(ProxyError::VendorError(format!("{status}: {body}")))
    }
}

#[async_trait]
impl ProxyVendor for HttpProxyVendor {
    async fn purchase_ip(&self, country: &CountryCode) -> ProxyResult<String> {
        let body = serde_json::json!({
            "customer": self.config.customer,
            "zone": self.config.zone,
            "count": 1,
            "country": country.as_str(),
        });
        let response = self
            .client
            .post(self.url("/zone/ips"))
            .bearer_auth(&self.config.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProxyError::VendorError(e.to_string()))?;
        let response = Self::check_status(response, Some(country)).await?;
        let purchase: PurchaseResponse = response
            .json()
            .await
            .map_err(|e| ProxyError::VendorError(e.to_string()))?;
        let ip = purchase
            .new_ips
            .into_iter()
            .next()
            .ok_or_else(|| ProxyError::Unavailable(country.clone()))?;
        debug!(%country, ip = %ip, "Purchased egress IP");
        Ok(ip)
    }

    async fn release_ip(&self, ip: &str) -> ProxyResult<()> {
        let body = serde_json::json!({
            "customer": self.config.customer,
            "zone": self.config.zone,
            "ips": [ip],
        });
        let response = self
            .client
            .delete(self.url("/zone/ips"))
            .bearer_auth(&self.config.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProxyError::VendorError(e.to_string()))?;
        Self::check_status(response, None).await?;
        debug!(ip, "Released egress IP");
        Ok(())
    }

    async fn country_available(&self, country: &CountryCode) -> ProxyResult<bool> {
        let response = self
            .client
            .get(self.url("/zone/ips/availability"))
            .bearer_auth(&self.config.token)
            .query(&[
                ("customer", self.config.customer.as_str()),
                ("zone", self.config.zone.as_str()),
                ("country", country.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ProxyError::VendorError(e.to_string()))?;
        let response = Self::check_status(response, None).await?;
        let availability: AvailabilityResponse = response
            .json()
            .await
            .map_err(|e| ProxyError::VendorError(e.to_string()))?;
        Ok(availability.available)
    }
}
