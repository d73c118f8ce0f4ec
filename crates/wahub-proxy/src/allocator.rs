//! The per-session proxy allocator.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use tracing::{debug, info, warn};
use wahub_core::{CountryCode, SessionKey};

use crate::error::{ProxyError, ProxyResult};
use crate::oracle::CountryOracle;
use crate::vendor::ProxyVendor;

/// One session's egress IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAssignment {
    /// The purchased IP.
    pub ip: String,
    /// Vendor gateway port sessions dial through.
    pub port: u16,
    /// Country the IP is in.
    pub country: CountryCode,
    /// Country originally requested (differs when fallback was used).
    pub original_country: CountryCode,
    /// Whether the fallback oracle picked the country.
    pub fallback_used: bool,
    /// When the assignment was made.
    pub assigned_at: DateTime<Utc>,
}

/// Allocator tuning.
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Vendor gateway port handed to sessions.
    pub gateway_port: u16,
    /// Fail closed instead of falling back to another country.
    ///
    /// Set for ISP zones without an explicit fallback policy; an
    /// unproxied connection is never an acceptable substitute.
    pub strict: bool,
    /// Purchase attempts per country before giving up on transient faults.
    pub purchase_attempts: u32,
    /// Base delay between purchase retries.
    pub backoff_base: Duration,
    /// How long an availability probe result stays cached.
    pub availability_ttl: Duration,
    /// How many fallback countries to try before failing.
    pub max_fallback_countries: u32,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            gateway_port: 22225,
            strict: false,
            purchase_attempts: 3,
            backoff_base: Duration::from_millis(500),
            availability_ttl: Duration::from_secs(3600),
            max_fallback_countries: 3,
        }
    }
}

struct AvailabilityEntry {
    available: bool,
    checked_at: Instant,
}

/// Allocates one egress IP per session, with geographic fallback.
pub struct ProxyAllocator {
    vendor: Arc<dyn ProxyVendor>,
    oracle: Arc<dyn CountryOracle>,
    config: AllocatorConfig,
    assignments: DashMap<SessionKey, ProxyAssignment>,
    availability: DashMap<CountryCode, AvailabilityEntry>,
}

impl ProxyAllocator {
    /// Create an allocator.
    #[must_use]
    pub fn new(
        vendor: Arc<dyn ProxyVendor>,
        oracle: Arc<dyn CountryOracle>,
        config: AllocatorConfig,
    ) -> Self {
        Self {
            vendor,
            oracle,
            config,
            assignments: DashMap::new(),
            availability: DashMap::new(),
        }
    }

    /// Assign an egress IP in `country` to the session.
    ///
    /// Any previous assignment for the key is released first, preserving
    /// at-most-one-IP-per-session. On "no stock" the fallback oracle picks
    /// adjacent countries unless the allocator is strict.
    ///
    /// # Errors
    ///
    /// [`ProxyError::Unavailable`] when no country yields an IP (strict
    /// mode fails on the first), [`ProxyError::VendorError`] after retry
    /// exhaustion on transient faults.
    pub async fn assign(
        &self,
        key: &SessionKey,
        country: &CountryCode,
    ) -> ProxyResult<ProxyAssignment> {
        self.release_for(key).await;

        let assignment = match self.purchase_with_retry(country).await {
            Ok(ip) => self.build_assignment(ip, country.clone(), country.clone(), false),
            Err(ProxyError::Unavailable(_)) if !self.config.strict => {
                self.assign_with_fallback(country).await?
            }
            Err(e) => return Err(e),
        };

        if assignment.fallback_used {
            info!(
                session = %key,
                original = %assignment.original_country,
                used = %assignment.country,
                ip = %assignment.ip,
                "Assigned egress IP via country fallback"
            );
        } else {
            debug!(session = %key, country = %assignment.country, ip = %assignment.ip,
                "Assigned egress IP");
        }
        self.assignments.insert(key.clone(), assignment.clone());
        Ok(assignment)
    }

    async fn assign_with_fallback(
        &self,
        original: &CountryCode,
    ) -> ProxyResult<ProxyAssignment> {
        let mut tried = vec![original.clone()];
        for _ in 0..self.config.max_fallback_countries {
            let candidate = self.oracle.next_country(original, &tried).await?;
            match self.purchase_with_retry(&candidate).await {
                Ok(ip) => {
                    return Ok(self.build_assignment(ip, candidate, original.clone(), true));
                }
                Err(ProxyError::Unavailable(_)) => {
                    warn!(%original, %candidate, "Fallback country also has no IPs");
                    tried.push(candidate);
                }
                Err(e) => return Err(e),
            }
        }
        Err(ProxyError::Unavailable(original.clone()))
    }

    fn build_assignment(
        &self,
        ip: String,
        country: CountryCode,
        original_country: CountryCode,
        fallback_used: bool,
    ) -> ProxyAssignment {
        ProxyAssignment {
            ip,
            port: self.config.gateway_port,
            country,
            original_country,
            fallback_used,
            assigned_at: Utc::now(),
        }
    }

    async fn purchase_with_retry(&self, country: &CountryCode) -> ProxyResult<String> {
        let mut last = ProxyError::VendorError("no attempts made".to_string());
        for attempt in 0..self.config.purchase_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay(attempt)).await;
            }
            match self.vendor.purchase_ip(country).await {
                Ok(ip) => return Ok(ip),
                Err(e @ ProxyError::VendorError(_)) => {
                    warn!(%country, attempt, error = %e, "Vendor purchase failed, retrying");
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// Exponential backoff with jitter so a fleet of instances retrying a
    /// vendor outage does not stampede.
    fn retry_delay(&self, attempt: u32) -> Duration {
        let exp = 2_u32.saturating_pow(attempt.saturating_sub(1));
        let base = self.config.backoff_base.saturating_mul(exp);
        let jitter_ms = rand::thread_rng().gen_range(0..=250);
        base.saturating_add(Duration::from_millis(jitter_ms))
    }

    /// Release the session's assignment, if any. Best-effort: vendor
    /// failures are logged, never surfaced, and a repeat call is a no-op.
    pub async fn release_for(&self, key: &SessionKey) {
        if let Some((_, assignment)) = self.assignments.remove(key) {
            self.vendor_release(&assignment.ip).await;
        }
    }

    /// Release by IP. A no-op when the IP is not held by any session.
    pub async fn release(&self, ip: &str) {
        let key = self
            .assignments
            .iter()
            .find(|entry| entry.value().ip == ip)
            .map(|entry| entry.key().clone());
        if let Some(key) = key {
            self.assignments.remove(&key);
            self.vendor_release(ip).await;
        }
    }

    async fn vendor_release(&self, ip: &str) {
        if let Err(e) = self.vendor.release_ip(ip).await {
            warn!(ip, error = %e, "Vendor release failed; IP keeps billing until reaped");
        } else {
            debug!(ip, "Released egress IP");
        }
    }

    /// Release and reassign in the same country (egress path fault, same
    /// placement requirements).
    ///
    /// # Errors
    ///
    /// See [`Self::assign`]; [`ProxyError::NotAssigned`] when the session
    /// holds no assignment.
    pub async fn rotate(&self, key: &SessionKey) -> ProxyResult<ProxyAssignment> {
        let country = self
            .assignments
            .get(key)
            .map(|entry| entry.country.clone())
            .ok_or_else(|| ProxyError::NotAssigned(key.to_string()))?;
        self.release_for(key).await;
        self.assign(key, &country).await
    }

    /// TTL-cached availability probe.
    ///
    /// # Errors
    ///
    /// Propagates vendor faults on cache miss; errors are not cached.
    pub async fn check_availability(&self, country: &CountryCode) -> ProxyResult<bool> {
        if let Some(entry) = self.availability.get(country)
            && entry.checked_at.elapsed() < self.config.availability_ttl
        {
            return Ok(entry.available);
        }
        let available = self.vendor.country_available(country).await?;
        self.availability.insert(
            country.clone(),
            AvailabilityEntry {
                available,
                checked_at: Instant::now(),
            },
        );
        Ok(available)
    }

    /// The session's current assignment.
    #[must_use]
    pub fn assignment_of(&self, key: &SessionKey) -> Option<ProxyAssignment> {
        self.assignments.get(key).map(|entry| entry.value().clone())
    }

    /// Number of live assignments.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.assignments.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::RegionTableOracle;
    use crate::testing::FakeVendor;

    fn key(user: &str) -> SessionKey {
        SessionKey::parse(user, "+12025550101").unwrap()
    }

    fn cc(s: &str) -> CountryCode {
        CountryCode::parse(s).unwrap()
    }

    fn allocator(vendor: FakeVendor, config: AllocatorConfig) -> (ProxyAllocator, Arc<FakeVendor>) {
        let vendor = Arc::new(vendor);
        let allocator = ProxyAllocator::new(
            Arc::clone(&vendor) as Arc<dyn ProxyVendor>,
            Arc::new(RegionTableOracle::new()),
            config,
        );
        (allocator, vendor)
    }

    fn fast_config() -> AllocatorConfig {
        AllocatorConfig {
            backoff_base: Duration::from_millis(1),
            ..AllocatorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_assign_direct() {
        let (allocator, vendor) = allocator(FakeVendor::new().with_stock("us", 5), fast_config());
        let assignment = allocator.assign(&key("U1"), &cc("us")).await.unwrap();
        assert_eq!(assignment.country, cc("us"));
        assert!(!assignment.fallback_used);
        assert_eq!(allocator.active_count(), 1);
        assert_eq!(vendor.live_count(), 1);
    }

    #[tokio::test]
    async fn test_fallback_to_neighbor() {
        // No stock in be, stock in nl: oracle suggests nl
        let (allocator, _vendor) = allocator(FakeVendor::new().with_stock("nl", 1), fast_config());
        let session = SessionKey::parse("U2", "+3212345678").unwrap();
        let assignment = allocator.assign(&session, &cc("be")).await.unwrap();
        assert_eq!(assignment.country, cc("nl"));
        assert_eq!(assignment.original_country, cc("be"));
        assert!(assignment.fallback_used);
    }

    #[tokio::test]
    async fn test_strict_mode_fails_closed() {
        let config = AllocatorConfig {
            strict: true,
            ..fast_config()
        };
        let (allocator, _vendor) = allocator(FakeVendor::new().with_stock("nl", 1), config);
        let err = allocator.assign(&key("U1"), &cc("be")).await.unwrap_err();
        assert!(matches!(err, ProxyError::Unavailable(country) if country == cc("be")));
        assert_eq!(allocator.active_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_fault_retried() {
        let (allocator, vendor) = allocator(FakeVendor::new().with_stock("us", 1), fast_config());
        vendor.push_purchase_fault(ProxyError::VendorError("503".to_string()));
        let assignment = allocator.assign(&key("U1"), &cc("us")).await.unwrap();
        assert!(!assignment.fallback_used);
    }

    #[tokio::test]
    async fn test_vendor_error_after_retry_cap() {
        let (allocator, vendor) = allocator(FakeVendor::new().with_stock("us", 1), fast_config());
        for _ in 0..3 {
            vendor.push_purchase_fault(ProxyError::VendorError("503".to_string()));
        }
        let err = allocator.assign(&key("U1"), &cc("us")).await.unwrap_err();
        assert!(matches!(err, ProxyError::VendorError(_)));
    }

    #[tokio::test]
    async fn test_reassign_releases_previous() {
        let (allocator, vendor) = allocator(FakeVendor::new().with_stock("us", 5), fast_config());
        let first = allocator.assign(&key("U1"), &cc("us")).await.unwrap();
        let second = allocator.assign(&key("U1"), &cc("us")).await.unwrap();
        assert_ne!(first.ip, second.ip);
        assert_eq!(vendor.live_count(), 1);
        assert_eq!(vendor.released(), vec![first.ip]);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (allocator, vendor) = allocator(FakeVendor::new().with_stock("us", 5), fast_config());
        let assignment = allocator.assign(&key("U1"), &cc("us")).await.unwrap();
        allocator.release(&assignment.ip).await;
        allocator.release(&assignment.ip).await;
        assert_eq!(vendor.released().len(), 1);
        assert_eq!(allocator.active_count(), 0);
    }

    #[tokio::test]
    async fn test_rotate_stays_in_country() {
        let (allocator, vendor) = allocator(FakeVendor::new().with_stock("us", 5), fast_config());
        let first = allocator.assign(&key("U1"), &cc("us")).await.unwrap();
        let second = allocator.rotate(&key("U1")).await.unwrap();
        assert_eq!(second.country, cc("us"));
        assert_ne!(first.ip, second.ip);
        assert_eq!(vendor.live_count(), 1);
    }

    #[tokio::test]
    async fn test_rotate_without_assignment() {
        let (allocator, _vendor) = allocator(FakeVendor::new(), fast_config());
        assert!(matches!(
            allocator.rotate(&key("U1")).await,
            Err(ProxyError::NotAssigned(_))
        ));
    }

    #[tokio::test]
    async fn test_availability_cached() {
        let (allocator, vendor) = allocator(FakeVendor::new().with_stock("us", 1), fast_config());
        assert!(allocator.check_availability(&cc("us")).await.unwrap());
        vendor.set_stock("us", 0);
        // Cache still answers true within the TTL
        assert!(allocator.check_availability(&cc("us")).await.unwrap());
        assert_eq!(vendor.availability_calls(), 1);
    }
}
