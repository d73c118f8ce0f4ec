//! Scripted vendor for tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use wahub_core::CountryCode;

use crate::error::{ProxyError, ProxyResult};
use crate::vendor::ProxyVendor;

/// In-memory vendor with per-country stock and scripted faults.
pub struct FakeVendor {
    state: Mutex<FakeVendorState>,
    ip_counter: AtomicU64,
    availability_calls: AtomicU64,
}

#[derive(Default)]
struct FakeVendorState {
    /// Remaining stock per country. Countries not present have none.
    stock: HashMap<CountryCode, u32>,
    /// IPs currently purchased and not yet released.
    live: HashSet<String>,
    /// Errors returned by upcoming purchase calls, in order.
    purchase_faults: VecDeque<ProxyError>,
    /// Release calls observed, in order.
    released: Vec<String>,
}

impl FakeVendor {
    /// A vendor with no stock anywhere.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeVendorState::default()),
            ip_counter: AtomicU64::new(0),
            availability_calls: AtomicU64::new(0),
        }
    }

    /// Add stock for a country.
    #[must_use]
    pub fn with_stock(self, country: &str, count: u32) -> Self {
        if let Ok(country) = CountryCode::parse(country) {
            if let Ok(mut state) = self.state.lock() {
                *state.stock.entry(country).or_insert(0) = count;
            }
        }
        self
    }

    /// Queue a transient fault for the next purchase call(s).
    pub fn push_purchase_fault(&self, error: ProxyError) {
        if let Ok(mut state) = self.state.lock() {
            state.purchase_faults.push_back(error);
        }
    }

    /// Replace a country's stock.
    pub fn set_stock(&self, country: &str, count: u32) {
        if let Ok(country) = CountryCode::parse(country)
            && let Ok(mut state) = self.state.lock()
        {
            *state.stock.entry(country).or_insert(0) = count;
        }
    }

    /// Number of `country_available` probes served.
    #[must_use]
    pub fn availability_calls(&self) -> u64 {
        self.availability_calls.load(Ordering::SeqCst)
    }

    /// IPs released so far, in call order.
    #[must_use]
    pub fn released(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|state| state.released.clone())
            .unwrap_or_default()
    }

    /// IPs currently purchased and unreleased.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.state.lock().map(|state| state.live.len()).unwrap_or(0)
    }
}

impl Default for FakeVendor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProxyVendor for FakeVendor {
    async fn purchase_ip(&self, country: &CountryCode) -> ProxyResult<String> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ProxyError::VendorError("fake vendor poisoned".to_string()))?;
        if let Some(fault) = state.purchase_faults.pop_front() {
            return Err(fault);
        }
        let stock = state.stock.get_mut(country).filter(|count| **count > 0);
        let Some(stock) = stock else {
            return Err(ProxyError::Unavailable(country.clone()));
        };
        *stock = stock.saturating_sub(1);
        let n = self.ip_counter.fetch_add(1, Ordering::SeqCst);
        let ip = format!("203.0.113.{}", n.saturating_add(1));
        state.live.insert(ip.clone());
        Ok(ip)
    }

    async fn release_ip(&self, ip: &str) -> ProxyResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ProxyError::VendorError("fake vendor poisoned".to_string()))?;
        state.live.remove(ip);
        state.released.push(ip.to_string());
        Ok(())
    }

    async fn country_available(&self, country: &CountryCode) -> ProxyResult<bool> {
        self.availability_calls.fetch_add(1, Ordering::SeqCst);
        let state = self
            .state
            .lock()
            .map_err(|_| ProxyError::VendorError("fake vendor poisoned".to_string()))?;
        Ok(state.stock.get(country).copied().unwrap_or(0) > 0)
    }
}
