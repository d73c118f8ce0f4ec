//! Rolling-window reconnect rate limiting.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use wahub_core::SessionKey;

const WINDOW: Duration = Duration::from_secs(3600);

/// Per-key rolling-hour attempt counter.
#[derive(Debug)]
pub(crate) struct ReconnectRateLimiter {
    limit: u32,
    attempts: DashMap<SessionKey, VecDeque<Instant>>,
}

impl ReconnectRateLimiter {
    pub(crate) fn new(limit: u32) -> Self {
        Self {
            limit,
            attempts: DashMap::new(),
        }
    }

    /// Record an attempt; returns `false` when the key is over budget.
    pub(crate) fn try_acquire(&self, key: &SessionKey) -> bool {
        let mut entry = self.attempts.entry(key.clone()).or_default();
        let now = Instant::now();
        while let Some(front) = entry.front() {
            if now.duration_since(*front) > WINDOW {
                entry.pop_front();
            } else {
                break;
            }
        }
        if entry.len() >= self.limit as usize {
            return false;
        }
        entry.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_enforced_per_key() {
        let limiter = ReconnectRateLimiter::new(3);
        let a = SessionKey::parse("U1", "+12025550101").unwrap();
        let b = SessionKey::parse("U2", "+12025550102").unwrap();

        assert!(limiter.try_acquire(&a));
        assert!(limiter.try_acquire(&a));
        assert!(limiter.try_acquire(&a));
        assert!(!limiter.try_acquire(&a));
        // Other keys have their own budget
        assert!(limiter.try_acquire(&b));
    }
}
