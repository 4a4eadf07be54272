//! Per-connection append quotas for the relay
//!
//! Records over the quota are delayed, never dropped.

use std::num::NonZeroU32;

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};

/// Records one relay connection may append per second
pub const RECORD_RATE_LIMIT: u32 = 30;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Quota guard owned by a single relay connection
pub struct ConnectionRateLimiter {
    records: DirectLimiter,
}

impl ConnectionRateLimiter {
    pub fn new() -> Self {
        Self::with_rate(RECORD_RATE_LIMIT)
    }

    /// A zero rate is clamped to one record per second
    pub fn with_rate(records_per_second: u32) -> Self {
        let rate = NonZeroU32::new(records_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            records: RateLimiter::direct(Quota::per_second(rate)),
        }
    }

    /// Whether the next record fits in the quota
    pub fn check_record(&self) -> bool {
        self.records.check().is_ok()
    }

    /// Wait until the next record fits in the quota
    pub async fn until_record_allowed(&self) {
        self.records.until_ready().await;
    }
}

impl Default for ConnectionRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_above_quota_is_refused() {
        let limiter = ConnectionRateLimiter::with_rate(3);
        let allowed = (0..10).filter(|_| limiter.check_record()).count();
        assert_eq!(allowed, 3);
    }

    #[tokio::test]
    async fn throttled_records_all_get_through() {
        let limiter = ConnectionRateLimiter::with_rate(50);
        let started = std::time::Instant::now();
        for _ in 0..60 {
            if !limiter.check_record() {
                limiter.until_record_allowed().await;
            }
        }
        // ten records beyond the burst wait for the quota to refill
        assert!(started.elapsed() >= std::time::Duration::from_millis(150));
    }

    #[test]
    fn zero_rate_still_admits_one() {
        let limiter = ConnectionRateLimiter::with_rate(0);
        assert!(limiter.check_record());
        assert!(!limiter.check_record());
    }
}
