use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::Quota;

/// Drop idle keys every this many checks
const PRUNE_EVERY: u64 = 1024;

/// HELLO attempts allowed per `ip:user` key
///
/// A full budget of `points` refills evenly over `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub points: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            points: 30,
            window: Duration::from_secs(120),
        }
    }
}

impl RateLimitConfig {
    fn quota(&self) -> Quota {
        let burst = NonZeroU32::new(self.points).unwrap_or(NonZeroU32::MIN);
        Quota::with_period(self.window / burst.get())
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst)
    }
}

type KeyedLimiter = governor::RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Keyed GCRA limiter over connection attempts
pub struct RateLimiter {
    limiter: KeyedLimiter,
    checks: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            limiter: governor::RateLimiter::keyed(config.quota()),
            checks: AtomicU64::new(0),
        }
    }

    /// Consume one point for `key`; false once its budget is exhausted
    pub fn consume(&self, key: &str) -> bool {
        if self.checks.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.limiter.retain_recent();
        }
        self.limiter.check_key(&key.to_string()).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thirty_attempts_per_key() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        for _ in 0..30 {
            assert!(limiter.consume("1.2.3.4:alice"));
        }
        assert!(!limiter.consume("1.2.3.4:alice"));
        assert!(limiter.consume("1.2.3.4:bob"));
        assert!(limiter.consume("5.6.7.8:alice"));
    }

    #[test]
    fn test_budget_refills_over_window() {
        let limiter = RateLimiter::new(RateLimitConfig {
            points: 2,
            window: Duration::from_millis(200),
        });
        assert!(limiter.consume("k"));
        assert!(limiter.consume("k"));
        assert!(!limiter.consume("k"));

        // One point comes back every 100ms
        std::thread::sleep(Duration::from_millis(150));
        assert!(limiter.consume("k"));
        assert!(!limiter.consume("k"));
    }

    #[test]
    fn test_zero_points_still_allows_one() {
        let limiter = RateLimiter::new(RateLimitConfig {
            points: 0,
            window: Duration::from_secs(60),
        });
        assert!(limiter.consume("k"));
        assert!(!limiter.consume("k"));
    }

    #[test]
    fn test_pruning_keeps_limits() {
        let limiter = RateLimiter::new(RateLimitConfig {
            points: 1,
            window: Duration::from_secs(60),
        });
        assert!(limiter.consume("busy"));
        for i in 0..PRUNE_EVERY {
            limiter.consume(&format!("other-{i}"));
        }
        assert!(!limiter.consume("busy"));
    }
}
