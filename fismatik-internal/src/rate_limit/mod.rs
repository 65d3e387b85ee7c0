//! Coarse per-caller-address rate limiting for the receipt endpoint.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::CoarseRateLimitConfig;
use crate::error::{Error, ErrorDetails};

pub mod middleware;

pub use middleware::{caller_address, rate_limit_middleware};

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

pub struct CallerRateLimiter {
    limiter: KeyedLimiter,
    trust_forwarded_for: bool,
}

impl CallerRateLimiter {
    /// At most `max_requests` in any `window`. Each admitted request frees its
    /// slot one full `window` later.
    pub fn new(config: &CoarseRateLimitConfig) -> Result<Self, Error> {
        let max_requests = NonZeroU32::new(config.max_requests).ok_or_else(|| {
            Error::new(ErrorDetails::Config {
                message: "`rate_limit.max_requests` must be at least 1".to_string(),
            })
        })?;
        let quota = Quota::with_period(config.window())
            .ok_or_else(|| {
                Error::new(ErrorDetails::Config {
                    message: "`rate_limit.window_ms` must be positive".to_string(),
                })
            })?
            .allow_burst(max_requests);
        Ok(Self {
            limiter: RateLimiter::keyed(quota),
            trust_forwarded_for: config.trust_forwarded_for,
        })
    }

    pub fn trust_forwarded_for(&self) -> bool {
        self.trust_forwarded_for
    }

    /// `Err` carries the time until the caller may retry
    pub fn check(&self, caller: &str) -> Result<(), Duration> {
        self.limiter
            .check_key(&caller.to_string())
            .map_err(|not_until| not_until.wait_time_from(DefaultClock::default().now()))
    }

    pub fn spawn_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        limiter.limiter.retain_recent();
                        limiter.limiter.shrink_to_fit();
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_burst_then_limits_per_caller() {
        let limiter = CallerRateLimiter::new(&CoarseRateLimitConfig {
            enabled: true,
            max_requests: 3,
            window_ms: 120_000,
            trust_forwarded_for: false,
        })
        .unwrap();

        for _ in 0..3 {
            assert!(limiter.check("10.0.0.1").is_ok());
        }
        let retry_after = limiter.check("10.0.0.1").unwrap_err();
        assert!(retry_after > Duration::from_secs(110));
        assert!(retry_after <= Duration::from_secs(120));

        assert!(limiter.check("10.0.0.2").is_ok());
    }

    #[test]
    fn test_at_most_max_requests_within_one_window() {
        let limiter = CallerRateLimiter::new(&CoarseRateLimitConfig {
            enabled: true,
            max_requests: 3,
            window_ms: 600,
            trust_forwarded_for: false,
        })
        .unwrap();

        // Keep knocking for most of one window; a refill must not sneak extra requests in
        let start = std::time::Instant::now();
        let mut admitted = 0;
        while start.elapsed() < Duration::from_millis(500) {
            if limiter.check("10.0.0.1").is_ok() {
                admitted += 1;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(admitted, 3);
    }

    #[test]
    fn test_zero_requests_is_a_config_error() {
        let err = CallerRateLimiter::new(&CoarseRateLimitConfig {
            enabled: true,
            max_requests: 0,
            window_ms: 1000,
            trust_forwarded_for: false,
        })
        .err()
        .unwrap();
        assert_eq!(err.code(), "INTERNAL_ERROR");
    }
}
