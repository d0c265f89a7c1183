//! Sign-in throttling.
//!
//! A token bucket per normalized user name. Known and unknown names are
//! throttled identically so the limiter cannot be used to probe accounts.

use dashmap::DashMap;
use tokio::time::Instant;

use crate::config::ThrottleConfig;

/// A simple token bucket rate limiter.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_update: Instant::now(),
        }
    }

    fn try_acquire(&mut self, capacity: f64, refill_rate: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();

        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn is_full(&self, capacity: f64, refill_rate: f64) -> bool {
        let elapsed = Instant::now().duration_since(self.last_update).as_secs_f64();
        self.tokens + elapsed * refill_rate >= capacity
    }
}

/// Per-user-name sign-in limiter.
#[derive(Debug)]
pub struct SignInThrottle {
    buckets: DashMap<String, TokenBucket>,
    capacity: f64,
    /// Tokens per second.
    refill_rate: f64,
}

impl SignInThrottle {
    pub fn new(attempts_per_minute: u32, burst: u32) -> Self {
        Self {
            buckets: DashMap::new(),
            capacity: f64::from(burst.max(1)),
            refill_rate: f64::from(attempts_per_minute) / 60.0,
        }
    }

    /// `None` when throttling is disabled.
    pub fn from_config(config: &ThrottleConfig) -> Option<Self> {
        config
            .enabled
            .then(|| Self::new(config.attempts_per_minute, config.burst))
    }

    /// Consume one attempt for `key`. Returns `false` when throttled.
    pub fn check(&self, key: &str) -> bool {
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(self.capacity));
        let allowed = bucket.try_acquire(self.capacity, self.refill_rate);
        if !allowed {
            tracing::warn!(component = "throttle", user_name = %key, "Sign-in throttled");
        }
        allowed
    }

    /// Drop buckets that have refilled completely.
    pub fn prune(&self) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| !bucket.is_full(self.capacity, self.refill_rate));
        before.saturating_sub(self.buckets.len())
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn burst_then_throttled_then_refilled() {
        let throttle = SignInThrottle::new(60, 3);

        assert!(throttle.check("alice@default"));
        assert!(throttle.check("alice@default"));
        assert!(throttle.check("alice@default"));
        assert!(!throttle.check("alice@default"));

        // Other names have their own bucket.
        assert!(throttle.check("bob@default"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(throttle.check("alice@default"));
        assert!(!throttle.check("alice@default"));
    }

    #[tokio::test(start_paused = true)]
    async fn prune_drops_idle_buckets() {
        let throttle = SignInThrottle::new(60, 2);
        throttle.check("alice@default");
        throttle.check("bob@default");
        assert_eq!(throttle.tracked_keys(), 2);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(throttle.prune(), 2);
        assert_eq!(throttle.tracked_keys(), 0);
    }

    #[test]
    fn disabled_config_yields_no_throttle() {
        assert!(SignInThrottle::from_config(&ThrottleConfig::default()).is_none());
        let enabled = ThrottleConfig {
            enabled: true,
            ..ThrottleConfig::default()
        };
        assert!(SignInThrottle::from_config(&enabled).is_some());
    }
}
