use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Fixed-window token bucket keyed by string identity (`ip:<addr>` or
/// `user:<id>`). A bucket holds `max_requests` tokens and refills
/// *completely* once a full window has elapsed since its last refill; there
/// is no partial refill. Keys can also be administratively blocked for a
/// duration, during which consumption always fails.
///
/// Buckets live in a dashmap, so consumption is linearizable per key
/// without a limiter-wide lock.
pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
    max_requests: u32,
    window: Duration,
}

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    last_refill: Instant,
    blocked_until: Option<Instant>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            max_requests,
            window,
        }
    }

    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    pub fn ip_key(addr: IpAddr) -> String {
        format!("ip:{addr}")
    }

    pub fn user_key(user_id: &str) -> String {
        format!("user:{user_id}")
    }

    /// Try to consume one token for `key`. Returns `true` if allowed.
    pub fn try_consume(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket {
                tokens: self.max_requests,
                last_refill: now,
                blocked_until: None,
            });

        if let Some(until) = bucket.blocked_until {
            if now < until {
                return false;
            }
            bucket.blocked_until = None;
        }

        if now.duration_since(bucket.last_refill) >= self.window {
            bucket.tokens = self.max_requests;
            bucket.last_refill = now;
        }

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Tokens currently available for `key`, never above `max_requests`.
    pub fn available(&self, key: &str) -> u32 {
        match self.buckets.get(key) {
            None => self.max_requests,
            Some(bucket) => {
                if bucket
                    .blocked_until
                    .is_some_and(|until| Instant::now() < until)
                {
                    0
                } else if Instant::now().duration_since(bucket.last_refill) >= self.window {
                    self.max_requests
                } else {
                    bucket.tokens
                }
            }
        }
    }

    /// Administratively block `key` for `duration`.
    pub fn block(&self, key: &str, duration: Duration) {
        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket {
                tokens: self.max_requests,
                last_refill: now,
                blocked_until: None,
            });
        bucket.blocked_until = Some(now + duration);
        tracing::warn!(key = %key, secs = duration.as_secs(), "rate-limit key blocked");
    }

    /// Drop buckets idle for at least two windows. Blocked buckets survive
    /// until their block expires.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.buckets.retain(|_, bucket| {
            if bucket.blocked_until.is_some_and(|until| now < until) {
                return true;
            }
            now.duration_since(bucket.last_refill) < self.window * 2
        });
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn allows_within_capacity() {
        let rl = RateLimiter::new(3, Duration::from_secs(60));
        assert!(rl.try_consume("a"));
        assert!(rl.try_consume("a"));
        assert!(rl.try_consume("a"));
        assert!(!rl.try_consume("a"));
    }

    #[test]
    fn no_partial_refill_within_window() {
        let rl = RateLimiter::new(1, Duration::from_millis(100));
        assert!(rl.try_consume("a"));
        sleep(Duration::from_millis(30));
        // Window has not fully elapsed; the bucket stays empty.
        assert!(!rl.try_consume("a"));
    }

    #[test]
    fn full_window_refills_completely() {
        let rl = RateLimiter::new(2, Duration::from_millis(50));
        assert!(rl.try_consume("a"));
        assert!(rl.try_consume("a"));
        assert!(!rl.try_consume("a"));

        sleep(Duration::from_millis(60));
        assert!(rl.try_consume("a"));
        assert!(rl.try_consume("a"));
    }

    #[test]
    fn independent_per_key() {
        let rl = RateLimiter::new(1, Duration::from_secs(60));
        assert!(rl.try_consume(&RateLimiter::user_key("a")));
        assert!(!rl.try_consume(&RateLimiter::user_key("a")));
        assert!(rl.try_consume(&RateLimiter::user_key("b")));
        assert!(rl.try_consume(&RateLimiter::ip_key("10.0.0.1".parse().unwrap())));
    }

    #[test]
    fn available_never_exceeds_max() {
        let rl = RateLimiter::new(5, Duration::from_millis(20));
        assert_eq!(rl.available("a"), 5);
        rl.try_consume("a");
        assert_eq!(rl.available("a"), 4);
        sleep(Duration::from_millis(30));
        assert_eq!(rl.available("a"), 5);
    }

    #[test]
    fn blocked_key_always_fails() {
        let rl = RateLimiter::new(5, Duration::from_secs(60));
        rl.block("a", Duration::from_millis(50));
        assert!(!rl.try_consume("a"));
        assert_eq!(rl.available("a"), 0);

        sleep(Duration::from_millis(60));
        assert!(rl.try_consume("a"));
    }

    #[test]
    fn sweep_drops_idle_buckets() {
        let rl = RateLimiter::new(5, Duration::from_millis(10));
        rl.try_consume("a");
        assert_eq!(rl.len(), 1);

        sleep(Duration::from_millis(25));
        rl.sweep();
        assert!(rl.is_empty());
    }

    #[test]
    fn sweep_keeps_blocked_buckets() {
        let rl = RateLimiter::new(5, Duration::from_millis(10));
        rl.block("a", Duration::from_secs(60));
        sleep(Duration::from_millis(25));
        rl.sweep();
        assert_eq!(rl.len(), 1);
        assert!(!rl.try_consume("a"));
    }
}
