//! Token-bucket rate limiting, per client IP and per account.
//!
//! Buckets refill continuously; a request spends one token. Peers on the
//! authenticated bus are exempt (the handler never consults the limiter
//! for them). Stale buckets are pruned on the cleanup tick.

use std::collections::HashMap;
use std::hash::Hash;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Instant;

/// Tokens added per second.
pub const REFILL_RATE: f64 = 4.0;

/// Bucket capacity (burst size).
pub const BURST: f64 = 20.0;

/// Buckets idle longer than this are dropped by [`RateLimiter::prune`].
const IDLE_SECS: f64 = 120.0;

struct Bucket {
    tokens: f64,
    last: Instant,
}

impl Bucket {
    fn take(&mut self, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * REFILL_RATE).min(BURST);
        self.last = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct BucketMap<K>(Mutex<HashMap<K, Bucket>>);

impl<K: Eq + Hash> BucketMap<K> {
    fn new() -> Self {
        Self(Mutex::new(HashMap::new()))
    }

    fn allow(&self, key: K, now: Instant) -> bool {
        let mut map = self.0.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(key)
            .or_insert(Bucket {
                tokens: BURST,
                last: now,
            })
            .take(now)
    }

    fn prune(&self, now: Instant) {
        let mut map = self.0.lock().unwrap_or_else(|e| e.into_inner());
        map.retain(|_, b| now.duration_since(b.last).as_secs_f64() < IDLE_SECS);
    }
}

/// The node-wide rate limiter.
pub struct RateLimiter {
    by_ip: BucketMap<IpAddr>,
    by_account: BucketMap<Vec<u8>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            by_ip: BucketMap::new(),
            by_account: BucketMap::new(),
        }
    }

    /// Spend a token for a client IP.
    pub fn allow_ip(&self, ip: IpAddr) -> bool {
        self.by_ip.allow(ip, Instant::now())
    }

    /// Spend a token for an account.
    pub fn allow_account(&self, account: &[u8]) -> bool {
        self.by_account.allow(account.to_vec(), Instant::now())
    }

    /// Drop long-idle buckets; called from the cleanup tick.
    pub fn prune(&self) {
        let now = Instant::now();
        self.by_ip.prune(now);
        self.by_account.prune(now);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_refusal() {
        let limiter = RateLimiter::new();
        let ip: IpAddr = "10.0.0.1".parse().expect("ip");
        let mut allowed = 0;
        for _ in 0..(BURST as usize + 10) {
            if limiter.allow_ip(ip) {
                allowed += 1;
            }
        }
        // The whole burst is admitted, plus at most a token or two of
        // refill that trickled in while the loop ran.
        assert!(allowed >= BURST as usize);
        assert!(allowed <= BURST as usize + 2);
        assert!(!limiter.allow_ip(ip));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new();
        let a: IpAddr = "10.0.0.1".parse().expect("ip");
        let b: IpAddr = "10.0.0.2".parse().expect("ip");
        for _ in 0..(BURST as usize + 5) {
            limiter.allow_ip(a);
        }
        assert!(limiter.allow_ip(b));
    }

    #[test]
    fn test_account_buckets() {
        let limiter = RateLimiter::new();
        for _ in 0..(BURST as usize + 5) {
            limiter.allow_account(b"acct");
        }
        assert!(!limiter.allow_account(b"acct"));
        assert!(limiter.allow_account(b"other"));
    }

    #[test]
    fn test_prune_resets_idle_buckets() {
        let limiter = RateLimiter::new();
        let ip: IpAddr = "10.0.0.3".parse().expect("ip");
        for _ in 0..(BURST as usize + 5) {
            limiter.allow_ip(ip);
        }
        assert!(!limiter.allow_ip(ip));
        // Prune with a fresh bucket map does nothing for a just-used key.
        limiter.prune();
        assert!(!limiter.allow_ip(ip));
    }
}
