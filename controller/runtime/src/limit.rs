//! Rate limiting for the event broker and the route compiler.

use ahash::AHashMap as HashMap;
use std::hash::Hash;
use tokio::time::{Duration, Instant};

/// Delays each item by the larger of its per-item backoff and the delay
/// imposed by a shared token bucket.
#[derive(Debug)]
pub struct RateLimiter<K> {
    backoff: ItemBackoff<K>,
    bucket: TokenBucket,
}

/// Exponential backoff per item: `base * 2^n`, capped at `max`, where `n` is
/// the number of times the item was seen since it was last forgotten.
#[derive(Debug)]
pub struct ItemBackoff<K> {
    base: Duration,
    max: Duration,
    failures: HashMap<K, u32>,
}

/// A token bucket refilled at `rate` tokens per second up to `burst` tokens.
///
/// Reservations may drive the bucket into debt; the returned delay is how
/// long the caller must wait before its token is available.
#[derive(Debug)]
pub struct TokenBucket {
    burst: f64,
    rate: f64,
    tokens: f64,
    last: Instant,
}

// === impl RateLimiter ===

impl<K: Clone + Eq + Hash> RateLimiter<K> {
    pub fn new(backoff: ItemBackoff<K>, bucket: TokenBucket) -> Self {
        Self { backoff, bucket }
    }

    /// The delay before `key` may be processed.
    pub fn when(&mut self, key: &K, now: Instant) -> Duration {
        self.backoff.when(key).max(self.bucket.reserve(now))
    }

    /// Resets the backoff of `key`.
    pub fn forget(&mut self, key: &K) {
        self.backoff.forget(key);
    }
}

// === impl ItemBackoff ===

impl<K: Clone + Eq + Hash> ItemBackoff<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: HashMap::new(),
        }
    }

    pub fn when(&mut self, key: &K) -> Duration {
        let n = self.failures.entry(key.clone()).or_default();
        let exp = *n;
        *n = n.saturating_add(1);
        // Past 2^32 the cap always applies.
        match 2u32.checked_pow(exp) {
            Some(factor) => self.base.saturating_mul(factor).min(self.max),
            None => self.max,
        }
    }

    pub fn forget(&mut self, key: &K) {
        self.failures.remove(key);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.failures.len()
    }
}

// === impl TokenBucket ===

impl TokenBucket {
    pub fn new(rate: f64, burst: u32, now: Instant) -> Self {
        Self {
            burst: burst as f64,
            rate,
            tokens: burst as f64,
            last: now,
        }
    }

    /// Takes a token, returning how long the caller must wait for it.
    pub fn reserve(&mut self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = self.last.max(now);
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(-self.tokens / self.rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn backoff_doubles_until_capped() {
        let mut backoff = ItemBackoff::new(Duration::from_millis(5), Duration::from_secs(30));
        let delays = (0..4).map(|_| backoff.when(&"a")).collect::<Vec<_>>();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(5),
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40),
            ]
        );
        for _ in 0..40 {
            backoff.when(&"a");
        }
        assert_eq!(backoff.when(&"a"), Duration::from_secs(30));

        // Items back off independently.
        assert_eq!(backoff.when(&"b"), Duration::from_millis(5));

        backoff.forget(&"a");
        assert_eq!(backoff.when(&"a"), Duration::from_millis(5));
        assert_eq!(backoff.len(), 2);
    }

    #[test]
    fn bucket_allows_a_burst_then_paces() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(10.0, 100, start);
        for _ in 0..100 {
            assert_eq!(bucket.reserve(start), Duration::ZERO);
        }
        assert_eq!(bucket.reserve(start), Duration::from_millis(100));
        assert_eq!(bucket.reserve(start), Duration::from_millis(200));

        // After a second of refill, the debt is paid and eight tokens remain.
        let later = start + Duration::from_secs(1);
        for _ in 0..8 {
            assert_eq!(bucket.reserve(later), Duration::ZERO);
        }
        assert!(bucket.reserve(later) > Duration::ZERO);
    }

    #[test]
    fn limiter_takes_the_longer_delay() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(
            ItemBackoff::new(Duration::from_millis(5), Duration::from_secs(30)),
            TokenBucket::new(10.0, 1, start),
        );
        assert_eq!(limiter.when(&1, start), Duration::from_millis(5));
        // The bucket is now empty; its 100ms wait dominates the 10ms backoff.
        assert_eq!(limiter.when(&1, start), Duration::from_millis(100));
        limiter.forget(&1);
        assert_eq!(limiter.when(&2, start + Duration::from_secs(1)), Duration::from_millis(5));
    }
}
