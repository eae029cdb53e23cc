use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::context::CancellationToken;
use crate::domain::SourceKind;

const WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub requests_per_second: f64,
    pub burst: u32,
}

impl RateLimit {
    pub fn per_second(requests_per_second: f64) -> Self {
        Self {
            requests_per_second,
            burst: 1,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(limit: RateLimit) -> Self {
        let capacity = f64::from(limit.burst.max(1));
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: limit.requests_per_second,
            last_refill: Instant::now(),
        }
    }

    /// Takes one token, possibly going into debt, and returns how long the
    /// caller has to wait before its token is actually available. Debt keeps
    /// concurrent waiters in FIFO order without holding the lock while asleep.
    fn reserve(&mut self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.refill_per_sec)
        }
    }
}

/// Per-source token bucket. Never rejects, only delays.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: HashMap<SourceKind, Mutex<Bucket>>,
}

impl RateLimiter {
    pub fn new(limits: impl IntoIterator<Item = (SourceKind, RateLimit)>) -> Self {
        let buckets = limits
            .into_iter()
            .filter(|(_, limit)| limit.requests_per_second > 0.0)
            .map(|(source, limit)| (source, Mutex::new(Bucket::new(limit))))
            .collect();
        Self { buckets }
    }

    /// Blocks until a token for `source` is available and consumes it.
    /// Sources without a configured limit pass straight through.
    pub fn acquire(&self, source: SourceKind) {
        let wait = self.reserve(source);
        if !wait.is_zero() {
            thread::sleep(wait);
        }
    }

    /// Like [`acquire`](Self::acquire) but gives up early once `cancel` fires.
    /// Returns `false` if cancelled before the token became available.
    pub fn acquire_until_cancelled(&self, source: SourceKind, cancel: &CancellationToken) -> bool {
        let wait = self.reserve(source);
        let deadline = Instant::now() + wait;
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(WAIT_SLICE));
        }
    }

    fn reserve(&self, source: SourceKind) -> Duration {
        match self.buckets.get(&source) {
            Some(bucket) => bucket
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .reserve(Instant::now()),
            None => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_is_served_immediately() {
        let mut bucket = Bucket::new(RateLimit {
            requests_per_second: 1.0,
            burst: 3,
        });
        let now = Instant::now();
        assert_eq!(bucket.reserve(now), Duration::ZERO);
        assert_eq!(bucket.reserve(now), Duration::ZERO);
        assert_eq!(bucket.reserve(now), Duration::ZERO);
        assert!(bucket.reserve(now) > Duration::from_millis(900));
    }

    #[test]
    fn debt_accumulates_for_waiters() {
        let mut bucket = Bucket::new(RateLimit::per_second(10.0));
        let now = Instant::now();
        assert_eq!(bucket.reserve(now), Duration::ZERO);
        let second = bucket.reserve(now);
        let third = bucket.reserve(now);
        assert!((second.as_secs_f64() - 0.1).abs() < 1e-6);
        assert!((third.as_secs_f64() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn refill_is_capped_at_capacity() {
        let mut bucket = Bucket::new(RateLimit::per_second(100.0));
        let later = Instant::now() + Duration::from_secs(10);
        assert_eq!(bucket.reserve(later), Duration::ZERO);
        assert!(bucket.reserve(later) > Duration::ZERO);
    }

    #[test]
    fn unlimited_source_does_not_wait() {
        let limiter = RateLimiter::new([(SourceKind::Pubchem, RateLimit::per_second(1.0))]);
        let started = Instant::now();
        for _ in 0..5 {
            limiter.acquire(SourceKind::Chembl);
        }
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn cancelled_wait_returns_false() {
        let limiter = RateLimiter::new([(SourceKind::Pubchem, RateLimit::per_second(0.2))]);
        let cancel = CancellationToken::new();
        assert!(limiter.acquire_until_cancelled(SourceKind::Pubchem, &cancel));
        cancel.cancel();
        let started = Instant::now();
        assert!(!limiter.acquire_until_cancelled(SourceKind::Pubchem, &cancel));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
