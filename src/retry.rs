use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::circuit::CircuitBreaker;
use crate::context::CancellationToken;
use crate::domain::SourceKind;
use crate::error::{SourceError, TransportError};
use crate::rate_limit::RateLimiter;

const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: true,
        }
    }
}

/// The gates every attempt has to pass before it may touch the network.
pub struct AttemptGates<'a> {
    pub source: SourceKind,
    pub limiter: &'a RateLimiter,
    pub breaker: Option<&'a CircuitBreaker>,
    pub cancel: &'a CancellationToken,
}

impl RetryPolicy {
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based): exponential growth capped
    /// at `max_delay`; with jitter the delay is drawn from the upper half.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        let capped = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if !self.jitter || capped.is_zero() {
            return capped;
        }
        let half = capped / 2;
        let spread = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(spread)
    }

    /// Runs `call` until it succeeds, fails non-transiently, or the retry
    /// budget is spent. Each attempt takes a rate-limit token and passes the
    /// circuit breaker; transient failures are reported to the breaker.
    pub fn run<T, F>(&self, gates: &AttemptGates<'_>, mut call: F) -> Result<T, SourceError>
    where
        F: FnMut(u32) -> Result<T, TransportError>,
    {
        let source = gates.source;
        let mut attempt = 0u32;
        loop {
            if gates.cancel.is_cancelled() {
                return Err(SourceError::Cancelled);
            }
            // A suspended source must not consume limiter tokens.
            if let Some(breaker) = gates.breaker {
                breaker.check()?;
            }
            if !gates.limiter.acquire_until_cancelled(source, gates.cancel) {
                return Err(SourceError::Cancelled);
            }
            if let Some(breaker) = gates.breaker {
                breaker.try_acquire()?;
            }

            attempt += 1;
            match call(attempt) {
                Ok(value) => {
                    if let Some(breaker) = gates.breaker {
                        breaker.record_success();
                    }
                    return Ok(value);
                }
                Err(TransportError::NotFound) => {
                    if let Some(breaker) = gates.breaker {
                        breaker.record_success();
                    }
                    return Err(SourceError::NotFound(source));
                }
                Err(TransportError::Cancelled) => {
                    if let Some(breaker) = gates.breaker {
                        breaker.release();
                    }
                    return Err(SourceError::Cancelled);
                }
                Err(TransportError::Permanent(reason)) => {
                    if let Some(breaker) = gates.breaker {
                        breaker.record_success();
                    }
                    return Err(SourceError::SourceFetchFailed {
                        kind: source,
                        attempts: attempt,
                        reason,
                    });
                }
                Err(TransportError::Transient(reason)) => {
                    if let Some(breaker) = gates.breaker {
                        breaker.record_failure();
                    }
                    if attempt > self.max_retries {
                        warn!(%source, attempts = attempt, %reason, "retries exhausted");
                        return Err(SourceError::SourceFetchFailed {
                            kind: source,
                            attempts: attempt,
                            reason,
                        });
                    }
                    let delay = self.backoff(attempt - 1);
                    debug!(%source, attempt, ?delay, %reason, "transient failure, backing off");
                    if !sleep_unless_cancelled(delay, gates.cancel) {
                        return Err(SourceError::Cancelled);
                    }
                }
            }
        }
    }
}

fn sleep_unless_cancelled(delay: Duration, cancel: &CancellationToken) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}
