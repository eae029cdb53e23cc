use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::domain::SourceKind;
use crate::error::SourceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitConfig {
    /// Failures inside `window` that open the circuit.
    pub failure_threshold: u32,
    pub window: Duration,
    /// Time spent Open before a single probe is let through.
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Failure-tracking gate in front of one source, shared by every worker
/// that talks to it. All transitions happen under one lock.
#[derive(Debug)]
pub struct CircuitBreaker {
    source: SourceKind,
    config: CircuitConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(source: SourceKind, config: CircuitConfig) -> Self {
        Self {
            source,
            config,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Asks to perform one network call. Fails fast with `CircuitOpen` while
    /// the source is suspended; after the cool-down exactly one caller gets
    /// through as the HalfOpen probe.
    pub fn try_acquire(&self) -> Result<(), SourceError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .is_some_and(|opened| opened.elapsed() >= self.config.cooldown);
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!(source = %self.source, "circuit half-open, sending probe");
                    Ok(())
                } else {
                    Err(SourceError::CircuitOpen(self.source))
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(SourceError::CircuitOpen(self.source))
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Whether `try_acquire` would refuse a call right now. Changes no state,
    /// so it is safe to ask before spending a rate-limit token.
    pub fn check(&self) -> Result<(), SourceError> {
        let inner = self.lock();
        let refused = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => !inner
                .opened_at
                .is_some_and(|opened| opened.elapsed() >= self.config.cooldown),
            CircuitState::HalfOpen => inner.probe_in_flight,
        };
        if refused {
            Err(SourceError::CircuitOpen(self.source))
        } else {
            Ok(())
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.failures.clear(),
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failures.clear();
                inner.opened_at = None;
                inner.probe_in_flight = false;
                info!(source = %self.source, "circuit closed after successful probe");
            }
            // A straggler from before the circuit opened proves nothing.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failures.push_back(now);
                let window = self.config.window;
                while inner
                    .failures
                    .front()
                    .is_some_and(|at| now.saturating_duration_since(*at) > window)
                {
                    inner.failures.pop_front();
                }
                if inner.failures.len() >= self.config.failure_threshold as usize {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    warn!(
                        source = %self.source,
                        failures = inner.failures.len(),
                        "circuit opened after reaching failure threshold"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.probe_in_flight = false;
                warn!(source = %self.source, "probe failed, circuit re-opened");
            }
            CircuitState::Open => {}
        }
    }

    /// Ends an acquired call that produced no verdict on source health
    /// (cancelled before the request was sent).
    pub fn release(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> usize {
        self.lock().failures.len()
    }

    pub fn source(&self) -> SourceKind {
        self.source
    }
}

#[derive(Debug, Default)]
pub struct CircuitBreakers {
    breakers: HashMap<SourceKind, CircuitBreaker>,
}

impl CircuitBreakers {
    pub fn new(configs: impl IntoIterator<Item = (SourceKind, CircuitConfig)>) -> Self {
        let breakers = configs
            .into_iter()
            .map(|(source, config)| (source, CircuitBreaker::new(source, config)))
            .collect();
        Self { breakers }
    }

    pub fn get(&self, source: SourceKind) -> Option<&CircuitBreaker> {
        self.breakers.get(&source)
    }

    pub fn states(&self) -> Vec<(SourceKind, CircuitState)> {
        let mut states = self
            .breakers
            .iter()
            .map(|(source, breaker)| (*source, breaker.state()))
            .collect::<Vec<_>>();
        states.sort_by_key(|(source, _)| *source);
        states
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use assert_matches::assert_matches;

    use super::*;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            SourceKind::Pubchem,
            CircuitConfig {
                failure_threshold: threshold,
                window: Duration::from_secs(60),
                cooldown: Duration::from_millis(cooldown_ms),
            },
        )
    }

    #[test]
    fn opens_at_threshold() {
        let breaker = breaker(3, 60_000);
        for i in 0..2 {
            breaker.record_failure();
            assert_eq!(breaker.state(), CircuitState::Closed);
            assert_eq!(breaker.failure_count(), i + 1);
        }
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_matches!(breaker.try_acquire(), Err(SourceError::CircuitOpen(SourceKind::Pubchem)));
    }

    #[test]
    fn success_resets_consecutive_count() {
        let breaker = breaker(3, 60_000);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn failures_outside_window_expire() {
        let breaker = CircuitBreaker::new(
            SourceKind::Chembl,
            CircuitConfig {
                failure_threshold: 2,
                window: Duration::from_millis(30),
                cooldown: Duration::from_secs(60),
            },
        );
        breaker.record_failure();
        thread::sleep(Duration::from_millis(60));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 1);
    }

    #[test]
    fn single_probe_after_cooldown() {
        let breaker = breaker(1, 20);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        thread::sleep(Duration::from_millis(40));

        assert!(breaker.try_acquire().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire().is_err());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn failed_probe_reopens_and_restarts_cooldown() {
        let breaker = breaker(1, 30);
        breaker.record_failure();
        thread::sleep(Duration::from_millis(50));
        assert!(breaker.try_acquire().is_ok());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_err());
        thread::sleep(Duration::from_millis(50));
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn check_mirrors_acquire_without_changing_state() {
        let breaker = breaker(1, 20);
        assert!(breaker.check().is_ok());
        breaker.record_failure();
        assert_matches!(breaker.check(), Err(SourceError::CircuitOpen(SourceKind::Pubchem)));

        thread::sleep(Duration::from_millis(40));
        assert!(breaker.check().is_ok());
        assert!(breaker.check().is_ok());
        assert_eq!(breaker.state(), CircuitState::Open);

        assert!(breaker.try_acquire().is_ok());
        assert_matches!(breaker.check(), Err(SourceError::CircuitOpen(_)));
        breaker.release();
        assert!(breaker.check().is_ok());
    }

    #[test]
    fn released_probe_frees_the_slot() {
        let breaker = breaker(1, 10);
        breaker.record_failure();
        thread::sleep(Duration::from_millis(20));
        assert!(breaker.try_acquire().is_ok());
        breaker.release();
        assert!(breaker.try_acquire().is_ok());
    }
}
