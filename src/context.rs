use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::cache::ResponseCache;
use crate::circuit::{CircuitBreaker, CircuitBreakers, CircuitConfig};
use crate::domain::SourceKind;
use crate::rate_limit::{RateLimit, RateLimiter};
use crate::retry::{AttemptGates, RetryPolicy};
use crate::stats::StatsCollector;

/// Cooperative stop signal shared by every worker of a run.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Resilience settings of one source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceSettings {
    pub rate: RateLimit,
    pub circuit: CircuitConfig,
    /// `None` keeps responses for the whole lifetime of the cache.
    pub cache_ttl: Option<Duration>,
}

impl SourceSettings {
    pub fn for_source(source: SourceKind) -> Self {
        let (requests_per_second, cache_ttl) = match source {
            SourceKind::Pubchem => (5.0, Some(DEFAULT_TTL)),
            SourceKind::Chembl => (3.0, Some(DEFAULT_TTL)),
            SourceKind::Pubmed => (3.0, Some(DEFAULT_TTL)),
            SourceKind::Patents => (5.0, None),
            SourceKind::Psychonaut => (1.0, Some(DEFAULT_TTL)),
            SourceKind::Wikipedia => (10.0, Some(DEFAULT_TTL)),
        };
        Self {
            rate: RateLimit::per_second(requests_per_second),
            circuit: CircuitConfig::default(),
            cache_ttl,
        }
    }
}

pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Everything a run shares across workers: built once at run start, dropped
/// at run end.
#[derive(Debug)]
pub struct RunContext {
    pub limiter: RateLimiter,
    pub breakers: CircuitBreakers,
    pub cache: ResponseCache,
    pub stats: StatsCollector,
    pub retry: RetryPolicy,
    pub cancel: CancellationToken,
    ttls: HashMap<SourceKind, Option<Duration>>,
}

impl RunContext {
    pub fn new(
        sources: &BTreeMap<SourceKind, SourceSettings>,
        retry: RetryPolicy,
        cache: ResponseCache,
    ) -> Self {
        Self {
            limiter: RateLimiter::new(sources.iter().map(|(kind, settings)| (*kind, settings.rate))),
            breakers: CircuitBreakers::new(
                sources.iter().map(|(kind, settings)| (*kind, settings.circuit)),
            ),
            cache,
            stats: StatsCollector::new(),
            retry,
            cancel: CancellationToken::new(),
            ttls: sources
                .iter()
                .map(|(kind, settings)| (*kind, settings.cache_ttl))
                .collect(),
        }
    }

    /// Context with default settings for every source and an in-memory cache.
    pub fn with_defaults() -> Self {
        let sources = SourceKind::ALL
            .into_iter()
            .map(|kind| (kind, SourceSettings::for_source(kind)))
            .collect();
        Self::new(&sources, RetryPolicy::default(), ResponseCache::in_memory())
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn breaker(&self, source: SourceKind) -> Option<&CircuitBreaker> {
        self.breakers.get(source)
    }

    pub fn cache_ttl(&self, source: SourceKind) -> Option<Duration> {
        self.ttls.get(&source).copied().unwrap_or(Some(DEFAULT_TTL))
    }

    pub fn gates(&self, source: SourceKind) -> AttemptGates<'_> {
        AttemptGates {
            source,
            limiter: &self.limiter,
            breaker: self.breakers.get(source),
            cancel: &self.cancel,
        }
    }
}
