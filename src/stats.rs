use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

use crate::domain::SourceKind;
use crate::error::SourceError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    /// Logical fetches handed to the client.
    pub requests: u64,
    /// Network attempts, retries included.
    pub attempts: u64,
    /// Requests the source answered, including "no record" answers.
    pub successes: u64,
    pub not_found: u64,
    pub failures: u64,
    pub circuit_rejections: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl SourceStats {
    pub fn reliability(&self) -> f64 {
        ratio(self.successes, self.requests)
    }
}

/// Run-scoped counters, shared by every worker.
#[derive(Debug, Default)]
pub struct StatsCollector {
    compounds: AtomicUsize,
    resolved: AtomicUsize,
    unresolved: AtomicUsize,
    rejected: AtomicUsize,
    cancelled: AtomicUsize,
    sources: Mutex<BTreeMap<SourceKind, SourceStats>>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_source(&self, source: SourceKind, update: impl FnOnce(&mut SourceStats)) {
        let mut sources = self.sources.lock().unwrap_or_else(PoisonError::into_inner);
        update(sources.entry(source).or_default());
    }

    pub fn record_request(&self, source: SourceKind) {
        self.with_source(source, |stats| stats.requests += 1);
    }

    pub fn record_attempt(&self, source: SourceKind) {
        self.with_source(source, |stats| stats.attempts += 1);
    }

    pub fn record_cache(&self, source: SourceKind, hit: bool) {
        self.with_source(source, |stats| {
            if hit {
                stats.cache_hits += 1;
            } else {
                stats.cache_misses += 1;
            }
        });
    }

    pub fn record_success(&self, source: SourceKind) {
        self.with_source(source, |stats| stats.successes += 1);
    }

    pub fn record_error(&self, source: SourceKind, error: &SourceError) {
        self.with_source(source, |stats| match error {
            SourceError::NotFound(_) => {
                stats.successes += 1;
                stats.not_found += 1;
            }
            SourceError::CircuitOpen(_) => {
                stats.failures += 1;
                stats.circuit_rejections += 1;
            }
            // Cancellation says nothing about the source.
            SourceError::Cancelled => {}
            _ => stats.failures += 1,
        });
    }

    pub fn record_compound(&self, resolved: bool) {
        self.compounds.fetch_add(1, Ordering::Relaxed);
        if resolved {
            self.resolved.fetch_add(1, Ordering::Relaxed);
        } else {
            self.unresolved.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn source(&self, source: SourceKind) -> SourceStats {
        self.sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&source)
            .copied()
            .unwrap_or_default()
    }

    pub fn finalize(&self, elapsed: Duration) -> ProcessingStats {
        let sources = self
            .sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let cache_hits = sources.values().map(|stats| stats.cache_hits).sum();
        let cache_misses = sources.values().map(|stats| stats.cache_misses).sum();
        ProcessingStats {
            total_compounds: self.compounds.load(Ordering::Relaxed)
                + self.rejected.load(Ordering::Relaxed)
                + self.cancelled.load(Ordering::Relaxed),
            succeeded: self.resolved.load(Ordering::Relaxed),
            failed: self.unresolved.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            cache_hits,
            cache_misses,
            elapsed_ms: elapsed.as_millis() as u64,
            sources,
        }
    }
}

/// Finalized run report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingStats {
    pub total_compounds: usize,
    /// Compounds with data from at least one source.
    pub succeeded: usize,
    /// Compounds emitted as unresolved rows.
    pub failed: usize,
    pub rejected: usize,
    pub cancelled: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub elapsed_ms: u64,
    pub sources: BTreeMap<SourceKind, SourceStats>,
}

impl ProcessingStats {
    pub fn success_rate(&self) -> f64 {
        ratio(self.succeeded as u64, (self.succeeded + self.failed) as u64)
    }

    pub fn cache_hit_ratio(&self) -> f64 {
        ratio(self.cache_hits, self.cache_hits + self.cache_misses)
    }

    pub fn reliability(&self) -> BTreeMap<SourceKind, f64> {
        self.sources
            .iter()
            .map(|(source, stats)| (*source, stats.reliability()))
            .collect()
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            success_rate: self.success_rate(),
            cache_hit_ratio: self.cache_hit_ratio(),
            reliability: self.reliability(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub success_rate: f64,
    pub cache_hit_ratio: f64,
    pub reliability: BTreeMap<SourceKind, f64>,
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}
