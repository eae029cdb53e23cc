use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::SourceQueryKey;
use crate::error::{CollectorError, SourceError};
use crate::store::CacheStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: SourceQueryKey,
    pub payload: Value,
    pub fetched_at: DateTime<Utc>,
    /// `None` never expires.
    pub ttl: Option<Duration>,
}

impl CacheEntry {
    pub fn new(key: SourceQueryKey, payload: Value, ttl: Option<Duration>) -> Self {
        Self {
            key,
            payload,
            fetched_at: Utc::now(),
            ttl,
        }
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let Some(ttl) = self.ttl else {
            return true;
        };
        match now.signed_duration_since(self.fetched_at).to_std() {
            Ok(age) => age < ttl,
            // fetched_at in the future: clock skew, treat as fresh
            Err(_) => true,
        }
    }
}

/// How a payload returned by [`ResponseCache::get_or_fetch`] was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    /// Another worker was already fetching the same key; its result was shared.
    Joined,
    Fetched,
}

#[derive(Debug, Default)]
struct InFlight {
    result: Mutex<Option<Result<Value, SourceError>>>,
    ready: Condvar,
}

impl InFlight {
    fn complete(&self, result: Result<Value, SourceError>) {
        let mut slot = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(result);
        }
        self.ready.notify_all();
    }

    fn wait(&self) -> Result<Value, SourceError> {
        let mut slot = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            slot = self.ready.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

enum Role {
    Leader(Arc<InFlight>),
    Waiter(Arc<InFlight>),
}

/// Resolves the flight even if the fetching closure unwinds, so waiters never
/// block forever.
struct Leader<'a> {
    cache: &'a ResponseCache,
    key: &'a SourceQueryKey,
    flight: Arc<InFlight>,
}

impl Drop for Leader<'_> {
    fn drop(&mut self) {
        self.flight.complete(Err(SourceError::SourceFetchFailed {
            kind: self.key.source,
            attempts: 0,
            reason: "fetch aborted".to_string(),
        }));
        self.cache.pending().remove(self.key);
    }
}

/// Memory cache of raw source responses, optionally backed by a
/// [`CacheStore`], with single-flight deduplication of concurrent misses.
#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: Mutex<HashMap<SourceQueryKey, CacheEntry>>,
    pending: Mutex<HashMap<SourceQueryKey, Arc<InFlight>>>,
    store: Option<CacheStore>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_store(store: CacheStore) -> Self {
        Self {
            store: Some(store),
            ..Self::default()
        }
    }

    pub fn store(&self) -> Option<&CacheStore> {
        self.store.as_ref()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<SourceQueryKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<SourceQueryKey, Arc<InFlight>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fresh payload for `key`, if any. Expired entries are evicted.
    pub fn get(&self, key: &SourceQueryKey) -> Option<Value> {
        let now = Utc::now();
        {
            let mut entries = self.entries();
            match entries.get(key) {
                Some(entry) if entry.is_fresh(now) => return Some(entry.payload.clone()),
                Some(_) => {
                    entries.remove(key);
                }
                None => {}
            }
        }
        let entry = self.store.as_ref()?.load(key)?;
        let payload = entry.payload.clone();
        self.entries().insert(key.clone(), entry);
        Some(payload)
    }

    pub fn put(&self, key: SourceQueryKey, payload: Value, ttl: Option<Duration>) {
        let entry = CacheEntry::new(key.clone(), payload, ttl);
        if let Some(store) = &self.store
            && let Err(err) = store.save(&entry)
        {
            warn!(%key, error = %err, "failed to persist cache entry");
        }
        self.entries().insert(key, entry);
    }

    pub fn clear(&self) -> Result<(), CollectorError> {
        self.entries().clear();
        if let Some(store) = &self.store {
            store.clear()?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Returns the cached payload for `key` or runs `fetch` to produce it.
    /// Concurrent callers with the same key share a single `fetch`; its
    /// result, success or failure, is handed to all of them. Only successes
    /// are stored.
    pub fn get_or_fetch<F>(
        &self,
        key: &SourceQueryKey,
        ttl: Option<Duration>,
        fetch: F,
    ) -> Result<(Value, CacheOutcome), SourceError>
    where
        F: FnOnce() -> Result<Value, SourceError>,
    {
        if let Some(payload) = self.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(%key, "cache hit");
            return Ok((payload, CacheOutcome::Hit));
        }

        let role = {
            let mut pending = self.pending();
            match pending.get(key) {
                Some(flight) => Role::Waiter(Arc::clone(flight)),
                None => {
                    // A leader stores its entry before leaving the registry, so
                    // a re-check under the registry lock cannot miss a finished
                    // fetch.
                    if let Some(payload) = self.get(key) {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok((payload, CacheOutcome::Hit));
                    }
                    let flight = Arc::new(InFlight::default());
                    pending.insert(key.clone(), Arc::clone(&flight));
                    Role::Leader(flight)
                }
            }
        };

        let flight = match role {
            Role::Waiter(flight) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(%key, "joining in-flight request");
                return flight.wait().map(|payload| (payload, CacheOutcome::Joined));
            }
            Role::Leader(flight) => flight,
        };

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(%key, "cache miss");
        let leader = Leader {
            cache: self,
            key,
            flight,
        };
        let result = fetch();
        if let Ok(payload) = &result {
            self.put(key.clone(), payload.clone(), ttl);
        }
        leader.flight.complete(result.clone());
        drop(leader);
        result.map(|payload| (payload, CacheOutcome::Fetched))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::domain::{IdentifierKind, SourceKind};

    fn key(id: &str) -> SourceQueryKey {
        SourceQueryKey::new(SourceKind::Pubchem, IdentifierKind::Cas, id)
    }

    #[test]
    fn put_get_clear() {
        let cache = ResponseCache::in_memory();
        cache.put(key("50-78-2"), json!({"cid": 2244}), None);
        assert_eq!(cache.get(&key("50-78-2")), Some(json!({"cid": 2244})));
        assert_eq!(cache.get(&key("64-17-5")), None);
        cache.clear().unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let cache = ResponseCache::in_memory();
        cache.put(key("50-78-2"), json!(1), Some(Duration::from_millis(10)));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get(&key("50-78-2")), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn failures_are_not_cached() {
        let cache = ResponseCache::in_memory();
        let result = cache.get_or_fetch(&key("50-78-2"), None, || {
            Err(SourceError::NotFound(SourceKind::Pubchem))
        });
        assert_matches!(result, Err(SourceError::NotFound(_)));
        let (payload, outcome) = cache
            .get_or_fetch(&key("50-78-2"), None, || Ok(json!("ok")))
            .unwrap();
        assert_eq!(payload, json!("ok"));
        assert_eq!(outcome, CacheOutcome::Fetched);
    }

    #[test]
    fn concurrent_misses_share_one_fetch() {
        let cache = ResponseCache::in_memory();
        let calls = AtomicUsize::new(0);
        let barrier = Barrier::new(4);

        let outcomes = thread::scope(|scope| {
            let handles = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        cache.get_or_fetch(&key("50-78-2"), None, || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(100));
                            Ok(json!({"cid": 2244}))
                        })
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect::<Vec<_>>()
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for outcome in outcomes {
            assert_eq!(outcome.unwrap().0, json!({"cid": 2244}));
        }
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 3);
    }

    #[test]
    fn shared_failure_reaches_every_waiter() {
        let cache = ResponseCache::in_memory();
        let calls = AtomicUsize::new(0);
        let barrier = Barrier::new(3);

        let results = thread::scope(|scope| {
            let handles = (0..3)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        cache.get_or_fetch(&key("7732-18-5"), None, || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(100));
                            Err(SourceError::SourceFetchFailed {
                                kind: SourceKind::Pubchem,
                                attempts: 4,
                                reason: "503".to_string(),
                            })
                        })
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect::<Vec<_>>()
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_matches!(result, Err(SourceError::SourceFetchFailed { attempts: 4, .. }));
        }
        assert!(cache.is_empty());
    }

    #[test]
    fn disk_tier_survives_a_new_cache() {
        let dir = tempfile::tempdir().unwrap();
        let root = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let first = ResponseCache::with_store(CacheStore::with_root(root.clone()));
        first.put(key("50-78-2"), json!("aspirin"), None);

        let second = ResponseCache::with_store(CacheStore::with_root(root));
        let (payload, outcome) = second
            .get_or_fetch(&key("50-78-2"), None, || panic!("must be served from disk"))
            .unwrap();
        assert_eq!(payload, json!("aspirin"));
        assert_eq!(outcome, CacheOutcome::Hit);
    }
}
