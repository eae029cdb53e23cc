use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use serde_json::{Value, json};

use chemdata_collector::cache::ResponseCache;
use chemdata_collector::circuit::{CircuitConfig, CircuitState};
use chemdata_collector::client::SourceClient;
use chemdata_collector::context::{RunContext, SourceSettings};
use chemdata_collector::domain::{IdentifierKind, SourceKind};
use chemdata_collector::error::{SourceError, TransportError};
use chemdata_collector::model::SourceFields;
use chemdata_collector::rate_limit::RateLimit;
use chemdata_collector::retry::RetryPolicy;
use chemdata_collector::source::{CompoundSource, Pacer};
use chemdata_collector::store::CacheStore;

/// Replays `script` in order, then answers with `fallback`.
struct MockPubchem {
    calls: Mutex<usize>,
    delay: Duration,
    script: Mutex<Vec<Result<Value, TransportError>>>,
    fallback: Result<Value, TransportError>,
}

impl MockPubchem {
    fn answering(payload: Value) -> Self {
        Self {
            calls: Mutex::new(0),
            delay: Duration::ZERO,
            script: Mutex::new(Vec::new()),
            fallback: Ok(payload),
        }
    }

    fn failing(error: TransportError) -> Self {
        Self {
            fallback: Err(error),
            ..Self::answering(Value::Null)
        }
    }

    fn scripted(script: Vec<Result<Value, TransportError>>, fallback: Value) -> Self {
        Self {
            script: Mutex::new(script),
            ..Self::answering(fallback)
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl CompoundSource for MockPubchem {
    fn kind(&self) -> SourceKind {
        SourceKind::Pubchem
    }

    fn query_types(&self) -> &[IdentifierKind] {
        &[IdentifierKind::Name]
    }

    fn fetch(
        &self,
        _query_type: IdentifierKind,
        _identifier: &str,
        _pacer: &Pacer<'_>,
    ) -> Result<Value, TransportError> {
        *self.calls.lock().unwrap() += 1;
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            self.fallback.clone()
        } else {
            script.remove(0)
        }
    }

    fn parse(&self, payload: &Value) -> Result<SourceFields, String> {
        let smiles = payload
            .get("smiles")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing smiles".to_string())?;
        Ok(SourceFields {
            smiles: Some(smiles.to_string()),
            ..SourceFields::default()
        })
    }
}

struct Settings {
    rate: f64,
    threshold: u32,
    ttl: Option<Duration>,
    retries: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rate: 1000.0,
            threshold: 5,
            ttl: None,
            retries: 2,
        }
    }
}

fn context(settings: Settings, cache: ResponseCache) -> RunContext {
    let source = SourceSettings {
        rate: RateLimit::per_second(settings.rate),
        circuit: CircuitConfig {
            failure_threshold: settings.threshold,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(60),
        },
        cache_ttl: settings.ttl,
    };
    let retry = RetryPolicy {
        max_retries: settings.retries,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        jitter: false,
    };
    RunContext::new(
        &BTreeMap::from([(SourceKind::Pubchem, source)]),
        retry,
        cache,
    )
}

fn ethanol() -> Value {
    json!({"smiles": "CCO"})
}

#[test]
fn concurrent_identical_requests_issue_one_call() {
    let ctx = context(Settings::default(), ResponseCache::in_memory());
    let source = Arc::new(MockPubchem::answering(ethanol()).slow(Duration::from_millis(100)));
    let client = SourceClient::new(source.clone());

    let results = thread::scope(|scope| {
        let handles = (0..8)
            .map(|_| scope.spawn(|| client.fetch(&ctx, IdentifierKind::Name, "ethanol")))
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>()
    });

    assert_eq!(source.calls(), 1);
    assert!(results.iter().all(|result| {
        result
            .as_ref()
            .is_ok_and(|record| record.fields.smiles.as_deref() == Some("CCO"))
    }));
    assert_eq!(results.iter().filter(|r| !r.as_ref().unwrap().from_cache).count(), 1);
}

#[test]
fn shared_failure_reaches_every_waiter() {
    let ctx = context(
        Settings {
            retries: 0,
            ..Settings::default()
        },
        ResponseCache::in_memory(),
    );
    let source = Arc::new(
        MockPubchem::failing(TransportError::Permanent("HTTP 400".to_string()))
            .slow(Duration::from_millis(100)),
    );
    let client = SourceClient::new(source.clone());

    let errors = thread::scope(|scope| {
        let handles = (0..4)
            .map(|_| scope.spawn(|| client.fetch(&ctx, IdentifierKind::Name, "ethanol")))
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap().unwrap_err())
            .collect::<Vec<_>>()
    });

    assert_eq!(source.calls(), 1);
    for error in errors {
        assert_matches!(error, SourceError::SourceFetchFailed { attempts: 1, .. });
    }
    // failures are not cached
    assert!(client.fetch(&ctx, IdentifierKind::Name, "ethanol").is_err());
    assert_eq!(source.calls(), 2);
}

#[test]
fn expired_entry_is_fetched_again() {
    let ctx = context(
        Settings {
            ttl: Some(Duration::from_millis(50)),
            ..Settings::default()
        },
        ResponseCache::in_memory(),
    );
    let source = Arc::new(MockPubchem::answering(ethanol()));
    let client = SourceClient::new(source.clone());

    client.fetch(&ctx, IdentifierKind::Name, "ethanol").unwrap();
    assert!(client.fetch(&ctx, IdentifierKind::Name, "ethanol").unwrap().from_cache);
    assert_eq!(source.calls(), 1);

    thread::sleep(Duration::from_millis(80));
    let record = client.fetch(&ctx, IdentifierKind::Name, "ethanol").unwrap();
    assert!(!record.from_cache);
    assert_eq!(source.calls(), 2);
}

#[test]
fn open_breaker_makes_no_network_call() {
    let ctx = context(
        Settings {
            threshold: 3,
            retries: 0,
            ..Settings::default()
        },
        ResponseCache::in_memory(),
    );
    let source = Arc::new(MockPubchem::failing(TransportError::Transient(
        "HTTP 503".to_string(),
    )));
    let client = SourceClient::new(source.clone());

    for name in ["a", "b", "c"] {
        assert_matches!(
            client.fetch(&ctx, IdentifierKind::Name, name),
            Err(SourceError::SourceFetchFailed { .. })
        );
    }
    assert_eq!(ctx.breaker(SourceKind::Pubchem).unwrap().state(), CircuitState::Open);

    assert_matches!(
        client.fetch(&ctx, IdentifierKind::Name, "d"),
        Err(SourceError::CircuitOpen(SourceKind::Pubchem))
    );
    assert_eq!(source.calls(), 3);
    let stats = ctx.stats.source(SourceKind::Pubchem);
    assert_eq!(stats.requests, 4);
    assert_eq!(stats.circuit_rejections, 1);
    assert_eq!(stats.failures, 4);
}

#[test]
fn open_breaker_rejects_without_waiting_for_the_limiter() {
    let ctx = context(
        Settings {
            rate: 2.0,
            threshold: 1,
            ..Settings::default()
        },
        ResponseCache::in_memory(),
    );
    let source = Arc::new(MockPubchem::answering(ethanol()));
    let client = SourceClient::new(source.clone());
    ctx.breaker(SourceKind::Pubchem).unwrap().record_failure();

    let started = Instant::now();
    for name in ["a", "b", "c", "d"] {
        assert_matches!(
            client.fetch(&ctx, IdentifierKind::Name, name),
            Err(SourceError::CircuitOpen(SourceKind::Pubchem))
        );
    }
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_millis(200), "rejections took {elapsed:?}");
    assert_eq!(source.calls(), 0);
    assert_eq!(ctx.stats.source(SourceKind::Pubchem).circuit_rejections, 4);
}

#[test]
fn cached_answer_survives_an_open_breaker() {
    let ctx = context(
        Settings {
            threshold: 1,
            ..Settings::default()
        },
        ResponseCache::in_memory(),
    );
    let source = Arc::new(MockPubchem::answering(ethanol()));
    let client = SourceClient::new(source.clone());

    client.fetch(&ctx, IdentifierKind::Name, "ethanol").unwrap();
    ctx.breaker(SourceKind::Pubchem).unwrap().record_failure();
    assert_eq!(ctx.breaker(SourceKind::Pubchem).unwrap().state(), CircuitState::Open);

    let record = client.fetch(&ctx, IdentifierKind::Name, "ethanol").unwrap();
    assert!(record.from_cache);
    assert_eq!(source.calls(), 1);
}

#[test]
fn transient_failures_are_retried() {
    let ctx = context(
        Settings {
            retries: 3,
            ..Settings::default()
        },
        ResponseCache::in_memory(),
    );
    let source = Arc::new(MockPubchem::scripted(
        vec![
            Err(TransportError::Transient("timeout".to_string())),
            Err(TransportError::Transient("HTTP 502".to_string())),
        ],
        ethanol(),
    ));
    let client = SourceClient::new(source.clone());

    let record = client.fetch(&ctx, IdentifierKind::Name, "ethanol").unwrap();
    assert_eq!(record.fields.smiles.as_deref(), Some("CCO"));
    assert_eq!(source.calls(), 3);
    let stats = ctx.stats.source(SourceKind::Pubchem);
    assert_eq!(stats.requests, 1);
    assert_eq!(stats.attempts, 3);
    assert_eq!(stats.successes, 1);
    assert_eq!(
        ctx.breaker(SourceKind::Pubchem).unwrap().state(),
        CircuitState::Closed
    );
}

#[test]
fn requests_are_spaced_by_the_rate_limit() {
    let rate = 20.0;
    let ctx = context(
        Settings {
            rate,
            ..Settings::default()
        },
        ResponseCache::in_memory(),
    );
    let source = Arc::new(MockPubchem::answering(ethanol()));
    let client = SourceClient::new(source.clone());

    let n = 6;
    let started = Instant::now();
    thread::scope(|scope| {
        for i in 0..n {
            let client = &client;
            let ctx = &ctx;
            scope.spawn(move || {
                client
                    .fetch(ctx, IdentifierKind::Name, &format!("compound-{i}"))
                    .unwrap();
            });
        }
    });
    let elapsed = started.elapsed();

    assert_eq!(source.calls(), n);
    let minimum = Duration::from_secs_f64((n - 1) as f64 / rate);
    assert!(
        elapsed + Duration::from_millis(10) >= minimum,
        "{n} calls took {elapsed:?}, expected at least {minimum:?}"
    );
}

#[test]
fn persistent_tier_survives_a_new_run() {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let source = Arc::new(MockPubchem::answering(ethanol()));
    let client = SourceClient::new(source.clone());

    let first = context(
        Settings::default(),
        ResponseCache::with_store(CacheStore::with_root(root.clone())),
    );
    assert!(!client.fetch(&first, IdentifierKind::Name, "ethanol").unwrap().from_cache);
    drop(first);

    let store = CacheStore::with_root(root);
    assert_eq!(store.summary().unwrap().entries, 1);
    let second = context(Settings::default(), ResponseCache::with_store(store));
    let record = client.fetch(&second, IdentifierKind::Name, "ethanol").unwrap();
    assert!(record.from_cache);
    assert_eq!(source.calls(), 1);
}
