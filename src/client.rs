use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::cache::CacheOutcome;
use crate::context::RunContext;
use crate::domain::{CompoundIdentifiers, IdentifierKind, SourceKind, SourceQueryKey};
use crate::error::SourceError;
use crate::model::SourceRecord;
use crate::source::{CompoundSource, Pacer, applicable_queries};

/// One source behind the shared fetch pipeline: cache and single-flight,
/// then per attempt rate limit, circuit breaker and retry, then parse.
#[derive(Clone)]
pub struct SourceClient {
    source: Arc<dyn CompoundSource>,
}

impl SourceClient {
    pub fn new(source: Arc<dyn CompoundSource>) -> Self {
        Self { source }
    }

    pub fn kind(&self) -> SourceKind {
        self.source.kind()
    }

    pub fn query_types(&self) -> &[IdentifierKind] {
        self.source.query_types()
    }

    pub fn applicable_queries<'a>(
        &self,
        identifiers: &'a CompoundIdentifiers,
    ) -> Vec<(IdentifierKind, &'a str)> {
        applicable_queries(self.source.as_ref(), identifiers)
    }

    pub fn accepts(&self, identifiers: &CompoundIdentifiers) -> bool {
        !self.applicable_queries(identifiers).is_empty()
    }

    /// Fetches `identifier` by `query_type`. Every failure comes back as a
    /// [`SourceError`]; nothing here aborts the caller.
    pub fn fetch(
        &self,
        ctx: &RunContext,
        query_type: IdentifierKind,
        identifier: &str,
    ) -> Result<SourceRecord, SourceError> {
        let kind = self.kind();
        ctx.stats.record_request(kind);
        if ctx.cancel.is_cancelled() {
            return Err(SourceError::Cancelled);
        }

        let key = SourceQueryKey::new(kind, query_type, identifier);
        let fetched = ctx.cache.get_or_fetch(&key, ctx.cache_ttl(kind), || {
            let pacer = Pacer::new(kind, ctx);
            let payload = ctx.retry.run(&ctx.gates(kind), |attempt| {
                ctx.stats.record_attempt(kind);
                debug!(source = %kind, %key, attempt, "requesting");
                self.source.fetch(query_type, identifier, &pacer)
            })?;
            // Only payloads that parse are worth caching.
            self.source
                .parse(&payload)
                .map_err(|reason| SourceError::ParseError { kind, reason })?;
            Ok(payload)
        });

        let (payload, outcome) = match fetched {
            Ok(fetched) => fetched,
            Err(err) => {
                ctx.stats.record_cache(kind, false);
                ctx.stats.record_error(kind, &err);
                return Err(err);
            }
        };
        let from_cache = outcome != CacheOutcome::Fetched;
        ctx.stats.record_cache(kind, from_cache);

        let fields = match self.source.parse(&payload) {
            Ok(fields) => fields,
            Err(reason) => {
                let err = SourceError::ParseError { kind, reason };
                ctx.stats.record_error(kind, &err);
                return Err(err);
            }
        };
        ctx.stats.record_success(kind);

        Ok(SourceRecord {
            source: kind,
            retrieved_at: Utc::now(),
            query_type,
            from_cache,
            fields,
        })
    }

    /// Tries every applicable identifier in preference order. A "no record"
    /// answer moves on to the next identifier; any other error ends the
    /// lookup. Returns `Ok(None)` when the source cannot be asked at all.
    pub fn fetch_compound(
        &self,
        ctx: &RunContext,
        identifiers: &CompoundIdentifiers,
    ) -> Result<Option<SourceRecord>, SourceError> {
        let queries = self.applicable_queries(identifiers);
        if queries.is_empty() {
            return Ok(None);
        }
        let mut last_error = SourceError::NotFound(self.kind());
        for (query_type, identifier) in queries {
            match self.fetch(ctx, query_type, identifier) {
                Ok(record) => return Ok(Some(record)),
                Err(err @ SourceError::NotFound(_)) => last_error = err,
                Err(err) => return Err(err),
            }
        }
        Err(last_error)
    }
}

impl std::fmt::Debug for SourceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceClient")
            .field("source", &self.kind())
            .finish()
    }
}
