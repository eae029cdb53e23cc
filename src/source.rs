use serde_json::Value;

use crate::context::{CancellationToken, RunContext};
use crate::domain::{CompoundIdentifiers, IdentifierKind, SourceKind};
use crate::error::TransportError;
use crate::model::SourceFields;
use crate::rate_limit::RateLimiter;

/// Transport and parser of one external data source.
///
/// `fetch` performs one logical lookup and returns the raw payload; it is
/// wrapped by the client in caching, rate limiting, circuit breaking and
/// retries. `parse` turns a payload, fresh or cached, into the
/// source-agnostic [`SourceFields`].
pub trait CompoundSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Identifier kinds this source can be queried by, most specific first.
    fn query_types(&self) -> &[IdentifierKind];

    fn fetch(
        &self,
        query_type: IdentifierKind,
        identifier: &str,
        pacer: &Pacer<'_>,
    ) -> Result<Value, TransportError>;

    fn parse(&self, payload: &Value) -> Result<SourceFields, String>;
}

/// The `(query type, identifier)` pairs `source` can be asked for, in the
/// source's preference order.
pub fn applicable_queries<'a>(
    source: &dyn CompoundSource,
    identifiers: &'a CompoundIdentifiers,
) -> Vec<(IdentifierKind, &'a str)> {
    source
        .query_types()
        .iter()
        .filter_map(|kind| identifiers.get(*kind).map(|value| (*kind, value)))
        .collect()
}

/// Rate-limit handle for follow-up requests made inside a single `fetch`
/// (e.g. a lookup followed by a detail request). The first request of an
/// attempt is already paid for.
pub struct Pacer<'a> {
    source: SourceKind,
    limiter: Option<&'a RateLimiter>,
    cancel: Option<&'a CancellationToken>,
}

impl<'a> Pacer<'a> {
    pub fn new(source: SourceKind, ctx: &'a RunContext) -> Self {
        Self {
            source,
            limiter: Some(&ctx.limiter),
            cancel: Some(&ctx.cancel),
        }
    }

    /// A pacer that never waits.
    pub fn unpaced(source: SourceKind) -> Pacer<'static> {
        Pacer {
            source,
            limiter: None,
            cancel: None,
        }
    }

    pub fn source(&self) -> SourceKind {
        self.source
    }

    pub fn pace(&self) -> Result<(), TransportError> {
        match (self.limiter, self.cancel) {
            (Some(limiter), Some(cancel)) => {
                if limiter.acquire_until_cancelled(self.source, cancel) {
                    Ok(())
                } else {
                    Err(TransportError::Cancelled)
                }
            }
            (Some(limiter), None) => {
                limiter.acquire(self.source);
                Ok(())
            }
            (None, Some(cancel)) if cancel.is_cancelled() => Err(TransportError::Cancelled),
            (None, _) => Ok(()),
        }
    }
}
