use std::path::PathBuf;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{IdentifierKind, SourceKind};

#[derive(Debug, Error, Diagnostic)]
pub enum CollectorError {
    #[error("invalid {kind} identifier {value:?}: {reason}")]
    InvalidIdentifier {
        kind: IdentifierKind,
        value: String,
        reason: ValidationError,
    },

    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error("no sources enabled")]
    #[diagnostic(help("enable at least one source in the config or pass --source"))]
    NoSourcesEnabled,

    #[error("failed to read file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationError {
    #[error("invalid format")]
    InvalidFormat,
    #[error("checksum mismatch")]
    ChecksumMismatch,
}

/// Failure of one source for one compound. Never aborts a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("{0} is temporarily unavailable (circuit open)")]
    CircuitOpen(SourceKind),

    #[error("{0} rate limit exceeded")]
    RateLimited(SourceKind),

    #[error("{kind} fetch failed after {attempts} attempt(s): {reason}")]
    SourceFetchFailed {
        kind: SourceKind,
        attempts: u32,
        reason: String,
    },

    #[error("{kind} returned a malformed response: {reason}")]
    ParseError { kind: SourceKind, reason: String },

    #[error("{0} has no record for this identifier")]
    NotFound(SourceKind),

    #[error("run cancelled")]
    Cancelled,
}

impl SourceError {
    pub fn code(&self) -> &'static str {
        match self {
            SourceError::InvalidIdentifier(_) => "invalid_identifier",
            SourceError::CircuitOpen(_) => "circuit_open",
            SourceError::RateLimited(_) => "rate_limited",
            SourceError::SourceFetchFailed { .. } => "source_fetch_failed",
            SourceError::ParseError { .. } => "parse_error",
            SourceError::NotFound(_) => "not_found",
            SourceError::Cancelled => "cancelled",
        }
    }
}

/// Outcome of a single network attempt, as classified by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("rejected: {0}")]
    Permanent(String),
    #[error("not found")]
    NotFound,
    #[error("cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}
