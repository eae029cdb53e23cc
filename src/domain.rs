use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{CollectorError, ValidationError};
use crate::validate::validate_identifier;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Pubchem,
    Chembl,
    Pubmed,
    Patents,
    Psychonaut,
    Wikipedia,
}

impl SourceKind {
    pub const ALL: [SourceKind; 6] = [
        SourceKind::Pubchem,
        SourceKind::Chembl,
        SourceKind::Pubmed,
        SourceKind::Patents,
        SourceKind::Psychonaut,
        SourceKind::Wikipedia,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Pubchem => "pubchem",
            SourceKind::Chembl => "chembl",
            SourceKind::Pubmed => "pubmed",
            SourceKind::Patents => "patents",
            SourceKind::Psychonaut => "psychonaut",
            SourceKind::Wikipedia => "wikipedia",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = CollectorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        SourceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| CollectorError::UnknownSource(value.to_string()))
    }
}

/// The kind of identifier a compound carries, and hence the kind of query
/// a source can be addressed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
    Cas,
    Name,
    Smiles,
    InchiKey,
}

impl IdentifierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierKind::Cas => "cas",
            IdentifierKind::Name => "name",
            IdentifierKind::Smiles => "smiles",
            IdentifierKind::InchiKey => "inchikey",
        }
    }
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CasNumber(String);

impl CasNumber {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CasNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CasNumber {
    type Err = CollectorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        validate_identifier(IdentifierKind::Cas, normalized)
            .map_err(|reason| invalid(IdentifierKind::Cas, value, reason))?;
        Ok(Self(normalized.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InchiKey(String);

impl InchiKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InchiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InchiKey {
    type Err = CollectorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_uppercase();
        validate_identifier(IdentifierKind::InchiKey, &normalized)
            .map_err(|reason| invalid(IdentifierKind::InchiKey, value, reason))?;
        Ok(Self(normalized))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Smiles(String);

impl Smiles {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Smiles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Smiles {
    type Err = CollectorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        validate_identifier(IdentifierKind::Smiles, normalized)
            .map_err(|reason| invalid(IdentifierKind::Smiles, value, reason))?;
        Ok(Self(normalized.to_string()))
    }
}

fn invalid(kind: IdentifierKind, value: &str, reason: ValidationError) -> CollectorError {
    CollectorError::InvalidIdentifier {
        kind,
        value: value.to_string(),
        reason,
    }
}

/// One unvalidated input record, as handed over by the loader.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompoundQuery {
    #[serde(default)]
    pub cas: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub smiles: Option<String>,
    #[serde(default)]
    pub inchi_key: Option<String>,
}

impl CompoundQuery {
    pub fn with_cas(cas: &str) -> Self {
        Self {
            cas: Some(cas.to_string()),
            ..Self::default()
        }
    }

    pub fn with_name(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::default()
        }
    }

    fn entries(&self) -> [(IdentifierKind, Option<&str>); 4] {
        [
            (IdentifierKind::Cas, self.cas.as_deref()),
            (IdentifierKind::Name, self.name.as_deref()),
            (IdentifierKind::Smiles, self.smiles.as_deref()),
            (IdentifierKind::InchiKey, self.inchi_key.as_deref()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedIdentifier {
    pub kind: IdentifierKind,
    pub value: String,
    pub reason: ValidationError,
}

/// The identifiers of one compound that passed validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompoundIdentifiers {
    pub cas: Option<CasNumber>,
    pub name: Option<String>,
    pub smiles: Option<Smiles>,
    pub inchi_key: Option<InchiKey>,
}

impl CompoundIdentifiers {
    /// Splits a raw query into its valid identifiers and the rejected ones.
    /// Blank fields are ignored rather than rejected.
    pub fn from_query(query: &CompoundQuery) -> (Self, Vec<RejectedIdentifier>) {
        let mut identifiers = Self::default();
        let mut rejected = Vec::new();

        for (kind, value) in query.entries() {
            let Some(value) = value.map(str::trim).filter(|value| !value.is_empty()) else {
                continue;
            };
            let parsed = match kind {
                IdentifierKind::Cas => value.parse::<CasNumber>().map(|cas| identifiers.cas = Some(cas)),
                IdentifierKind::Name => validate_identifier(kind, value)
                    .map(|_| identifiers.name = Some(value.to_string()))
                    .map_err(|reason| invalid(kind, value, reason)),
                IdentifierKind::Smiles => {
                    value.parse::<Smiles>().map(|smiles| identifiers.smiles = Some(smiles))
                }
                IdentifierKind::InchiKey => value
                    .parse::<InchiKey>()
                    .map(|key| identifiers.inchi_key = Some(key)),
            };
            if let Err(CollectorError::InvalidIdentifier { reason, .. }) = parsed {
                rejected.push(RejectedIdentifier {
                    kind,
                    value: value.to_string(),
                    reason,
                });
            }
        }

        (identifiers, rejected)
    }

    pub fn get(&self, kind: IdentifierKind) -> Option<&str> {
        match kind {
            IdentifierKind::Cas => self.cas.as_ref().map(CasNumber::as_str),
            IdentifierKind::Name => self.name.as_deref(),
            IdentifierKind::Smiles => self.smiles.as_ref().map(Smiles::as_str),
            IdentifierKind::InchiKey => self.inchi_key.as_ref().map(InchiKey::as_str),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cas.is_none()
            && self.name.is_none()
            && self.smiles.is_none()
            && self.inchi_key.is_none()
    }

    /// Human-readable handle for logs and progress output.
    pub fn label(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.cas.as_ref().map(|cas| cas.to_string()))
            .or_else(|| self.inchi_key.as_ref().map(|key| key.to_string()))
            .or_else(|| self.smiles.as_ref().map(|smiles| smiles.to_string()))
            .unwrap_or_else(|| "<unidentified>".to_string())
    }
}

/// Normalized address of one source response: cache key and single-flight key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceQueryKey {
    pub source: SourceKind,
    pub query_type: IdentifierKind,
    pub identifier: String,
}

impl SourceQueryKey {
    pub fn new(source: SourceKind, query_type: IdentifierKind, identifier: &str) -> Self {
        let trimmed = identifier.trim();
        // SMILES is case-sensitive (aromatic vs aliphatic atoms).
        let identifier = match query_type {
            IdentifierKind::Smiles => trimmed.to_string(),
            _ => trimmed.to_lowercase(),
        };
        Self {
            source,
            query_type,
            identifier,
        }
    }
}

impl fmt::Display for SourceQueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.source, self.query_type, self.identifier)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_source_kind() {
        assert_eq!("PubChem".parse::<SourceKind>().unwrap(), SourceKind::Pubchem);
        let err = "scifinder".parse::<SourceKind>().unwrap_err();
        assert_matches!(err, CollectorError::UnknownSource(_));
    }

    #[test]
    fn inchikey_is_uppercased() {
        let key: InchiKey = "bsynrykfmdvcjf-uhfffaoysa-n".parse().unwrap();
        assert_eq!(key.as_str(), "BSYNRYKFMDVCJF-UHFFFAOYSA-N");
    }

    #[test]
    fn query_splits_valid_and_rejected() {
        let query = CompoundQuery {
            cas: Some("50-78-3".to_string()),
            name: Some(" Aspirin ".to_string()),
            smiles: Some("   ".to_string()),
            inchi_key: None,
        };
        let (ids, rejected) = CompoundIdentifiers::from_query(&query);
        assert_eq!(ids.name.as_deref(), Some("Aspirin"));
        assert!(ids.cas.is_none());
        assert!(ids.smiles.is_none());
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].reason, ValidationError::ChecksumMismatch);
    }

    #[test]
    fn query_key_normalization() {
        let a = SourceQueryKey::new(SourceKind::Pubchem, IdentifierKind::Name, "  Aspirin ");
        let b = SourceQueryKey::new(SourceKind::Pubchem, IdentifierKind::Name, "aspirin");
        assert_eq!(a, b);

        let c = SourceQueryKey::new(SourceKind::Pubchem, IdentifierKind::Smiles, "c1ccccc1");
        let d = SourceQueryKey::new(SourceKind::Pubchem, IdentifierKind::Smiles, "C1CCCCC1");
        assert_ne!(c, d);

        let e = SourceQueryKey::new(SourceKind::Chembl, IdentifierKind::Name, "aspirin");
        assert_ne!(a, e);
    }
}
