use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{CompoundIdentifiers, IdentifierKind, RejectedIdentifier, SourceKind};
use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ActivityType {
    Ki,
    #[serde(rename = "IC50")]
    Ic50,
    Kd,
    #[serde(rename = "EC50")]
    Ec50,
}

impl ActivityType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "KI" => Some(ActivityType::Ki),
            "IC50" => Some(ActivityType::Ic50),
            "KD" => Some(ActivityType::Kd),
            "EC50" => Some(ActivityType::Ec50),
            _ => None,
        }
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivityType::Ki => write!(f, "Ki"),
            ActivityType::Ic50 => write!(f, "IC50"),
            ActivityType::Kd => write!(f, "Kd"),
            ActivityType::Ec50 => write!(f, "EC50"),
        }
    }
}

/// One literature/patent/database pointer. At least one field is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubmed_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patent_number: Option<String>,
}

impl Reference {
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn pubmed(pmid: impl Into<String>) -> Self {
        Self {
            pubmed_id: Some(pmid.into()),
            ..Self::default()
        }
    }

    pub fn patent(number: impl Into<String>) -> Self {
        Self {
            patent_number: Some(number.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dedup_key().is_none()
    }

    /// Every identity this reference is known by, strongest first: doi,
    /// PubMed id, patent number, url. Two references are the same when any
    /// of these match.
    pub fn dedup_keys(&self) -> Vec<String> {
        let normalized = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_lowercase)
        };
        [
            normalized(&self.doi).map(|doi| format!("doi:{doi}")),
            normalized(&self.pubmed_id).map(|id| format!("pmid:{id}")),
            normalized(&self.patent_number)
                .map(|number| format!("patent:{}", number.replace(['-', ' '], ""))),
            normalized(&self.url).map(|url| format!("url:{}", url.trim_end_matches('/'))),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// The strongest identity, used inside binding-record keys.
    pub fn dedup_key(&self) -> Option<String> {
        self.dedup_keys().into_iter().next()
    }

    pub fn render(&self) -> String {
        if let Some(doi) = &self.doi {
            return format!("doi:{doi}");
        }
        if let Some(pmid) = &self.pubmed_id {
            return format!("pmid:{pmid}");
        }
        if let Some(number) = &self.patent_number {
            return format!("patent:{number}");
        }
        self.url.clone().unwrap_or_default()
    }
}

/// One binding-affinity measurement. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingRecord {
    pub target_name: String,
    pub organism: Option<String>,
    pub activity_type: ActivityType,
    pub value: f64,
    pub unit: String,
    pub reference: Option<Reference>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingKey {
    target: String,
    organism: String,
    activity_type: ActivityType,
    value_bits: u64,
    reference: String,
}

impl BindingRecord {
    pub fn key(&self) -> BindingKey {
        BindingKey {
            target: self.target_name.trim().to_lowercase(),
            organism: self
                .organism
                .as_deref()
                .map(|organism| organism.trim().to_lowercase())
                .unwrap_or_default(),
            activity_type: self.activity_type,
            // -0.0 and 0.0 compare equal as measurements
            value_bits: (self.value + 0.0).to_bits(),
            reference: self
                .reference
                .as_ref()
                .and_then(Reference::dedup_key)
                .unwrap_or_default(),
        }
    }

    /// `target|organism|type|value unit|reference` for the tabular export.
    pub fn render(&self) -> String {
        format!(
            "{}|{}|{}|{} {}|{}",
            self.target_name,
            self.organism.as_deref().unwrap_or(""),
            self.activity_type,
            self.value,
            self.unit,
            self.reference.as_ref().map(Reference::render).unwrap_or_default()
        )
    }
}

/// Free text that is never overwritten, only accumulated per source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributedText {
    pub source: String,
    pub text: String,
}

/// Source-agnostic shape a source response is parsed into.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceFields {
    pub cas: Option<String>,
    pub names: Vec<String>,
    pub smiles: Option<String>,
    pub inchi: Option<String>,
    pub inchi_key: Option<String>,
    pub molecular_weight: Option<f64>,
    pub logp: Option<f64>,
    pub tpsa: Option<f64>,
    pub activities: Vec<BindingRecord>,
    pub legal_status: Option<String>,
    pub pharmacology: Option<String>,
    pub references: Vec<Reference>,
}

impl SourceFields {
    pub fn is_empty(&self) -> bool {
        self.cas.is_none()
            && self.names.is_empty()
            && self.smiles.is_none()
            && self.inchi.is_none()
            && self.inchi_key.is_none()
            && self.molecular_weight.is_none()
            && self.logp.is_none()
            && self.tpsa.is_none()
            && self.activities.is_empty()
            && self.legal_status.is_none()
            && self.pharmacology.is_none()
            && self.references.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub source: SourceKind,
    pub retrieved_at: DateTime<Utc>,
    pub query_type: IdentifierKind,
    pub from_cache: bool,
    pub fields: SourceFields,
}

/// What one enabled source contributed to one compound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceStatus {
    Contributed,
    NoData,
    NotApplicable,
    Failed { code: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source: SourceKind,
    #[serde(flatten)]
    pub status: SourceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictValue {
    pub source: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Annotation {
    MergeConflict {
        field: String,
        accepted: String,
        values: Vec<ConflictValue>,
    },
    StructureInvalid {
        reason: String,
    },
    /// `source` is `input` for a rejected input field, otherwise the source
    /// whose value was dropped during the merge.
    InvalidIdentifier {
        source: String,
        identifier: IdentifierKind,
        value: String,
        reason: ValidationError,
    },
}

impl Annotation {
    pub fn render(&self) -> String {
        match self {
            Annotation::MergeConflict { field, values, .. } => {
                let values = values
                    .iter()
                    .map(|value| format!("{}={}", value.source, value.value))
                    .collect::<Vec<_>>()
                    .join(",");
                format!("conflict:{field}[{values}]")
            }
            Annotation::StructureInvalid { reason } => format!("structure_invalid:{reason}"),
            Annotation::InvalidIdentifier {
                source,
                identifier,
                value,
                ..
            } => format!("invalid_identifier:{source}:{identifier}={value}"),
        }
    }
}

impl From<RejectedIdentifier> for Annotation {
    fn from(rejected: RejectedIdentifier) -> Self {
        Annotation::InvalidIdentifier {
            source: "input".to_string(),
            identifier: rejected.kind,
            value: rejected.value,
            reason: rejected.reason,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompoundStatus {
    Resolved,
    Unresolved,
}

/// The canonical aggregated record for one input compound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compound {
    pub input: CompoundIdentifiers,
    pub status: CompoundStatus,
    pub cas: Option<String>,
    pub name: Option<String>,
    pub synonyms: Vec<String>,
    pub smiles: Option<String>,
    pub inchi: Option<String>,
    pub inchi_key: Option<String>,
    pub molecular_weight: Option<f64>,
    pub logp: Option<f64>,
    pub tpsa: Option<f64>,
    pub activity_records: Vec<BindingRecord>,
    pub legal_status: Vec<AttributedText>,
    pub pharmacology_notes: Vec<AttributedText>,
    pub references: Vec<Reference>,
    pub provenance: BTreeMap<String, String>,
    pub annotations: Vec<Annotation>,
    pub sources: Vec<SourceReport>,
}

impl Compound {
    pub fn unresolved(input: CompoundIdentifiers) -> Self {
        Self {
            input,
            status: CompoundStatus::Unresolved,
            cas: None,
            name: None,
            synonyms: Vec::new(),
            smiles: None,
            inchi: None,
            inchi_key: None,
            molecular_weight: None,
            logp: None,
            tpsa: None,
            activity_records: Vec::new(),
            legal_status: Vec::new(),
            pharmacology_notes: Vec::new(),
            references: Vec::new(),
            provenance: BTreeMap::new(),
            annotations: Vec::new(),
            sources: Vec::new(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status == CompoundStatus::Resolved
    }

    pub fn contributing_sources(&self) -> Vec<SourceKind> {
        self.sources
            .iter()
            .filter(|report| report.status == SourceStatus::Contributed)
            .map(|report| report.source)
            .collect()
    }
}

/// Flat, export-ready view of a [`Compound`]. Multi-valued cells are joined
/// with `;`, activity sub-fields with `|`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompoundRow {
    pub status: String,
    pub cas: String,
    pub name: String,
    pub synonyms: String,
    pub smiles: String,
    pub inchi: String,
    pub inchi_key: String,
    pub molecular_weight: String,
    pub logp: String,
    pub tpsa: String,
    pub activities: String,
    pub legal_status: String,
    pub pharmacology_notes: String,
    pub references: String,
    pub provenance: String,
}

impl CompoundRow {
    pub const HEADERS: [&'static str; 15] = [
        "status",
        "cas",
        "name",
        "synonyms",
        "smiles",
        "inchi",
        "inchi_key",
        "molecular_weight",
        "logp",
        "tpsa",
        "activities",
        "legal_status",
        "pharmacology_notes",
        "references",
        "provenance",
    ];

    pub fn from_compound(compound: &Compound, max_activities: usize) -> Self {
        let text = |value: &Option<String>| value.clone().unwrap_or_default();
        let number = |value: Option<f64>| value.map(|v| format!("{v:.3}")).unwrap_or_default();
        let attributed = |items: &[AttributedText]| {
            items
                .iter()
                .map(|item| format!("[{}] {}", item.source, item.text))
                .collect::<Vec<_>>()
                .join(" ")
        };

        let mut provenance = compound
            .provenance
            .iter()
            .map(|(field, source)| format!("{field}={source}"))
            .collect::<Vec<_>>();
        let failed = compound
            .sources
            .iter()
            .filter_map(|report| match &report.status {
                SourceStatus::Failed { code, .. } => Some(format!("failed:{}={code}", report.source)),
                _ => None,
            });
        provenance.extend(failed);
        provenance.extend(compound.annotations.iter().map(Annotation::render));

        Self {
            status: match compound.status {
                CompoundStatus::Resolved => "resolved".to_string(),
                CompoundStatus::Unresolved => "unresolved".to_string(),
            },
            cas: text(&compound.cas),
            name: text(&compound.name),
            synonyms: compound.synonyms.join(";"),
            smiles: text(&compound.smiles),
            inchi: text(&compound.inchi),
            inchi_key: text(&compound.inchi_key),
            molecular_weight: number(compound.molecular_weight),
            logp: number(compound.logp),
            tpsa: number(compound.tpsa),
            activities: compound
                .activity_records
                .iter()
                .take(max_activities)
                .map(BindingRecord::render)
                .collect::<Vec<_>>()
                .join(";"),
            legal_status: attributed(&compound.legal_status),
            pharmacology_notes: attributed(&compound.pharmacology_notes),
            references: compound
                .references
                .iter()
                .map(Reference::render)
                .collect::<Vec<_>>()
                .join(";"),
            provenance: provenance.join(";"),
        }
    }

    pub fn cells(&self) -> [&str; 15] {
        [
            self.status.as_str(),
            self.cas.as_str(),
            self.name.as_str(),
            self.synonyms.as_str(),
            self.smiles.as_str(),
            self.inchi.as_str(),
            self.inchi_key.as_str(),
            self.molecular_weight.as_str(),
            self.logp.as_str(),
            self.tpsa.as_str(),
            self.activities.as_str(),
            self.legal_status.as_str(),
            self.pharmacology_notes.as_str(),
            self.references.as_str(),
            self.provenance.as_str(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ki(target: &str, value: f64, pmid: &str) -> BindingRecord {
        BindingRecord {
            target_name: target.to_string(),
            organism: Some("Homo sapiens".to_string()),
            activity_type: ActivityType::Ki,
            value,
            unit: "nM".to_string(),
            reference: Some(Reference::pubmed(pmid)),
        }
    }

    #[test]
    fn binding_key_ignores_case_and_whitespace() {
        let a = ki("5-HT2A", 1.5, "123");
        let mut b = ki(" 5-ht2a ", 1.5, "123");
        b.organism = Some("homo sapiens".to_string());
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), ki("5-HT2A", 1.6, "123").key());
        assert_ne!(a.key(), ki("5-HT2A", 1.5, "124").key());
    }

    #[test]
    fn reference_dedup_prefers_doi() {
        let a = Reference {
            doi: Some("10.1000/ABC".to_string()),
            url: Some("https://a.example".to_string()),
            ..Reference::default()
        };
        let b = Reference {
            doi: Some("10.1000/abc".to_string()),
            url: Some("https://b.example".to_string()),
            ..Reference::default()
        };
        assert_eq!(a.dedup_key(), b.dedup_key());
        assert_eq!(
            Reference::patent("US-1234567-A").dedup_key(),
            Reference::patent("US1234567A").dedup_key()
        );
        assert!(Reference::default().is_empty());
    }

    #[test]
    fn reference_keys_cover_every_identifier() {
        let both = Reference {
            doi: Some("10.1000/xyz".to_string()),
            pubmed_id: Some("8527543".to_string()),
            ..Reference::default()
        };
        assert_eq!(both.dedup_keys(), vec!["doi:10.1000/xyz", "pmid:8527543"]);
        assert_eq!(both.dedup_key().as_deref(), Some("doi:10.1000/xyz"));
        assert!(Reference::default().dedup_keys().is_empty());
    }

    #[test]
    fn row_truncates_activities() {
        let mut compound = Compound::unresolved(CompoundIdentifiers::default());
        compound.activity_records = vec![ki("A", 1.0, "1"), ki("B", 2.0, "2"), ki("C", 3.0, "3")];
        compound
            .provenance
            .insert("smiles".to_string(), "pubchem".to_string());
        let row = CompoundRow::from_compound(&compound, 2);
        assert_eq!(row.activities.split(';').count(), 2);
        assert_eq!(row.status, "unresolved");
        assert_eq!(row.provenance, "smiles=pubchem");
        assert!(row.activities.starts_with("A|Homo sapiens|Ki|1 nM|pmid:1"));
    }
}
