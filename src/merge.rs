use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::domain::{CompoundIdentifiers, IdentifierKind, SourceKind};
use crate::error::SourceError;
use crate::model::{
    Annotation, AttributedText, Compound, CompoundStatus, ConflictValue, SourceFields,
    SourceRecord, SourceReport, SourceStatus,
};
use crate::validate::{normalize_identifier, validate_identifier};

pub const INPUT_PROVENANCE: &str = "input";

/// What one source produced for one compound.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceOutcome {
    Record(SourceRecord),
    NotApplicable(SourceKind),
    Failed(SourceKind, SourceError),
}

impl SourceOutcome {
    pub fn source(&self) -> SourceKind {
        match self {
            SourceOutcome::Record(record) => record.source,
            SourceOutcome::NotApplicable(source) | SourceOutcome::Failed(source, _) => *source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SourceOutcome::Failed(_, SourceError::Cancelled))
    }

    fn report(&self) -> SourceReport {
        let status = match self {
            SourceOutcome::Record(record) if record.fields.is_empty() => SourceStatus::NoData,
            SourceOutcome::Record(_) => SourceStatus::Contributed,
            SourceOutcome::NotApplicable(_) => SourceStatus::NotApplicable,
            SourceOutcome::Failed(_, SourceError::NotFound(_)) => SourceStatus::NoData,
            SourceOutcome::Failed(_, err) => SourceStatus::Failed {
                code: err.code().to_string(),
                reason: err.to_string(),
            },
        };
        SourceReport {
            source: self.source(),
            status,
        }
    }
}

/// Combines per-source records into one [`Compound`]. The result depends
/// only on the set of outcomes, never on their arrival order.
#[derive(Debug, Clone)]
pub struct Merger {
    priority: Vec<SourceKind>,
}

impl Default for Merger {
    fn default() -> Self {
        Self::new(SourceKind::ALL.to_vec())
    }
}

impl Merger {
    /// Sources missing from `priority` rank after the listed ones.
    pub fn new(priority: Vec<SourceKind>) -> Self {
        Self { priority }
    }

    fn rank(&self, source: SourceKind) -> (usize, SourceKind) {
        let position = self
            .priority
            .iter()
            .position(|listed| *listed == source)
            .unwrap_or(self.priority.len());
        (position, source)
    }

    pub fn merge(&self, input: &CompoundIdentifiers, mut outcomes: Vec<SourceOutcome>) -> Compound {
        outcomes.sort_by_key(|outcome| self.rank(outcome.source()));

        let mut compound = Compound::unresolved(input.clone());
        compound.sources = outcomes.iter().map(SourceOutcome::report).collect();
        compound.sources.sort_by_key(|report| report.source);

        let records: Vec<&SourceRecord> = outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                SourceOutcome::Record(record) if !record.fields.is_empty() => Some(record),
                _ => None,
            })
            .collect();
        if !records.is_empty() {
            compound.status = CompoundStatus::Resolved;
        }

        let cas = candidates(input.get(IdentifierKind::Cas), &records, |f| f.cas.as_deref());
        let cas = valid_candidates(&mut compound, IdentifierKind::Cas, cas);
        compound.cas = resolve_scalar(&mut compound, "cas", cas, |v| v.to_string());
        let smiles = candidates(input.get(IdentifierKind::Smiles), &records, |f| f.smiles.as_deref());
        compound.smiles = resolve_scalar(&mut compound, "smiles", smiles, |v| v.trim().to_string());
        let inchi = candidates(None, &records, |f| f.inchi.as_deref());
        compound.inchi = resolve_scalar(&mut compound, "inchi", inchi, |v| v.trim().to_string());
        let inchi_key =
            candidates(input.get(IdentifierKind::InchiKey), &records, |f| f.inchi_key.as_deref());
        let inchi_key = valid_candidates(&mut compound, IdentifierKind::InchiKey, inchi_key);
        compound.inchi_key = resolve_scalar(&mut compound, "inchi_key", inchi_key, |v| v.to_string());

        let numeric_fields: [(&str, fn(&SourceRecord) -> Option<f64>); 3] = [
            ("molecular_weight", |r| r.fields.molecular_weight),
            ("logp", |r| r.fields.logp),
            ("tpsa", |r| r.fields.tpsa),
        ];
        for (field, extract) in numeric_fields {
            let first = records
                .iter()
                .find_map(|record| extract(*record).map(|value| (record.source, value)));
            if let Some((source, value)) = first {
                compound
                    .provenance
                    .insert(field.to_string(), source.to_string());
                match field {
                    "molecular_weight" => compound.molecular_weight = Some(value),
                    "logp" => compound.logp = Some(value),
                    _ => compound.tpsa = Some(value),
                }
            }
        }

        let names = rank_names(input.name.as_deref(), &records);
        if let Some((name, source)) = names.first() {
            compound.name = Some(name.clone());
            compound
                .provenance
                .insert("name".to_string(), source.clone());
        }
        compound.synonyms = names.into_iter().skip(1).map(|(name, _)| name).collect();

        let mut seen_activities = HashSet::new();
        let mut seen_references = HashSet::new();
        for record in &records {
            for activity in &record.fields.activities {
                if seen_activities.insert(activity.key()) {
                    compound.activity_records.push(activity.clone());
                }
            }
            let references = record
                .fields
                .references
                .iter()
                .chain(record.fields.activities.iter().filter_map(|a| a.reference.as_ref()));
            for reference in references {
                let keys = reference.dedup_keys();
                if keys.is_empty() {
                    continue;
                }
                let duplicate = keys.iter().any(|key| seen_references.contains(key));
                seen_references.extend(keys);
                if !duplicate {
                    compound.references.push(reference.clone());
                }
            }
            let source = record.source.to_string();
            push_text(&mut compound.legal_status, &source, record.fields.legal_status.as_deref());
            push_text(
                &mut compound.pharmacology_notes,
                &source,
                record.fields.pharmacology.as_deref(),
            );
        }

        compound
    }
}

/// Input value first, then source values in priority order.
fn candidates(
    seed: Option<&str>,
    records: &[&SourceRecord],
    extract: impl Fn(&SourceFields) -> Option<&str>,
) -> Vec<(String, String)> {
    seed.map(|value| (INPUT_PROVENANCE.to_string(), value.to_string()))
        .into_iter()
        .chain(records.iter().filter_map(|record| {
            extract(&record.fields)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(|value| (record.source.to_string(), value.to_string()))
        }))
        .collect()
}

/// Normalizes identifier candidates and drops those that fail validation.
/// Every dropped value is kept as an annotation naming its source.
fn valid_candidates(
    compound: &mut Compound,
    kind: IdentifierKind,
    candidates: Vec<(String, String)>,
) -> Vec<(String, String)> {
    candidates
        .into_iter()
        .filter_map(|(source, value)| {
            let normalized = normalize_identifier(kind, &value);
            match validate_identifier(kind, &normalized) {
                Ok(()) => Some((source, normalized)),
                Err(reason) => {
                    debug!(%source, identifier = %kind, %value, %reason, "dropping invalid identifier");
                    compound.annotations.push(Annotation::InvalidIdentifier {
                        source,
                        identifier: kind,
                        value,
                        reason,
                    });
                    None
                }
            }
        })
        .collect()
}

/// First candidate wins; any disagreement on the normalized value is kept
/// as a conflict annotation listing every candidate.
fn resolve_scalar(
    compound: &mut Compound,
    field: &str,
    candidates: Vec<(String, String)>,
    normalize: fn(&str) -> String,
) -> Option<String> {
    let (source, accepted) = candidates.first()?.clone();
    let distinct = candidates
        .iter()
        .map(|(_, value)| normalize(value))
        .collect::<HashSet<_>>();
    if distinct.len() > 1 {
        compound.annotations.push(Annotation::MergeConflict {
            field: field.to_string(),
            accepted: accepted.clone(),
            values: candidates
                .into_iter()
                .map(|(source, value)| ConflictValue { source, value })
                .collect(),
        });
    }
    compound.provenance.insert(field.to_string(), source);
    Some(accepted)
}

/// Union of all names, most frequently reported first; ties go to the name
/// seen first in priority order. Spelling follows the first occurrence.
fn rank_names(input_name: Option<&str>, records: &[&SourceRecord]) -> Vec<(String, String)> {
    struct Tally {
        spelling: String,
        source: String,
        count: usize,
        first_seen: usize,
    }

    let mut tallies: HashMap<String, Tally> = HashMap::new();
    let mut order = 0usize;
    let mut add = |name: &str, source: &str, voters: &mut HashSet<String>| {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return;
        }
        let key = trimmed.to_lowercase();
        // one vote per source per name
        if !voters.insert(key.clone()) {
            return;
        }
        order += 1;
        let first_seen = order;
        tallies
            .entry(key)
            .and_modify(|tally| tally.count += 1)
            .or_insert_with(|| Tally {
                spelling: trimmed.to_string(),
                source: source.to_string(),
                count: 1,
                first_seen,
            });
    };

    if let Some(name) = input_name {
        add(name, INPUT_PROVENANCE, &mut HashSet::new());
    }
    for record in records {
        let mut voters = HashSet::new();
        let source = record.source.to_string();
        for name in &record.fields.names {
            add(name, &source, &mut voters);
        }
    }

    let mut ranked = tallies.into_values().collect::<Vec<_>>();
    ranked.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then(a.first_seen.cmp(&b.first_seen))
            .then_with(|| a.spelling.cmp(&b.spelling))
    });
    ranked
        .into_iter()
        .map(|tally| (tally.spelling, tally.source))
        .collect()
}

fn push_text(target: &mut Vec<AttributedText>, source: &str, text: Option<&str>) {
    let Some(text) = text.map(str::trim).filter(|text| !text.is_empty()) else {
        return;
    };
    if target.iter().any(|item| item.source == source && item.text == text) {
        return;
    }
    target.push(AttributedText {
        source: source.to_string(),
        text: text.to_string(),
    });
}
