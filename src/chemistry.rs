use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::context::RunContext;
use crate::domain::IdentifierKind;
use crate::model::{Annotation, Compound, ConflictValue};
use crate::validate::{normalize_identifier, validate_identifier};

pub const ENGINE_PROVENANCE: &str = "chemistry-engine";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureInput<'a> {
    Smiles(&'a str),
    Inchi(&'a str),
}

impl StructureInput<'_> {
    pub fn as_str(&self) -> &str {
        match self {
            StructureInput::Smiles(value) | StructureInput::Inchi(value) => value,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StructureInfo {
    pub canonical_smiles: String,
    pub inchi: Option<String>,
    pub inchi_key: Option<String>,
    pub molecular_weight: Option<f64>,
    pub logp: Option<f64>,
    pub tpsa: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChemistryError {
    #[error("invalid structure: {0}")]
    InvalidStructure(String),
    #[error("chemistry engine unavailable: {0}")]
    Unavailable(String),
}

/// Structure canonicalization and descriptor computation. Implemented
/// outside the aggregation core.
pub trait ChemistryEngine: Send + Sync {
    fn canonicalize(
        &self,
        input: StructureInput<'_>,
        ctx: &RunContext,
    ) -> Result<StructureInfo, ChemistryError>;
}

/// Runs the engine over a merged compound: canonical SMILES replaces the
/// merged one, computed descriptors replace source-reported ones, missing
/// identifiers are filled in. Every value the engine writes is attributed to
/// it. A rejected structure is annotated and leaves every other field
/// untouched.
pub fn apply_structure(compound: &mut Compound, engine: &dyn ChemistryEngine, ctx: &RunContext) {
    let input = match (compound.smiles.as_deref(), compound.inchi.as_deref()) {
        (Some(smiles), _) => StructureInput::Smiles(smiles),
        (None, Some(inchi)) => StructureInput::Inchi(inchi),
        (None, None) => return,
    };

    let info = match engine.canonicalize(input, ctx) {
        Ok(info) => info,
        Err(ChemistryError::InvalidStructure(reason)) => {
            warn!(compound = %compound.input.label(), %reason, "structure rejected");
            compound
                .annotations
                .push(Annotation::StructureInvalid { reason });
            return;
        }
        Err(err @ ChemistryError::Unavailable(_)) => {
            warn!(compound = %compound.input.label(), error = %err, "structure not canonicalized");
            return;
        }
    };

    if !info.canonical_smiles.is_empty()
        && compound.smiles.as_deref() != Some(info.canonical_smiles.as_str())
    {
        compound.smiles = Some(info.canonical_smiles);
        compound
            .provenance
            .insert("smiles".to_string(), ENGINE_PROVENANCE.to_string());
    }
    if compound.inchi.is_none() && info.inchi.is_some() {
        compound.inchi = info.inchi;
        compound
            .provenance
            .insert("inchi".to_string(), ENGINE_PROVENANCE.to_string());
    }
    let computed_key = info.inchi_key.and_then(|key| {
        let normalized = normalize_identifier(IdentifierKind::InchiKey, &key);
        match validate_identifier(IdentifierKind::InchiKey, &normalized) {
            Ok(()) => Some(normalized),
            Err(reason) => {
                warn!(compound = %compound.input.label(), value = %key, "engine returned a malformed InChIKey");
                compound.annotations.push(Annotation::InvalidIdentifier {
                    source: ENGINE_PROVENANCE.to_string(),
                    identifier: IdentifierKind::InchiKey,
                    value: key,
                    reason,
                });
                None
            }
        }
    });
    match (compound.inchi_key.clone(), computed_key) {
        (None, Some(computed)) => {
            compound.inchi_key = Some(computed);
            compound
                .provenance
                .insert("inchi_key".to_string(), ENGINE_PROVENANCE.to_string());
        }
        (Some(merged), Some(computed)) if merged != computed => {
            let source = compound
                .provenance
                .get("inchi_key")
                .cloned()
                .unwrap_or_default();
            compound.annotations.push(Annotation::MergeConflict {
                field: "inchi_key".to_string(),
                accepted: merged.clone(),
                values: vec![
                    ConflictValue {
                        source,
                        value: merged,
                    },
                    ConflictValue {
                        source: ENGINE_PROVENANCE.to_string(),
                        value: computed,
                    },
                ],
            });
        }
        _ => {}
    }

    let computed = [
        ("molecular_weight", info.molecular_weight, &mut compound.molecular_weight),
        ("logp", info.logp, &mut compound.logp),
        ("tpsa", info.tpsa, &mut compound.tpsa),
    ];
    for (field, value, slot) in computed {
        if let Some(value) = value {
            *slot = Some(value);
            compound
                .provenance
                .insert(field.to_string(), ENGINE_PROVENANCE.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CompoundIdentifiers;
    use crate::error::ValidationError;
    use crate::model::CompoundStatus;

    struct FixedEngine(Result<StructureInfo, ChemistryError>);

    impl ChemistryEngine for FixedEngine {
        fn canonicalize(
            &self,
            _input: StructureInput<'_>,
            _ctx: &RunContext,
        ) -> Result<StructureInfo, ChemistryError> {
            self.0.clone()
        }
    }

    fn merged() -> Compound {
        let mut compound = Compound::unresolved(CompoundIdentifiers::default());
        compound.status = CompoundStatus::Resolved;
        compound.smiles = Some("OC(=O)c1ccccc1OC(C)=O".to_string());
        compound.logp = Some(1.0);
        compound
            .provenance
            .insert("smiles".to_string(), "pubchem".to_string());
        compound
    }

    fn aspirin_info() -> StructureInfo {
        StructureInfo {
            canonical_smiles: "CC(=O)OC1=CC=CC=C1C(=O)O".to_string(),
            inchi: Some("InChI=1S/C9H8O4/c1-6(10)13-8-5-3-2-4-7(8)9(11)12/h2-5H,1H3,(H,11,12)".to_string()),
            inchi_key: Some("BSYNRYKFMDVCJF-UHFFFAOYSA-N".to_string()),
            molecular_weight: Some(180.16),
            logp: Some(1.2),
            tpsa: Some(63.6),
        }
    }

    #[test]
    fn fills_identifiers_and_descriptors() {
        let ctx = RunContext::with_defaults();
        let mut compound = merged();
        apply_structure(&mut compound, &FixedEngine(Ok(aspirin_info())), &ctx);

        assert_eq!(compound.smiles.as_deref(), Some("CC(=O)OC1=CC=CC=C1C(=O)O"));
        assert_eq!(compound.inchi_key.as_deref(), Some("BSYNRYKFMDVCJF-UHFFFAOYSA-N"));
        assert_eq!(compound.logp, Some(1.2));
        assert_eq!(compound.provenance["logp"], ENGINE_PROVENANCE);
        assert_eq!(compound.provenance["smiles"], ENGINE_PROVENANCE);
        assert_eq!(compound.provenance["inchi_key"], ENGINE_PROVENANCE);
        assert!(compound.annotations.is_empty());
    }

    #[test]
    fn unchanged_smiles_keeps_its_source() {
        let ctx = RunContext::with_defaults();
        let mut compound = merged();
        compound.smiles = Some("CC(=O)OC1=CC=CC=C1C(=O)O".to_string());
        apply_structure(&mut compound, &FixedEngine(Ok(aspirin_info())), &ctx);
        assert_eq!(compound.provenance["smiles"], "pubchem");
    }

    #[test]
    fn computed_inchikey_is_normalized_and_validated() {
        let ctx = RunContext::with_defaults();
        let mut compound = merged();
        let lowercase = StructureInfo {
            inchi_key: Some(" bsynrykfmdvcjf-uhfffaoysa-n ".to_string()),
            ..aspirin_info()
        };
        apply_structure(&mut compound, &FixedEngine(Ok(lowercase)), &ctx);
        assert_eq!(compound.inchi_key.as_deref(), Some("BSYNRYKFMDVCJF-UHFFFAOYSA-N"));

        let mut compound = merged();
        let malformed = StructureInfo {
            inchi_key: Some("not-a-key".to_string()),
            ..aspirin_info()
        };
        apply_structure(&mut compound, &FixedEngine(Ok(malformed)), &ctx);
        assert_eq!(compound.inchi_key, None);
        assert!(!compound.provenance.contains_key("inchi_key"));
        assert_eq!(
            compound.annotations,
            vec![Annotation::InvalidIdentifier {
                source: ENGINE_PROVENANCE.to_string(),
                identifier: IdentifierKind::InchiKey,
                value: "not-a-key".to_string(),
                reason: ValidationError::InvalidFormat,
            }]
        );
    }

    #[test]
    fn differing_inchikey_is_flagged() {
        let ctx = RunContext::with_defaults();
        let mut compound = merged();
        compound.inchi_key = Some("AAAAAAAAAAAAAA-UHFFFAOYSA-N".to_string());
        apply_structure(&mut compound, &FixedEngine(Ok(aspirin_info())), &ctx);

        assert_eq!(compound.inchi_key.as_deref(), Some("AAAAAAAAAAAAAA-UHFFFAOYSA-N"));
        assert!(matches!(
            &compound.annotations[..],
            [Annotation::MergeConflict { field, .. }] if field == "inchi_key"
        ));
    }

    #[test]
    fn invalid_structure_keeps_other_fields() {
        let ctx = RunContext::with_defaults();
        let mut compound = merged();
        let engine = FixedEngine(Err(ChemistryError::InvalidStructure("valence".to_string())));
        apply_structure(&mut compound, &engine, &ctx);

        assert_eq!(compound.smiles.as_deref(), Some("OC(=O)c1ccccc1OC(C)=O"));
        assert_eq!(compound.logp, Some(1.0));
        assert_eq!(
            compound.annotations,
            vec![Annotation::StructureInvalid {
                reason: "valence".to_string()
            }]
        );
    }

    #[test]
    fn nothing_to_canonicalize() {
        let ctx = RunContext::with_defaults();
        let mut compound = Compound::unresolved(CompoundIdentifiers::default());
        let engine = FixedEngine(Err(ChemistryError::InvalidStructure("unused".to_string())));
        apply_structure(&mut compound, &engine, &ctx);
        assert!(compound.annotations.is_empty());
    }
}
