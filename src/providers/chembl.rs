use serde_json::{Value, json};

use crate::domain::{IdentifierKind, SourceKind};
use crate::error::TransportError;
use crate::model::{ActivityType, BindingRecord, Reference, SourceFields};
use crate::providers::http::{HttpTransport, build_query_url, json_number, json_string};
use crate::source::{CompoundSource, Pacer};

const BASE_URL: &str = "https://www.ebi.ac.uk/chembl/api/data";
const ACTIVITY_LIMIT: &str = "100";

/// Binding-affinity database: the molecule, its measured activities and its
/// mechanisms of action.
pub struct ChemblSource {
    http: HttpTransport,
}

impl ChemblSource {
    pub fn new(http: HttpTransport) -> Self {
        Self { http }
    }

    fn molecule_url(query_type: IdentifierKind, identifier: &str) -> String {
        match query_type {
            IdentifierKind::InchiKey => build_query_url(
                &format!("{BASE_URL}/molecule.json"),
                &[("molecule_structures__standard_inchi_key", identifier)],
            ),
            IdentifierKind::Smiles => build_query_url(
                &format!("{BASE_URL}/molecule.json"),
                &[("molecule_structures__canonical_smiles__flexmatch", identifier)],
            ),
            IdentifierKind::Name | IdentifierKind::Cas => build_query_url(
                &format!("{BASE_URL}/molecule/search.json"),
                &[("q", identifier), ("limit", "1")],
            ),
        }
    }

    fn list(&self, url: &str, field: &str) -> Result<Value, TransportError> {
        match self.http.get_json(url) {
            Ok(body) => Ok(body
                .get(field)
                .cloned()
                .unwrap_or(Value::Array(Vec::new()))),
            Err(TransportError::NotFound) => Ok(Value::Array(Vec::new())),
            Err(err) => Err(err),
        }
    }
}

impl CompoundSource for ChemblSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Chembl
    }

    fn query_types(&self) -> &[IdentifierKind] {
        &[
            IdentifierKind::InchiKey,
            IdentifierKind::Smiles,
            IdentifierKind::Name,
        ]
    }

    fn fetch(
        &self,
        query_type: IdentifierKind,
        identifier: &str,
        pacer: &Pacer<'_>,
    ) -> Result<Value, TransportError> {
        let body = self.http.get_json(&Self::molecule_url(query_type, identifier))?;
        let molecule = body
            .pointer("/molecules/0")
            .cloned()
            .ok_or(TransportError::NotFound)?;
        let Some(chembl_id) = molecule.get("molecule_chembl_id").and_then(json_string) else {
            return Ok(json!({ "molecule": molecule }));
        };

        pacer.pace()?;
        let activities = self.list(
            &build_query_url(
                &format!("{BASE_URL}/activity.json"),
                &[
                    ("molecule_chembl_id", chembl_id.as_str()),
                    ("standard_type__in", "Ki,IC50,Kd,EC50"),
                    ("limit", ACTIVITY_LIMIT),
                ],
            ),
            "activities",
        )?;

        pacer.pace()?;
        let mechanisms = self.list(
            &build_query_url(
                &format!("{BASE_URL}/mechanism.json"),
                &[("molecule_chembl_id", chembl_id.as_str())],
            ),
            "mechanisms",
        )?;

        Ok(json!({
            "molecule": molecule,
            "activities": activities,
            "mechanisms": mechanisms,
        }))
    }

    fn parse(&self, payload: &Value) -> Result<SourceFields, String> {
        parse_molecule(payload)
    }
}

pub fn parse_molecule(payload: &Value) -> Result<SourceFields, String> {
    let molecule = payload
        .get("molecule")
        .filter(|value| value.is_object())
        .ok_or_else(|| "missing molecule".to_string())?;

    let mut fields = SourceFields {
        smiles: molecule
            .pointer("/molecule_structures/canonical_smiles")
            .and_then(json_string),
        inchi: molecule
            .pointer("/molecule_structures/standard_inchi")
            .and_then(json_string),
        inchi_key: molecule
            .pointer("/molecule_structures/standard_inchi_key")
            .and_then(json_string),
        molecular_weight: molecule
            .pointer("/molecule_properties/full_mwt")
            .and_then(json_number),
        logp: molecule
            .pointer("/molecule_properties/alogp")
            .and_then(json_number),
        tpsa: molecule
            .pointer("/molecule_properties/psa")
            .and_then(json_number),
        ..SourceFields::default()
    };

    if let Some(name) = molecule.get("pref_name").and_then(json_string) {
        fields.names.push(name);
    }
    let synonyms = molecule
        .get("molecule_synonyms")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.get("molecule_synonym").and_then(json_string));
    for synonym in synonyms {
        if !fields
            .names
            .iter()
            .any(|name| name.eq_ignore_ascii_case(&synonym))
        {
            fields.names.push(synonym);
        }
    }

    if let Some(chembl_id) = molecule.get("molecule_chembl_id").and_then(json_string) {
        fields.references.push(Reference::url(format!(
            "https://www.ebi.ac.uk/chembl/compound_report_card/{chembl_id}/"
        )));
    }

    fields.activities = payload
        .get("activities")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(parse_activity)
        .collect();

    let mechanisms = payload
        .get("mechanisms")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|mechanism| mechanism.get("mechanism_of_action").and_then(json_string))
        .collect::<Vec<_>>();
    if !mechanisms.is_empty() {
        fields.pharmacology = Some(format!("Mechanism of action: {}", mechanisms.join("; ")));
    }

    Ok(fields)
}

/// Activities without a target, a recognized type or a numeric value are
/// skipped.
fn parse_activity(activity: &Value) -> Option<BindingRecord> {
    let activity_type = activity
        .get("standard_type")
        .and_then(Value::as_str)
        .and_then(ActivityType::parse)?;
    let value = activity.get("standard_value").and_then(json_number)?;
    let target_name = activity.get("target_pref_name").and_then(json_string)?;
    let reference = activity
        .get("document_chembl_id")
        .and_then(json_string)
        .map(|document| {
            Reference::url(format!(
                "https://www.ebi.ac.uk/chembl/document_report_card/{document}/"
            ))
        });
    Some(BindingRecord {
        target_name,
        organism: activity.get("target_organism").and_then(json_string),
        activity_type,
        value,
        unit: activity
            .get("standard_units")
            .and_then(json_string)
            .unwrap_or_else(|| "nM".to_string()),
        reference,
    })
}
