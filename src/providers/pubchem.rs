use serde_json::{Value, json};
use tracing::debug;

use crate::chemistry::{ChemistryEngine, ChemistryError, StructureInfo, StructureInput};
use crate::context::RunContext;
use crate::domain::{CasNumber, IdentifierKind, SourceKind};
use crate::error::TransportError;
use crate::model::{Reference, SourceFields};
use crate::providers::http::{
    HttpTransport, build_query_url, encode_url_component, json_number, json_string,
};
use crate::source::{CompoundSource, Pacer};

const BASE_URL: &str = "https://pubchem.ncbi.nlm.nih.gov/rest/pug/compound";
const PROPERTIES: &str =
    "Title,IsomericSMILES,CanonicalSMILES,SMILES,InChI,InChIKey,MolecularWeight,XLogP,TPSA";
const MAX_SYNONYMS: usize = 15;

/// PubChem PUG-REST lookup URL for one identifier, `suffix` being the
/// operation path (e.g. `property/.../JSON`).
pub fn lookup_url(query_type: IdentifierKind, identifier: &str, suffix: &str) -> String {
    match query_type {
        IdentifierKind::InchiKey => format!(
            "{BASE_URL}/inchikey/{}/{suffix}",
            encode_url_component(identifier)
        ),
        // CAS numbers are registered as synonyms
        IdentifierKind::Cas | IdentifierKind::Name => format!(
            "{BASE_URL}/name/{}/{suffix}",
            encode_url_component(identifier)
        ),
        IdentifierKind::Smiles => build_query_url(
            &format!("{BASE_URL}/smiles/{suffix}"),
            &[("smiles", identifier)],
        ),
    }
}

/// Structure database: identifiers, computed properties and synonyms.
pub struct PubChemSource {
    http: HttpTransport,
}

impl PubChemSource {
    pub fn new(http: HttpTransport) -> Self {
        Self { http }
    }
}

impl CompoundSource for PubChemSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Pubchem
    }

    fn query_types(&self) -> &[IdentifierKind] {
        &[
            IdentifierKind::InchiKey,
            IdentifierKind::Cas,
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
        let url = lookup_url(query_type, identifier, &format!("property/{PROPERTIES}/JSON"));
        let table = self.http.get_json(&url)?;
        let properties = table
            .pointer("/PropertyTable/Properties/0")
            .cloned()
            .ok_or(TransportError::NotFound)?;

        let synonyms = match properties.get("CID").and_then(Value::as_u64) {
            Some(cid) => {
                pacer.pace()?;
                let url = format!("{BASE_URL}/cid/{cid}/synonyms/JSON");
                match self.http.get_json(&url) {
                    Ok(body) => body
                        .pointer("/InformationList/Information/0/Synonym")
                        .cloned()
                        .unwrap_or(Value::Array(Vec::new())),
                    Err(TransportError::NotFound) => Value::Array(Vec::new()),
                    Err(err) => return Err(err),
                }
            }
            None => Value::Array(Vec::new()),
        };

        Ok(json!({ "properties": properties, "synonyms": synonyms }))
    }

    fn parse(&self, payload: &Value) -> Result<SourceFields, String> {
        parse_compound(payload)
    }
}

pub fn parse_compound(payload: &Value) -> Result<SourceFields, String> {
    let properties = payload
        .get("properties")
        .filter(|value| value.is_object())
        .ok_or_else(|| "missing properties".to_string())?;

    let mut fields = SourceFields {
        smiles: ["IsomericSMILES", "SMILES", "CanonicalSMILES"]
            .iter()
            .find_map(|key| properties.get(*key).and_then(json_string)),
        inchi: properties.get("InChI").and_then(json_string),
        inchi_key: properties.get("InChIKey").and_then(json_string),
        molecular_weight: properties.get("MolecularWeight").and_then(json_number),
        logp: properties.get("XLogP").and_then(json_number),
        tpsa: properties.get("TPSA").and_then(json_number),
        ..SourceFields::default()
    };

    if let Some(title) = properties.get("Title").and_then(json_string) {
        fields.names.push(title);
    }
    let synonyms = payload
        .get("synonyms")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for synonym in synonyms.iter().filter_map(json_string) {
        if synonym.parse::<CasNumber>().is_ok() {
            if fields.cas.is_none() {
                fields.cas = Some(synonym);
            }
        } else if fields.names.len() < MAX_SYNONYMS
            && !fields
                .names
                .iter()
                .any(|name| name.eq_ignore_ascii_case(&synonym))
        {
            fields.names.push(synonym);
        }
    }

    if let Some(cid) = properties.get("CID").and_then(Value::as_u64) {
        fields.references.push(Reference::url(format!(
            "https://pubchem.ncbi.nlm.nih.gov/compound/{cid}"
        )));
    }
    Ok(fields)
}

/// Canonicalizes structures through PubChem, sharing the run's PubChem rate
/// limit and circuit breaker.
pub struct PubChemStructureService {
    http: HttpTransport,
}

impl PubChemStructureService {
    pub fn new(http: HttpTransport) -> Self {
        Self { http }
    }

    fn request(&self, input: StructureInput<'_>) -> Result<Value, TransportError> {
        let suffix = "property/CanonicalSMILES,SMILES,InChI,InChIKey,MolecularWeight,XLogP,TPSA/JSON";
        let (namespace, value) = match input {
            StructureInput::Smiles(smiles) => ("smiles", smiles),
            StructureInput::Inchi(inchi) => ("inchi", inchi),
        };
        let url = build_query_url(&format!("{BASE_URL}/{namespace}/{suffix}"), &[(namespace, value)]);
        self.http.get_json(&url)
    }
}

impl ChemistryEngine for PubChemStructureService {
    fn canonicalize(
        &self,
        input: StructureInput<'_>,
        ctx: &RunContext,
    ) -> Result<StructureInfo, ChemistryError> {
        let source = SourceKind::Pubchem;
        if !ctx.limiter.acquire_until_cancelled(source, &ctx.cancel) {
            return Err(ChemistryError::Unavailable("cancelled".to_string()));
        }
        let breaker = ctx.breaker(source);
        if let Some(breaker) = breaker {
            breaker
                .try_acquire()
                .map_err(|err| ChemistryError::Unavailable(err.to_string()))?;
        }

        debug!(structure = input.as_str(), "canonicalizing");
        let result = self.request(input);
        match (&result, breaker) {
            (Err(TransportError::Transient(_)), Some(breaker)) => breaker.record_failure(),
            (Err(TransportError::Cancelled), Some(breaker)) => breaker.release(),
            (_, Some(breaker)) => breaker.record_success(),
            (_, None) => {}
        }

        match result {
            Ok(table) => parse_structure(&table).map_err(ChemistryError::Unavailable),
            // PUG-REST answers 400/404 for structures it cannot parse
            Err(TransportError::NotFound) => Err(ChemistryError::InvalidStructure(format!(
                "PubChem cannot interpret {}",
                input.as_str()
            ))),
            Err(TransportError::Permanent(reason)) => Err(ChemistryError::InvalidStructure(reason)),
            Err(err) => Err(ChemistryError::Unavailable(err.to_string())),
        }
    }
}

pub fn parse_structure(table: &Value) -> Result<StructureInfo, String> {
    let properties = table
        .pointer("/PropertyTable/Properties/0")
        .ok_or_else(|| "missing property table".to_string())?;
    let canonical_smiles = ["CanonicalSMILES", "SMILES"]
        .iter()
        .find_map(|key| properties.get(*key).and_then(json_string))
        .ok_or_else(|| "missing canonical SMILES".to_string())?;
    Ok(StructureInfo {
        canonical_smiles,
        inchi: properties.get("InChI").and_then(json_string),
        inchi_key: properties.get("InChIKey").and_then(json_string),
        molecular_weight: properties.get("MolecularWeight").and_then(json_number),
        logp: properties.get("XLogP").and_then(json_number),
        tpsa: properties.get("TPSA").and_then(json_number),
    })
}
