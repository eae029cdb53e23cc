use serde_json::Value;

use crate::domain::{IdentifierKind, SourceKind};
use crate::error::TransportError;
use crate::model::{Reference, SourceFields};
use crate::providers::http::{HttpTransport, json_string};
use crate::providers::pubchem::lookup_url;
use crate::source::{CompoundSource, Pacer};

const MAX_PATENTS: usize = 25;

/// Patent database: patent numbers cross-referenced by PubChem.
pub struct PatentSource {
    http: HttpTransport,
}

impl PatentSource {
    pub fn new(http: HttpTransport) -> Self {
        Self { http }
    }
}

impl CompoundSource for PatentSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Patents
    }

    fn query_types(&self) -> &[IdentifierKind] {
        &[IdentifierKind::InchiKey, IdentifierKind::Cas, IdentifierKind::Name]
    }

    fn fetch(
        &self,
        query_type: IdentifierKind,
        identifier: &str,
        _pacer: &Pacer<'_>,
    ) -> Result<Value, TransportError> {
        self.http
            .get_json(&lookup_url(query_type, identifier, "xrefs/PatentID/JSON"))
    }

    fn parse(&self, payload: &Value) -> Result<SourceFields, String> {
        parse_xrefs(payload)
    }
}

pub fn parse_xrefs(payload: &Value) -> Result<SourceFields, String> {
    let information = payload
        .pointer("/InformationList/Information")
        .and_then(Value::as_array)
        .ok_or_else(|| "missing InformationList".to_string())?;
    let references = information
        .iter()
        .filter_map(|entry| entry.get("PatentID").and_then(Value::as_array))
        .flatten()
        .filter_map(json_string)
        .take(MAX_PATENTS)
        .map(Reference::patent)
        .collect();
    Ok(SourceFields {
        references,
        ..SourceFields::default()
    })
}
