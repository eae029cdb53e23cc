use serde_json::Value;

use crate::domain::{IdentifierKind, SourceKind};
use crate::error::TransportError;
use crate::model::{Reference, SourceFields};
use crate::providers::http::{HttpTransport, build_query_url, json_string};
use crate::source::{CompoundSource, Pacer};

const ESEARCH_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/esearch.fcgi";
const MAX_ARTICLES: &str = "20";

/// Literature database: PubMed ids of articles mentioning the compound.
pub struct PubmedSource {
    http: HttpTransport,
}

impl PubmedSource {
    pub fn new(http: HttpTransport) -> Self {
        Self { http }
    }
}

impl CompoundSource for PubmedSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Pubmed
    }

    fn query_types(&self) -> &[IdentifierKind] {
        &[IdentifierKind::Name]
    }

    fn fetch(
        &self,
        _query_type: IdentifierKind,
        identifier: &str,
        _pacer: &Pacer<'_>,
    ) -> Result<Value, TransportError> {
        let term = format!("\"{identifier}\"[Title/Abstract]");
        let url = build_query_url(
            ESEARCH_URL,
            &[
                ("db", "pubmed"),
                ("term", term.as_str()),
                ("retmode", "json"),
                ("retmax", MAX_ARTICLES),
                ("sort", "relevance"),
            ],
        );
        self.http.get_json(&url)
    }

    fn parse(&self, payload: &Value) -> Result<SourceFields, String> {
        parse_search(payload)
    }
}

pub fn parse_search(payload: &Value) -> Result<SourceFields, String> {
    let ids = payload
        .pointer("/esearchresult/idlist")
        .and_then(Value::as_array)
        .ok_or_else(|| "missing esearchresult.idlist".to_string())?;
    Ok(SourceFields {
        references: ids
            .iter()
            .filter_map(json_string)
            .map(Reference::pubmed)
            .collect(),
        ..SourceFields::default()
    })
}
