use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::{Value, json};

use crate::domain::{IdentifierKind, SourceKind};
use crate::error::TransportError;
use crate::model::{Reference, SourceFields};
use crate::providers::http::{HttpTransport, build_query_url, encode_url_component, json_string};
use crate::source::{CompoundSource, Pacer};

const PSYCHONAUT_URL: &str = "https://api.psychonautwiki.org";
const PSYCHONAUT_QUERY: &str = "query Substance($query: String) { substances(query: $query, limit: 1) { name url summary commonNames addictionPotential toxicity crossTolerances class { chemical psychoactive } } }";
const WIKIPEDIA_SUMMARY_URL: &str = "https://en.wikipedia.org/api/rest_v1/page/summary";
const WIKIPEDIA_RAW_URL: &str = "https://en.wikipedia.org/w/index.php";

static LEGAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*\|\s*legal_([A-Za-z]+)\s*=(.*)$").expect("legal pattern compiles")
});
static MARKUP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<ref[^>]*/>|<ref[^>]*>.*?</ref>|<!--.*?-->|<[^>]+>")
        .expect("markup pattern compiles")
});
static LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\[(?:[^\]|]*\|)?([^\]]*)\]\]").expect("link pattern compiles")
});
static TEMPLATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([^{}]*)\}\}").expect("template pattern compiles"));

/// PsychonautWiki substance pages: common names, classes and harm notes.
pub struct PsychonautSource {
    http: HttpTransport,
}

impl PsychonautSource {
    pub fn new(http: HttpTransport) -> Self {
        Self { http }
    }
}

impl CompoundSource for PsychonautSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Psychonaut
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
        let body = json!({
            "query": PSYCHONAUT_QUERY,
            "variables": { "query": identifier },
        });
        let response = self.http.post_json(PSYCHONAUT_URL, &body)?;
        if let Some(errors) = response.get("errors").filter(|errors| !errors.is_null()) {
            return Err(TransportError::Permanent(format!("GraphQL errors: {errors}")));
        }
        let substance = response
            .pointer("/data/substances/0")
            .cloned()
            .ok_or(TransportError::NotFound)?;
        Ok(json!({ "substance": substance }))
    }

    fn parse(&self, payload: &Value) -> Result<SourceFields, String> {
        parse_substance(payload)
    }
}

pub fn parse_substance(payload: &Value) -> Result<SourceFields, String> {
    let substance = payload
        .get("substance")
        .filter(|value| value.is_object())
        .ok_or_else(|| "missing substance".to_string())?;

    let mut fields = SourceFields::default();
    if let Some(name) = substance.get("name").and_then(json_string) {
        fields.names.push(name);
    }
    for name in strings(substance.get("commonNames")) {
        if !fields.names.iter().any(|known| known.eq_ignore_ascii_case(&name)) {
            fields.names.push(name);
        }
    }

    let mut notes = Vec::new();
    let classes = strings(substance.pointer("/class/psychoactive"));
    if !classes.is_empty() {
        notes.push(format!("Psychoactive class: {}.", classes.join(", ")));
    }
    let chemical = strings(substance.pointer("/class/chemical"));
    if !chemical.is_empty() {
        notes.push(format!("Chemical class: {}.", chemical.join(", ")));
    }
    if let Some(summary) = substance.get("summary").and_then(json_string) {
        notes.push(summary);
    }
    if let Some(potential) = substance.get("addictionPotential").and_then(json_string) {
        notes.push(format!("Addiction potential: {potential}."));
    }
    let toxicity = strings(substance.get("toxicity"));
    if !toxicity.is_empty() {
        notes.push(format!("Toxicity: {}.", toxicity.join("; ")));
    }
    let tolerances = strings(substance.get("crossTolerances"));
    if !tolerances.is_empty() {
        notes.push(format!("Cross-tolerance: {}.", tolerances.join(", ")));
    }
    if !notes.is_empty() {
        fields.pharmacology = Some(notes.join(" "));
    }

    if let Some(url) = substance.get("url").and_then(json_string) {
        fields.references.push(Reference::url(url));
    }
    Ok(fields)
}

fn strings(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(json_string)
        .collect()
}

/// Wikipedia article summary plus the drugbox's legal status entries.
pub struct WikipediaSource {
    http: HttpTransport,
}

impl WikipediaSource {
    pub fn new(http: HttpTransport) -> Self {
        Self { http }
    }
}

impl CompoundSource for WikipediaSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Wikipedia
    }

    fn query_types(&self) -> &[IdentifierKind] {
        &[IdentifierKind::Name]
    }

    fn fetch(
        &self,
        _query_type: IdentifierKind,
        identifier: &str,
        pacer: &Pacer<'_>,
    ) -> Result<Value, TransportError> {
        let title = identifier.trim().replace(' ', "_");
        let summary = self.http.get_json(&format!(
            "{WIKIPEDIA_SUMMARY_URL}/{}",
            encode_url_component(&title)
        ))?;
        if summary.get("type").and_then(Value::as_str) == Some("disambiguation") {
            return Err(TransportError::NotFound);
        }

        let canonical = summary
            .pointer("/titles/canonical")
            .and_then(json_string)
            .unwrap_or(title);
        pacer.pace()?;
        let raw_url = build_query_url(
            WIKIPEDIA_RAW_URL,
            &[
                ("title", canonical.as_str()),
                ("action", "raw"),
                ("section", "0"),
            ],
        );
        let infobox = match self.http.get_text(&raw_url) {
            Ok(text) => Value::String(text),
            Err(TransportError::NotFound) => Value::Null,
            Err(err) => return Err(err),
        };

        Ok(json!({ "summary": summary, "infobox": infobox }))
    }

    fn parse(&self, payload: &Value) -> Result<SourceFields, String> {
        parse_article(payload)
    }
}

pub fn parse_article(payload: &Value) -> Result<SourceFields, String> {
    let summary = payload
        .get("summary")
        .filter(|value| value.is_object())
        .ok_or_else(|| "missing summary".to_string())?;

    let mut fields = SourceFields::default();
    if let Some(title) = summary.get("title").and_then(json_string) {
        fields.names.push(title);
    }
    fields.pharmacology = summary.get("extract").and_then(json_string);
    if let Some(url) = summary
        .pointer("/content_urls/desktop/page")
        .and_then(json_string)
    {
        fields.references.push(Reference::url(url));
    }
    if let Some(wikitext) = payload.get("infobox").and_then(Value::as_str) {
        fields.legal_status = legal_status(wikitext);
    }
    Ok(fields)
}

/// `US: Schedule II; UK: Class A` from drugbox `legal_XX` parameters.
pub fn legal_status(wikitext: &str) -> Option<String> {
    let entries = LEGAL_RE
        .captures_iter(wikitext)
        .filter_map(|caps| {
            let value = clean_wikitext(&caps[2]);
            if value.is_empty() {
                return None;
            }
            let region = &caps[1];
            Some(if region.eq_ignore_ascii_case("status") {
                value
            } else {
                format!("{region}: {value}")
            })
        })
        .collect::<Vec<_>>();
    (!entries.is_empty()).then(|| entries.join("; "))
}

fn clean_wikitext(value: &str) -> String {
    let mut text = MARKUP_RE.replace_all(value, "").into_owned();
    text = LINK_RE.replace_all(&text, "$1").into_owned();
    // innermost first, until no template is left
    while TEMPLATE_RE.is_match(&text) {
        text = TEMPLATE_RE
            .replace_all(&text, |caps: &Captures<'_>| caps[1].replace('|', " "))
            .into_owned();
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substance_notes_and_names() {
        let fields = parse_substance(&json!({
            "substance": {
                "name": "Caffeine",
                "url": "https://psychonautwiki.org/wiki/Caffeine",
                "commonNames": ["Caffeine", "Coffee", "Tea"],
                "addictionPotential": "moderately addictive",
                "toxicity": ["low toxicity"],
                "class": {"chemical": ["Xanthines"], "psychoactive": ["Stimulants"]}
            }
        }))
        .unwrap();
        assert_eq!(fields.names, vec!["Caffeine", "Coffee", "Tea"]);
        let notes = fields.pharmacology.unwrap();
        assert!(notes.starts_with("Psychoactive class: Stimulants."));
        assert!(notes.contains("Addiction potential: moderately addictive."));
        assert_eq!(
            fields.references,
            vec![Reference::url("https://psychonautwiki.org/wiki/Caffeine")]
        );
    }

    #[test]
    fn legal_entries_from_drugbox() {
        let wikitext = "{{Infobox drug\n| legal_AU = S2<ref name=\"x\">cite</ref>\n| legal_UK = [[Misuse of Drugs Act 1971|Class A]]\n| legal_US = {{US-Schedule|II}}\n| legal_US_comment = irrelevant\n| legal_DE = \n| legal_status = Rx-only\n}}";
        assert_eq!(
            legal_status(wikitext).as_deref(),
            Some("AU: S2; UK: Class A; US: US-Schedule II; Rx-only")
        );
        assert_eq!(legal_status("no drugbox here"), None);
    }

    #[test]
    fn article_summary() {
        let fields = parse_article(&json!({
            "summary": {
                "title": "Aspirin",
                "extract": "Aspirin is a nonsteroidal anti-inflammatory drug.",
                "content_urls": {"desktop": {"page": "https://en.wikipedia.org/wiki/Aspirin"}}
            },
            "infobox": null
        }))
        .unwrap();
        assert_eq!(fields.names, vec!["Aspirin"]);
        assert_eq!(fields.legal_status, None);
        assert!(fields.pharmacology.unwrap().starts_with("Aspirin is"));
    }
}
