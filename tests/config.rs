use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;

use chemdata_collector::config::{ConfigLoader, InputLoader};
use chemdata_collector::domain::{CompoundQuery, SourceKind};
use chemdata_collector::error::CollectorError;

#[test]
fn loads_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chemdata.json");
    fs::write(
        &path,
        r#"{
            "schema_version": 1,
            "enabled_sources": ["pubchem", "chembl"],
            "workers": 8,
            "source_priority": ["chembl"],
            "max_activity_entries": 5,
            "request_timeout_secs": 10,
            "sources": {"patents": {"cache_ttl_secs": 3600}},
            "cache": {"persist": false, "directory": "/tmp/chemdata-cache"}
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(
        resolved.enabled_sources,
        vec![SourceKind::Pubchem, SourceKind::Chembl]
    );
    assert_eq!(resolved.workers, 8);
    assert_eq!(resolved.source_priority, vec![SourceKind::Chembl]);
    assert_eq!(resolved.max_activity_entries, 5);
    assert_eq!(resolved.request_timeout, Duration::from_secs(10));
    assert_eq!(
        resolved.sources[&SourceKind::Patents].cache_ttl,
        Some(Duration::from_secs(3600))
    );
    assert!(!resolved.cache.persist);
    assert_eq!(
        resolved.cache.directory.as_ref().map(|dir| dir.as_str()),
        Some("/tmp/chemdata-cache")
    );
}

#[test]
fn explicit_missing_config_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.json");
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(CollectorError::ConfigRead(missing)) if missing == path
    );
}

#[test]
fn malformed_config_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chemdata.json");
    fs::write(&path, "{\"workers\": \"many\"}").unwrap();
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(CollectorError::ConfigParse(_))
    );
}

#[test]
fn disabling_every_source_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chemdata.json");
    let sources = SourceKind::ALL
        .iter()
        .map(|kind| format!("\"{kind}\": {{\"enabled\": false}}"))
        .collect::<Vec<_>>()
        .join(",");
    fs::write(&path, format!("{{\"sources\": {{{sources}}}}}")).unwrap();
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(CollectorError::NoSourcesEnabled)
    );
}

#[test]
fn loads_json_and_line_inputs() {
    let dir = tempfile::tempdir().unwrap();
    let json_path = dir.path().join("compounds.json");
    fs::write(
        &json_path,
        r#"["50-78-2", {"name": "Caffeine", "inchi_key": "RYYVLZVUVIJVGH-UHFFFAOYSA-N"}]"#,
    )
    .unwrap();
    let queries = InputLoader::load(&json_path).unwrap();
    assert_eq!(queries[0], CompoundQuery::with_cas("50-78-2"));
    assert_eq!(queries[1].name.as_deref(), Some("Caffeine"));
    assert_eq!(
        queries[1].inchi_key.as_deref(),
        Some("RYYVLZVUVIJVGH-UHFFFAOYSA-N")
    );

    let text_path = dir.path().join("compounds.txt");
    fs::write(&text_path, "# batch 1\n50-78-2\nTheobromine\n").unwrap();
    let queries = InputLoader::load(&text_path).unwrap();
    assert_eq!(
        queries,
        vec![
            CompoundQuery::with_cas("50-78-2"),
            CompoundQuery::with_name("Theobromine")
        ]
    );
}

#[test]
fn malformed_input_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("compounds.json");
    fs::write(&path, "[42]").unwrap();
    assert_matches!(InputLoader::load(&path), Err(CollectorError::ConfigParse(_)));
}
