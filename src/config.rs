use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Deserializer, Serialize};

use crate::batch::DEFAULT_WORKERS;
use crate::circuit::CircuitConfig;
use crate::context::SourceSettings;
use crate::domain::{CasNumber, CompoundQuery, SourceKind};
use crate::error::CollectorError;
use crate::rate_limit::RateLimit;
use crate::retry::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "chemdata.json";
pub const DEFAULT_MAX_ACTIVITIES: usize = 10;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceEntry>,
    #[serde(default)]
    pub enabled_sources: Option<Vec<String>>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub retry: Option<RetryEntry>,
    #[serde(default)]
    pub source_priority: Option<Vec<String>>,
    #[serde(default)]
    pub max_activity_entries: Option<usize>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub cache: Option<CacheEntryConfig>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SourceEntry {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub requests_per_second: Option<f64>,
    #[serde(default)]
    pub burst: Option<u32>,
    #[serde(default)]
    pub failure_threshold: Option<u32>,
    #[serde(default)]
    pub failure_window_secs: Option<u64>,
    #[serde(default)]
    pub cooldown_secs: Option<u64>,
    /// Absent keeps the default; `null` never expires.
    #[serde(default, deserialize_with = "present_or_null")]
    pub cache_ttl_secs: Option<Option<u64>>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RetryEntry {
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    #[serde(default)]
    pub jitter: Option<bool>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CacheEntryConfig {
    #[serde(default)]
    pub persist: Option<bool>,
    #[serde(default)]
    pub directory: Option<String>,
}

fn present_or_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheSettings {
    pub persist: bool,
    pub directory: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub enabled_sources: Vec<SourceKind>,
    pub sources: BTreeMap<SourceKind, SourceSettings>,
    pub workers: usize,
    pub retry: RetryPolicy,
    pub source_priority: Vec<SourceKind>,
    pub max_activity_entries: usize,
    pub request_timeout: Duration,
    pub cache: CacheSettings,
}

impl ResolvedConfig {
    /// Applies command-line overrides and re-validates.
    pub fn with_overrides(
        mut self,
        sources: &[SourceKind],
        workers: Option<usize>,
    ) -> Result<Self, CollectorError> {
        if !sources.is_empty() {
            self.enabled_sources = dedup_sources(sources.iter().copied());
        }
        if let Some(workers) = workers {
            self.workers = workers;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), CollectorError> {
        if self.enabled_sources.is_empty() {
            return Err(CollectorError::NoSourcesEnabled);
        }
        if self.workers == 0 {
            return Err(CollectorError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        for (source, settings) in &self.sources {
            let rate = settings.rate.requests_per_second;
            if !(rate.is_finite() && rate > 0.0) {
                return Err(CollectorError::InvalidConfig(format!(
                    "{source}: requests_per_second must be positive"
                )));
            }
            if settings.circuit.failure_threshold == 0 {
                return Err(CollectorError::InvalidConfig(format!(
                    "{source}: failure_threshold must be at least 1"
                )));
            }
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(CollectorError::InvalidConfig(
                "retry base_delay_ms exceeds max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `chemdata.json` from the working directory. Without
    /// an explicit path a missing file means defaults.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, CollectorError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| CollectorError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| CollectorError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, CollectorError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let mut entries = BTreeMap::new();
        for (name, entry) in config.sources {
            entries.insert(name.parse::<SourceKind>()?, entry);
        }

        let mut sources = BTreeMap::new();
        let mut enabled_by_entry = Vec::new();
        for kind in SourceKind::ALL {
            let defaults = SourceSettings::for_source(kind);
            let entry = entries.remove(&kind).unwrap_or_default();
            if entry.enabled.unwrap_or(true) {
                enabled_by_entry.push(kind);
            }
            let settings = SourceSettings {
                rate: RateLimit {
                    requests_per_second: entry
                        .requests_per_second
                        .unwrap_or(defaults.rate.requests_per_second),
                    burst: entry.burst.unwrap_or(defaults.rate.burst),
                },
                circuit: CircuitConfig {
                    failure_threshold: entry
                        .failure_threshold
                        .unwrap_or(defaults.circuit.failure_threshold),
                    window: entry
                        .failure_window_secs
                        .map(Duration::from_secs)
                        .unwrap_or(defaults.circuit.window),
                    cooldown: entry
                        .cooldown_secs
                        .map(Duration::from_secs)
                        .unwrap_or(defaults.circuit.cooldown),
                },
                cache_ttl: match entry.cache_ttl_secs {
                    Some(ttl) => ttl.map(Duration::from_secs),
                    None => defaults.cache_ttl,
                },
            };
            sources.insert(kind, settings);
        }

        let enabled_sources = match config.enabled_sources {
            Some(names) => dedup_sources(parse_sources(&names)?),
            None => enabled_by_entry,
        };

        let source_priority = match config.source_priority {
            Some(names) => dedup_sources(parse_sources(&names)?),
            None => SourceKind::ALL.to_vec(),
        };

        let defaults = RetryPolicy::default();
        let retry = match config.retry {
            Some(entry) => RetryPolicy {
                max_retries: entry.max_retries.unwrap_or(defaults.max_retries),
                base_delay: entry
                    .base_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.base_delay),
                max_delay: entry
                    .max_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.max_delay),
                jitter: entry.jitter.unwrap_or(defaults.jitter),
            },
            None => defaults,
        };

        let cache = config.cache.unwrap_or_default();
        let resolved = ResolvedConfig {
            schema_version,
            enabled_sources,
            sources,
            workers: config.workers.unwrap_or(DEFAULT_WORKERS),
            retry,
            source_priority,
            max_activity_entries: config.max_activity_entries.unwrap_or(DEFAULT_MAX_ACTIVITIES),
            request_timeout: config
                .request_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            cache: CacheSettings {
                persist: cache.persist.unwrap_or(true),
                directory: cache.directory.map(Utf8PathBuf::from),
            },
        };
        resolved.validate()?;
        Ok(resolved)
    }
}

fn parse_sources(names: &[String]) -> Result<Vec<SourceKind>, CollectorError> {
    names.iter().map(|name| name.parse::<SourceKind>()).collect()
}

fn dedup_sources(sources: impl IntoIterator<Item = SourceKind>) -> Vec<SourceKind> {
    let mut out = Vec::new();
    for source in sources {
        if !out.contains(&source) {
            out.push(source);
        }
    }
    out
}

/// One input entry: a bare identifier or an object naming each identifier.
#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum InputEntry {
    Shorthand(String),
    Detailed(CompoundQuery),
}

impl InputEntry {
    /// A bare string is a CAS number if it validates as one, otherwise a name.
    pub fn into_query(self) -> CompoundQuery {
        match self {
            InputEntry::Shorthand(value) => {
                if value.parse::<CasNumber>().is_ok() {
                    CompoundQuery::with_cas(value.trim())
                } else {
                    CompoundQuery::with_name(value.trim())
                }
            }
            InputEntry::Detailed(query) => query,
        }
    }
}

pub struct InputLoader;

impl InputLoader {
    /// Reads a JSON array of entries, or for any other extension one
    /// shorthand identifier per line (`#` starts a comment).
    pub fn load(path: &Path) -> Result<Vec<CompoundQuery>, CollectorError> {
        let content =
            fs::read_to_string(path).map_err(|_| CollectorError::ConfigRead(path.to_path_buf()))?;
        if path.extension().is_some_and(|ext| ext == "json") {
            Self::parse_json(&content)
        } else {
            Ok(Self::parse_lines(&content))
        }
    }

    pub fn parse_json(content: &str) -> Result<Vec<CompoundQuery>, CollectorError> {
        let entries: Vec<InputEntry> = serde_json::from_str(content)
            .map_err(|err| CollectorError::ConfigParse(err.to_string()))?;
        Ok(entries.into_iter().map(InputEntry::into_query).collect())
    }

    pub fn parse_lines(content: &str) -> Vec<CompoundQuery> {
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| InputEntry::Shorthand(line.to_string()).into_query())
            .collect()
    }
}
