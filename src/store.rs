use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use directories::BaseDirs;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tempfile::Builder;
use tracing::debug;

use crate::cache::CacheEntry;
use crate::domain::SourceQueryKey;
use crate::error::CollectorError;

const CHECKPOINT_DIR: &str = "checkpoints";

/// On-disk tier of the response cache: one JSON file per entry, named by the
/// SHA-256 of the query key.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: Utf8PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreSummary {
    pub entries: usize,
    pub bytes: u64,
}

impl CacheStore {
    /// Store under `~/.cache/chemdata-collector/responses`.
    pub fn new() -> Result<Self, CollectorError> {
        let root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(
                    dirs.home_dir()
                        .join(".cache")
                        .join("chemdata-collector")
                        .join("responses"),
                )
                .ok()
            })
            .ok_or_else(|| {
                CollectorError::Filesystem("unable to resolve cache directory".to_string())
            })?;
        Ok(Self { root })
    }

    pub fn with_root(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Batch checkpoints live next to the responses and are cleared with
    /// them, but never counted as cache entries.
    pub fn checkpoint_dir(&self) -> Utf8PathBuf {
        self.root.join(CHECKPOINT_DIR)
    }

    pub fn entry_path(&self, key: &SourceQueryKey) -> Utf8PathBuf {
        let digest = Sha256::digest(key.to_string().as_bytes());
        self.root
            .join(key.source.as_str())
            .join(format!("{digest:x}.json"))
    }

    /// Reads the entry for `key`. Expired or unreadable files are removed and
    /// reported as absent.
    pub fn load(&self, key: &SourceQueryKey) -> Option<CacheEntry> {
        let path = self.entry_path(key);
        let content = fs::read(path.as_std_path()).ok()?;
        let entry = match serde_json::from_slice::<CacheEntry>(&content) {
            Ok(entry) if entry.key == *key && entry.is_fresh(Utc::now()) => entry,
            Ok(_) | Err(_) => {
                debug!(%key, path = %path, "dropping stale cache file");
                let _ = fs::remove_file(path.as_std_path());
                return None;
            }
        };
        Some(entry)
    }

    pub fn save(&self, entry: &CacheEntry) -> Result<(), CollectorError> {
        let path = self.entry_path(&entry.key);
        let content =
            serde_json::to_vec(entry).map_err(|err| CollectorError::Filesystem(err.to_string()))?;
        write_atomic(&path, &content)
    }

    pub fn remove(&self, key: &SourceQueryKey) -> Result<(), CollectorError> {
        let path = self.entry_path(key);
        if path.as_std_path().exists() {
            fs::remove_file(path.as_std_path())
                .map_err(|err| CollectorError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    pub fn clear(&self) -> Result<(), CollectorError> {
        if self.root.as_std_path().exists() {
            fs::remove_dir_all(self.root.as_std_path())
                .map_err(|err| CollectorError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    pub fn summary(&self) -> Result<StoreSummary, CollectorError> {
        let mut summary = StoreSummary::default();
        if !self.root.as_std_path().exists() {
            return Ok(summary);
        }
        let mut stack = vec![self.root.as_std_path().to_path_buf()];
        while let Some(dir) = stack.pop() {
            let entries =
                fs::read_dir(&dir).map_err(|err| CollectorError::Filesystem(err.to_string()))?;
            for entry in entries {
                let entry = entry.map_err(|err| CollectorError::Filesystem(err.to_string()))?;
                let path = entry.path();
                if path.is_dir() {
                    if path.as_path() != self.checkpoint_dir().as_std_path() {
                        stack.push(path);
                    }
                } else if path.extension().is_some_and(|ext| ext == "json") {
                    let metadata = entry
                        .metadata()
                        .map_err(|err| CollectorError::Filesystem(err.to_string()))?;
                    summary.entries += 1;
                    summary.bytes += metadata.len();
                }
            }
        }
        Ok(summary)
    }
}

pub(crate) fn write_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), CollectorError> {
    let parent = path
        .parent()
        .ok_or_else(|| CollectorError::Filesystem("invalid cache path".to_string()))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| CollectorError::Filesystem(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix("chemdata-entry")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| CollectorError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| CollectorError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| CollectorError::Filesystem(err.to_string()))?;
    Ok(())
}
