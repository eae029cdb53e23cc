use std::collections::BTreeMap;
use std::fs;
use std::sync::{Mutex, MutexGuard, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::domain::CompoundQuery;
use crate::error::CollectorError;
use crate::model::Compound;
use crate::store::write_atomic;

pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointFile {
    schema_version: u32,
    input_digest: String,
    updated_at: DateTime<Utc>,
    /// Merged compounds keyed by their position in the input.
    completed: BTreeMap<usize, Compound>,
}

/// Where to keep checkpoints, and whether a run picks up an earlier one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointOptions {
    pub directory: Utf8PathBuf,
    pub resume: bool,
}

/// Progress of one batch on disk. Each merged compound is persisted as soon
/// as it completes, so an interrupted run can skip it next time. The file is
/// named by the SHA-256 of the input, so a changed input never resumes from
/// stale results.
#[derive(Debug)]
pub struct Checkpoint {
    path: Utf8PathBuf,
    state: Mutex<CheckpointFile>,
}

impl Checkpoint {
    /// Opens the checkpoint for `queries`. Without `resume` any earlier file
    /// is ignored and overwritten on the first recorded compound.
    pub fn open(
        directory: &Utf8Path,
        queries: &[CompoundQuery],
        resume: bool,
    ) -> Result<Self, CollectorError> {
        let digest = input_digest(queries)?;
        let path = directory.join(format!("{digest}.json"));
        let fresh = CheckpointFile {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            input_digest: digest.clone(),
            updated_at: Utc::now(),
            completed: BTreeMap::new(),
        };

        let state = if resume {
            match read_file(&path) {
                Some(file)
                    if file.schema_version == CHECKPOINT_SCHEMA_VERSION
                        && file.input_digest == digest =>
                {
                    info!(
                        path = %path,
                        completed = file.completed.len(),
                        "resuming from checkpoint"
                    );
                    file
                }
                Some(_) => {
                    warn!(path = %path, "checkpoint does not match this input, starting over");
                    fresh
                }
                None => fresh,
            }
        } else {
            fresh
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, CheckpointFile> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Compounds finished by an earlier run, keyed by input position.
    pub fn completed(&self) -> BTreeMap<usize, Compound> {
        self.lock().completed.clone()
    }

    /// Adds one finished compound and rewrites the file atomically.
    pub fn record(&self, index: usize, compound: &Compound) -> Result<(), CollectorError> {
        let mut state = self.lock();
        state.completed.insert(index, compound.clone());
        state.updated_at = Utc::now();
        let content = serde_json::to_vec(&*state)
            .map_err(|err| CollectorError::Filesystem(err.to_string()))?;
        write_atomic(&self.path, &content)?;
        debug!(index, completed = state.completed.len(), "checkpoint updated");
        Ok(())
    }

    /// Removes the file once the batch has nothing left to resume.
    pub fn discard(&self) -> Result<(), CollectorError> {
        if self.path.as_std_path().exists() {
            fs::remove_file(self.path.as_std_path())
                .map_err(|err| CollectorError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }
}

fn input_digest(queries: &[CompoundQuery]) -> Result<String, CollectorError> {
    let content =
        serde_json::to_vec(queries).map_err(|err| CollectorError::Filesystem(err.to_string()))?;
    Ok(format!("{:x}", Sha256::digest(&content)))
}

fn read_file(path: &Utf8Path) -> Option<CheckpointFile> {
    let content = fs::read(path.as_std_path()).ok()?;
    match serde_json::from_slice(&content) {
        Ok(file) => Some(file),
        Err(err) => {
            warn!(path = %path, error = %err, "unreadable checkpoint ignored");
            None
        }
    }
}
