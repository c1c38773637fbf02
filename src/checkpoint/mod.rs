//! Durable checkpoints for run state
//!
//! One snapshot per run, written after every controller transition and
//! restored on resume. Snapshots are taken only at phase boundaries, so a
//! restored run always begins a phase cleanly with fan-out bookkeeping
//! empty. Records carry a monotonically increasing sequence number; a write
//! with a lower sequence than the stored one is discarded, not applied.

use crate::state::ResearchState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

/// Checkpoint format version for forward-compatibility checks.
pub const CHECKPOINT_VERSION: u32 = 1;

/// A durable snapshot of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    /// Monotonically increasing per run; guards against out-of-order
    /// writes from a stale writer.
    pub sequence: u64,
    pub state: ResearchState,
    pub saved_at: DateTime<Utc>,
    pub version: u32,
}

impl Checkpoint {
    pub fn new(state: ResearchState, sequence: u64) -> Self {
        debug_assert!(
            state.transients_clear(),
            "checkpoints are only taken at phase boundaries"
        );
        Self {
            run_id: state.run_id.clone(),
            sequence,
            state,
            saved_at: Utc::now(),
            version: CHECKPOINT_VERSION,
        }
    }
}

/// How a save landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Persisted,
    /// The store already holds a newer sequence; the write was dropped.
    StaleDiscarded,
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to persist checkpoint for run {run_id}: {source}")]
    PersistFailed {
        run_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read checkpoint for run {run_id}: {source}")]
    ReadFailed {
        run_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint for run {run_id} is corrupted: {detail}")]
    Corrupted { run_id: String, detail: String },

    #[error("checkpoint for run {run_id} has version {found}, supported up to {supported}")]
    UnsupportedVersion {
        run_id: String,
        found: u32,
        supported: u32,
    },
}

/// Storage backend for checkpoints.
///
/// `save` fails closed: when it errors the controller must not commit the
/// transition that produced the snapshot. `load` returning `None` means
/// "start fresh", never an error.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<SaveOutcome, CheckpointError>;
    async fn load(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;
    async fn delete(&self, run_id: &str) -> Result<(), CheckpointError>;
    async fn list(&self) -> Result<Vec<String>, CheckpointError>;
}

/// File-backed checkpoint store: one JSON record per run, written through a
/// temp file and renamed so a crashed write never clobbers the last good
/// snapshot.
pub struct FileCheckpointStore {
    base_dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    fn path_for(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(format!("{run_id}.checkpoint.json"))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<SaveOutcome, CheckpointError> {
        let run_id = &checkpoint.run_id;

        // Reject out-of-order writes from a stale writer.
        if let Some(existing) = self.load(run_id).await? {
            if existing.sequence >= checkpoint.sequence {
                warn!(
                    "Discarding stale checkpoint for run {run_id}: sequence {} <= stored {}",
                    checkpoint.sequence, existing.sequence
                );
                return Ok(SaveOutcome::StaleDiscarded);
            }
        }

        let io_err = |source| CheckpointError::PersistFailed {
            run_id: run_id.clone(),
            source,
        };

        fs::create_dir_all(&self.base_dir).await.map_err(io_err)?;

        let path = self.path_for(run_id);
        let temp_path = path.with_extension("tmp");
        let json = serde_json::to_string_pretty(checkpoint).map_err(|e| {
            CheckpointError::Corrupted {
                run_id: run_id.clone(),
                detail: e.to_string(),
            }
        })?;

        fs::write(&temp_path, json).await.map_err(io_err)?;
        fs::rename(&temp_path, &path).await.map_err(io_err)?;

        info!(
            "Saved checkpoint {} for run {run_id} (phase {})",
            checkpoint.sequence, checkpoint.state.phase
        );
        Ok(SaveOutcome::Persisted)
    }

    async fn load(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.path_for(run_id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CheckpointError::ReadFailed {
                    run_id: run_id.to_string(),
                    source: e,
                })
            }
        };

        let checkpoint: Checkpoint =
            serde_json::from_str(&content).map_err(|e| CheckpointError::Corrupted {
                run_id: run_id.to_string(),
                detail: e.to_string(),
            })?;

        if checkpoint.version > CHECKPOINT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                run_id: run_id.to_string(),
                found: checkpoint.version,
                supported: CHECKPOINT_VERSION,
            });
        }

        debug!("Loaded checkpoint {} for run {run_id}", checkpoint.sequence);
        Ok(Some(checkpoint))
    }

    async fn delete(&self, run_id: &str) -> Result<(), CheckpointError> {
        let path = self.path_for(run_id);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted checkpoint for run {run_id}");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CheckpointError::PersistFailed {
                run_id: run_id.to_string(),
                source: e,
            }),
        }
    }

    async fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let mut run_ids = Vec::new();
        let mut entries = match fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(run_ids),
            Err(e) => {
                return Err(CheckpointError::ReadFailed {
                    run_id: String::new(),
                    source: e,
                })
            }
        };

        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            CheckpointError::ReadFailed {
                run_id: String::new(),
                source: e,
            }
        })? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(run_id) = name.strip_suffix(".checkpoint.json") {
                    run_ids.push(run_id.to_string());
                }
            }
        }

        run_ids.sort();
        Ok(run_ids)
    }
}
