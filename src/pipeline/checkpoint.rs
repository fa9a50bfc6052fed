//! Durable resume state for a pipeline run.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::PersistenceError;
use crate::models::Metadata;
use crate::utils::file::write_atomic;

/// Snapshot of run progress, rewritten in full at every batch boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub timestamp: DateTime<Utc>,
    /// Keys of documents that reached `completed`.
    #[serde(alias = "processed_files")]
    pub completed_keys: Vec<String>,
    pub current_batch: usize,
    pub total_batches: usize,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Checkpoint {
    pub fn completed_set(&self) -> BTreeSet<String> {
        self.completed_keys.iter().cloned().collect()
    }
}

/// Owns the checkpoint file. Only the coordinator writes it.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the checkpoint atomically.
    pub fn save(
        &self,
        completed_keys: &[String],
        current_batch: usize,
        total_batches: usize,
        metadata: Metadata,
    ) -> Result<(), PersistenceError> {
        let checkpoint = Checkpoint {
            timestamp: Utc::now(),
            completed_keys: completed_keys.to_vec(),
            current_batch,
            total_batches,
            metadata,
        };
        let json = serde_json::to_vec_pretty(&checkpoint)?;
        write_atomic(&self.path, &json)?;
        info!(
            "Checkpoint saved: batch {}/{}, {} documents completed",
            current_batch,
            total_batches,
            completed_keys.len()
        );
        Ok(())
    }

    /// Read the checkpoint. Missing and unreadable files both yield `None`;
    /// the latter is logged.
    pub fn load(&self) -> Option<Checkpoint> {
        if !self.path.exists() {
            info!("No checkpoint file found");
            return None;
        }

        match self.try_load() {
            Ok(checkpoint) => {
                info!(
                    "Checkpoint loaded: batch {}/{}, {} documents already completed",
                    checkpoint.current_batch,
                    checkpoint.total_batches,
                    checkpoint.completed_keys.len()
                );
                Some(checkpoint)
            }
            Err(e) => {
                warn!("Failed to load checkpoint {}: {}", self.path.display(), e);
                None
            }
        }
    }

    fn try_load(&self) -> Result<Checkpoint, PersistenceError> {
        let bytes = std::fs::read(&self.path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn clear(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => info!("Checkpoint cleared"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to clear checkpoint {}: {}", self.path.display(), e),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}
