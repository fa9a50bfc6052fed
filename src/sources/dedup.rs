//! Content-hash registry for duplicate suppression across runs.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::PersistenceError;
use crate::utils::file::write_atomic;

/// SHA-256 hashes of files that completed the pipeline, persisted as one
/// hash per line.
#[derive(Debug)]
pub struct DuplicateRegistry {
    path: Option<PathBuf>,
    hashes: RwLock<BTreeSet<String>>,
}

impl DuplicateRegistry {
    /// A registry that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            hashes: RwLock::new(BTreeSet::new()),
        }
    }

    /// Open the registry at `path`. A missing or unreadable file yields an
    /// empty registry.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let hashes = match std::fs::read_to_string(&path) {
            Ok(content) => {
                let hashes: BTreeSet<String> = content
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect();
                info!("Loaded {} processed file hashes", hashes.len());
                hashes
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => {
                warn!("Failed to load hash file {}: {}", path.display(), e);
                BTreeSet::new()
            }
        };

        Self {
            path: Some(path),
            hashes: RwLock::new(hashes),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.hashes.read().contains(hash)
    }

    /// Returns true if the hash was not known yet.
    pub fn record(&self, hash: impl Into<String>) -> bool {
        self.hashes.write().insert(hash.into())
    }

    pub fn len(&self) -> usize {
        self.hashes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.read().is_empty()
    }

    pub fn clear(&self) {
        self.hashes.write().clear();
    }

    /// Write the hashes, sorted, one per line.
    pub fn save(&self) -> Result<(), PersistenceError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut content = String::new();
        for hash in self.hashes.read().iter() {
            content.push_str(hash);
            content.push('\n');
        }
        write_atomic(path, content.as_bytes())
    }
}
