//! Document discovery.
//!
//! A source turns an input path into an ordered list of document records,
//! with duplicate suppression against the content-hash registry.

mod dedup;
mod local;

pub use dedup::DuplicateRegistry;
pub use local::{Discovery, LocalSource};

use std::path::Path;

use crate::error::SourceError;

/// Trait for document sources feeding the pipeline.
pub trait DocumentSource: Send + Sync {
    /// Human-readable name.
    fn name(&self) -> &str;

    /// Find the documents under `root`. Files whose content hash is in
    /// `registry`, or repeats an earlier file of the same pass, are skipped.
    fn discover(&self, root: &Path, registry: &DuplicateRegistry) -> Result<Discovery, SourceError>;
}

impl DocumentSource for LocalSource {
    fn name(&self) -> &str {
        "local"
    }

    fn discover(&self, root: &Path, registry: &DuplicateRegistry) -> Result<Discovery, SourceError> {
        LocalSource::discover(self, root, registry)
    }
}
