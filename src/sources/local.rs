//! Local file system discovery.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::dedup::DuplicateRegistry;
use crate::error::SourceError;
use crate::models::{DocumentRecord, FileKind, PipelineConfig};
use crate::utils::file::{calculate_file_checksum, file_timestamp};

/// Documents found under a root path plus what was left out.
#[derive(Debug, Default)]
pub struct Discovery {
    pub documents: Vec<DocumentRecord>,
    pub unsupported: usize,
    pub duplicates: usize,
    pub excluded: usize,
    pub failed: usize,
}

impl Discovery {
    pub fn skipped(&self) -> usize {
        self.unsupported + self.duplicates + self.excluded
    }
}

/// Local file system data source.
#[derive(Debug)]
pub struct LocalSource {
    /// Lowercase extensions without the dot
    supported_formats: HashSet<String>,

    /// Patterns to exclude
    exclude_patterns: Vec<glob::Pattern>,

    /// Maximum file size
    max_file_size: u64,

    skip_duplicates: bool,
}

impl LocalSource {
    pub fn new(config: &PipelineConfig) -> Self {
        let exclude_patterns = config
            .exclude_patterns
            .iter()
            .filter_map(|p| match glob::Pattern::new(p) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!("Ignoring invalid exclude pattern '{}': {}", p, e);
                    None
                }
            })
            .collect();

        Self {
            supported_formats: config
                .supported_formats
                .iter()
                .map(|f| f.trim_start_matches('.').to_lowercase())
                .collect(),
            exclude_patterns,
            max_file_size: config.max_file_size,
            skip_duplicates: config.skip_duplicates,
        }
    }

    /// Walk `root` (a file or a directory) in file-name order and build a
    /// record for every supported, non-duplicate file.
    pub fn discover(
        &self,
        root: &Path,
        registry: &DuplicateRegistry,
    ) -> Result<Discovery, SourceError> {
        if !root.exists() {
            return Err(SourceError::InvalidPath(root.display().to_string()));
        }

        let mut discovery = Discovery::default();
        let mut seen_this_pass = HashSet::new();

        for path in self.collect_files(root, &mut discovery) {
            match self.read_document(&path, registry, &mut seen_this_pass) {
                Ok(Some(doc)) => {
                    debug!("Ingested: {} ({})", doc.file_name(), doc.kind);
                    discovery.documents.push(doc);
                }
                Ok(None) => discovery.duplicates += 1,
                Err(e) => {
                    warn!("{}", e);
                    discovery.failed += 1;
                }
            }
        }

        info!(
            "Discovery complete: {} documents ready, {} skipped, {} failed",
            discovery.documents.len(),
            discovery.skipped(),
            discovery.failed
        );
        Ok(discovery)
    }

    fn collect_files(&self, root: &Path, discovery: &mut Discovery) -> Vec<PathBuf> {
        let mut files = Vec::new();

        for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry: {}", e);
                    discovery.failed += 1;
                    continue;
                }
            };
            let path = entry.path();

            if !entry.file_type().is_file() {
                continue;
            }

            let path_str = path.to_string_lossy();
            if self.exclude_patterns.iter().any(|p| p.matches(&path_str)) {
                discovery.excluded += 1;
                continue;
            }

            if !self.is_supported(path) {
                debug!("{}: unsupported format", path.display());
                discovery.unsupported += 1;
                continue;
            }

            files.push(path.to_path_buf());
        }

        files
    }

    fn is_supported(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        self.supported_formats.contains(&ext.to_lowercase()) && FileKind::from_path(path).is_some()
    }

    /// Returns `Ok(None)` for duplicates.
    fn read_document(
        &self,
        path: &Path,
        registry: &DuplicateRegistry,
        seen_this_pass: &mut HashSet<String>,
    ) -> Result<Option<DocumentRecord>, SourceError> {
        let kind = FileKind::from_path(path)
            .ok_or_else(|| SourceError::InvalidPath(path.display().to_string()))?;
        let stat = std::fs::metadata(path)
            .map_err(|e| SourceError::FileReadError(format!("{}: {}", path.display(), e)))?;

        if stat.len() > self.max_file_size {
            return Err(SourceError::FileReadError(format!(
                "{}: file exceeds maximum size ({} > {})",
                path.display(),
                stat.len(),
                self.max_file_size
            )));
        }

        // Bytes are read later, one batch at a time; only the hash is needed here.
        let file_hash = calculate_file_checksum(path)
            .map_err(|e| SourceError::FileReadError(format!("{}: {}", path.display(), e)))?;

        if self.skip_duplicates {
            if registry.contains(&file_hash) || !seen_this_pass.insert(file_hash.clone()) {
                info!(
                    "{}: duplicate (hash: {}...)",
                    path.display(),
                    &file_hash[..8]
                );
                return Ok(None);
            }
        }

        let mut doc = DocumentRecord::new(path, kind);
        doc.set_meta("filename", doc.file_name());
        doc.set_meta("file_size", stat.len());
        if let Some(created) = file_timestamp(stat.created()) {
            doc.set_meta("created_date", created);
        }
        if let Some(modified) = file_timestamp(stat.modified()) {
            doc.set_meta("modified_date", modified);
        }
        doc.set_meta("file_hash", Value::String(file_hash.clone()));
        doc.file_hash = Some(file_hash);

        Ok(Some(doc))
    }
}
