//! In-process vector store with brute-force cosine search.
//!
//! Used by the test suite and by `--store memory` dry runs. Contents are
//! lost when the process exits.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::{
    ChunkRecord, MetadataFilter, StoreTotals, StoredMatch, VectorStore, count_sources,
};
use crate::error::VectorStoreError;

pub struct MemoryStore {
    collection: String,
    records: RwLock<BTreeMap<String, ChunkRecord>>,
    dimension: RwLock<Option<usize>>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            records: RwLock::new(BTreeMap::new()),
            dimension: RwLock::new(None),
            available: AtomicBool::new(true),
        }
    }

    /// Make every operation fail with a connection error, as an
    /// unreachable server would.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Copy of every stored record, ordered by id.
    pub fn records(&self) -> Vec<ChunkRecord> {
        self.records.read().values().cloned().collect()
    }

    fn check_available(&self) -> Result<(), VectorStoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(VectorStoreError::ConnectionError(format!(
                "memory store '{}' is offline",
                self.collection
            )))
        }
    }

    fn to_match(record: &ChunkRecord, distance: f32) -> StoredMatch {
        StoredMatch {
            id: record.id.clone(),
            text: record.text.clone(),
            metadata: record.metadata.clone(),
            distance,
        }
    }

    /// Compute cosine similarity between two vectors.
    fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return 0.0;
        }

        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }

        dot / (norm_a * norm_b)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(crate::models::DEFAULT_COLLECTION)
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn health_check(&self) -> Result<bool, VectorStoreError> {
        self.check_available()?;
        Ok(true)
    }

    async fn ensure_collection(&self) -> Result<(), VectorStoreError> {
        self.check_available()
    }

    async fn insert(&self, records: Vec<ChunkRecord>) -> Result<usize, VectorStoreError> {
        self.check_available()?;
        if records.is_empty() {
            return Ok(0);
        }

        {
            let mut dimension = self.dimension.write();
            for record in &records {
                match *dimension {
                    Some(expected) if expected != record.vector.len() => {
                        return Err(VectorStoreError::DimensionMismatch {
                            expected,
                            actual: record.vector.len(),
                        });
                    }
                    Some(_) => {}
                    None => *dimension = Some(record.vector.len()),
                }
            }
        }

        let count = records.len();
        let mut stored = self.records.write();
        for record in records {
            stored.insert(record.id.clone(), record);
        }
        debug!("Stored {} chunks in memory collection '{}'", count, self.collection);
        Ok(count)
    }

    async fn query(
        &self,
        vector: Vec<f32>,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<StoredMatch>, VectorStoreError> {
        self.check_available()?;
        let stored = self.records.read();
        let mut scored: Vec<(f32, &ChunkRecord)> = stored
            .values()
            .filter(|r| filter.is_none_or(|f| f.matches(&r.metadata)))
            .map(|r| (Self::cosine_similarity(&vector, &r.vector), r))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(similarity, record)| Self::to_match(record, 1.0 - similarity))
            .collect())
    }

    async fn get(
        &self,
        filter: &MetadataFilter,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMatch>, VectorStoreError> {
        self.check_available()?;
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| filter.matches(&r.metadata))
            .take(limit.unwrap_or(usize::MAX))
            .map(|r| Self::to_match(r, 0.0))
            .collect())
    }

    async fn count(&self) -> Result<u64, VectorStoreError> {
        self.check_available()?;
        Ok(self.records.read().len() as u64)
    }

    async fn totals(&self) -> Result<StoreTotals, VectorStoreError> {
        self.check_available()?;
        let stored = self.records.read();
        Ok(StoreTotals {
            chunks: stored.len() as u64,
            sources: count_sources(stored.values().map(ChunkRecord::source_file)),
        })
    }

    async fn delete_by_source(&self, source_file: &str) -> Result<(), VectorStoreError> {
        self.check_available()?;
        self.records
            .write()
            .retain(|_, r| r.source_file() != Some(source_file));
        Ok(())
    }

    async fn reset(&self) -> Result<(), VectorStoreError> {
        self.check_available()?;
        self.records.write().clear();
        *self.dimension.write() = None;
        Ok(())
    }

    fn collection(&self) -> &str {
        &self.collection
    }
}
