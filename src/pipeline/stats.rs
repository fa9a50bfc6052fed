//! Run statistics, accumulated in memory and reported at the end.

use serde::Serialize;

use crate::services::{CacheStats, StoreTotals};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageStats {
    pub processed: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl StageStats {
    pub fn total(&self) -> u64 {
        self.processed + self.failed + self.skipped
    }

    pub fn merge(&mut self, other: &StageStats) {
        self.processed += other.processed;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStatistics {
    pub discovery: StageStats,
    pub extraction: StageStats,
    pub ocr: StageStats,
    pub embedding: StageStats,
    pub storage: StageStats,

    pub documents_completed: u64,
    pub documents_failed: u64,
    /// Documents left out because an earlier run already completed them.
    pub resumed_skipped: u64,
    pub chunks_stored: u64,

    pub cache: CacheStats,
    pub cache_hit_rate: f64,
    pub store_totals: StoreTotals,

    pub batches_completed: usize,
    pub total_batches: usize,
    pub memory_releases: u64,
    pub interrupted: bool,
    pub duration_ms: u64,
}

impl PipelineStatistics {
    pub fn set_cache(&mut self, cache: CacheStats) {
        self.cache_hit_rate = cache.hit_rate();
        self.cache = cache;
    }

    pub fn failed_total(&self) -> u64 {
        self.extraction.failed + self.ocr.failed + self.embedding.failed + self.storage.failed
    }
}
