//! Streaming batch pipeline with checkpointed recovery.
//!
//! The orchestrator discovers documents, drops those a previous run already
//! completed, and pushes the rest through extraction, OCR, embedding and
//! storage one fixed-size batch at a time. After each batch it persists the
//! embedding cache and duplicate hashes, rewrites the checkpoint and releases
//! memory before starting the next one. Batches never overlap; concurrency
//! exists only inside a stage.

pub mod cancel;
pub mod checkpoint;
pub mod memory;
pub mod runner;
pub mod stages;
pub mod stats;

pub use cancel::CancelToken;
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use memory::{MemoryGuard, MemoryProbe, MemoryUsage, Reclaim, SystemProbe};
pub use runner::{Stage, StageOutcome, StageReport, StageRunner};
pub use stages::{EmbeddingStage, ExtractionStage, OcrStage, StorageStage};
pub use stats::{PipelineStatistics, StageStats};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::extract::{ExtractorRegistry, OcrChain};
use crate::models::{Config, DocumentRecord, Metadata};
use crate::services::{
    CachedEmbedder, EmbeddingCache, EmbeddingProvider, TextChunker, VectorStore,
};
use crate::sources::{DocumentSource, DuplicateRegistry, LocalSource};

/// Where the orchestrator is in a run.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineState {
    Idle,
    Discovering,
    StreamingBatches { batch: usize, total: usize },
    Finalizing,
    Done,
    /// Cancelled between batches; the checkpoint is kept for resume.
    Interrupted,
    Aborted(String),
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Done | PipelineState::Interrupted | PipelineState::Aborted(_)
        )
    }
}

/// Reported after every finished batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchProgress {
    pub batch: usize,
    pub total_batches: usize,
    pub documents: usize,
    pub completed: usize,
}

type ProgressFn = Box<dyn Fn(BatchProgress) + Send + Sync>;

enum BatchResult {
    Finished,
    Interrupted,
}

pub struct PipelineBuilder {
    config: Config,
    source: Option<Arc<dyn DocumentSource>>,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    store: Option<Arc<dyn VectorStore>>,
    registry: Option<ExtractorRegistry>,
    ocr: Option<OcrChain>,
    probe: Option<Arc<dyn MemoryProbe>>,
    cancel: CancelToken,
    progress: Option<ProgressFn>,
}

impl PipelineBuilder {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            source: None,
            provider: None,
            store: None,
            registry: None,
            ocr: None,
            probe: None,
            cancel: CancelToken::new(),
            progress: None,
        }
    }

    pub fn source(mut self, source: Arc<dyn DocumentSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(mut self, registry: ExtractorRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn ocr(mut self, chain: OcrChain) -> Self {
        self.ocr = Some(chain);
        self
    }

    pub fn memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn on_batch<F>(mut self, callback: F) -> Self
    where
        F: Fn(BatchProgress) + Send + Sync + 'static,
    {
        self.progress = Some(Box::new(callback));
        self
    }

    pub fn build(self) -> Result<Pipeline, PipelineError> {
        let config = self.config;
        let provider = self
            .provider
            .ok_or_else(|| PipelineError::Setup("no embedding provider".to_string()))?;
        let store = self
            .store
            .ok_or_else(|| PipelineError::Setup("no vector store".to_string()))?;

        let ocr = match self.ocr {
            Some(chain) => chain,
            None => OcrChain::from_config(&config.ocr)
                .map_err(|e| PipelineError::Setup(format!("OCR: {e}")))?,
        };

        let memory = match self.probe {
            Some(probe) => MemoryGuard::with_probe(&config.memory, probe),
            None => MemoryGuard::new(&config.memory),
        };

        let cache = Arc::new(EmbeddingCache::new(config.embedding.cache_size));
        memory.register(cache.clone());
        let embedder = Arc::new(CachedEmbedder::new(provider, cache, &config.embedding));

        let runner = StageRunner::new(config.pipeline.max_workers, config.pipeline.parallel);
        let registry = Arc::new(self.registry.unwrap_or_default());

        Ok(Pipeline {
            source: self
                .source
                .unwrap_or_else(|| Arc::new(LocalSource::new(&config.pipeline))),
            extraction: Arc::new(ExtractionStage::new(registry)),
            ocr: Arc::new(OcrStage::new(Arc::new(ocr))),
            embedding: Arc::new(EmbeddingStage::new(
                TextChunker::new(&config.chunking),
                embedder.clone(),
            )),
            storage: Arc::new(StorageStage::new(store.clone(), config.vector_store.retry_config())),
            embedder,
            store,
            memory,
            checkpoints: CheckpointStore::new(config.checkpoint_path()),
            duplicates: DuplicateRegistry::open(config.hashes_path()),
            cache_path: config.cache_path(),
            runner,
            batch_size: config.pipeline.stream_batch_size.max(1),
            cancel: self.cancel,
            progress: self.progress,
            state: PipelineState::Idle,
        })
    }
}

pub struct Pipeline {
    source: Arc<dyn DocumentSource>,
    extraction: Arc<ExtractionStage>,
    ocr: Arc<OcrStage>,
    embedding: Arc<EmbeddingStage>,
    storage: Arc<StorageStage>,
    embedder: Arc<CachedEmbedder>,
    store: Arc<dyn VectorStore>,
    memory: MemoryGuard,
    checkpoints: CheckpointStore,
    duplicates: DuplicateRegistry,
    cache_path: PathBuf,
    runner: StageRunner,
    batch_size: usize,
    cancel: CancelToken,
    progress: Option<ProgressFn>,
    state: PipelineState,
}

impl Pipeline {
    pub fn builder(config: &Config) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        self.embedder.cache()
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn duplicates(&self) -> &DuplicateRegistry {
        &self.duplicates
    }

    /// Process everything under `root`. With `resume`, documents completed
    /// by an earlier, unfinished run are left out; without it any previous
    /// checkpoint is discarded.
    ///
    /// Only setup failures return `Err`; per-document problems end up in
    /// the statistics.
    pub async fn run(
        &mut self,
        root: &Path,
        resume: bool,
    ) -> Result<PipelineStatistics, PipelineError> {
        let started = Instant::now();
        let mut stats = PipelineStatistics::default();

        if let Err(e) = self.start().await {
            self.state = PipelineState::Aborted(e.to_string());
            return Err(e);
        }

        self.state = PipelineState::Discovering;
        let discovery = match self.source.discover(root, &self.duplicates) {
            Ok(discovery) => discovery,
            Err(e) => {
                self.state = PipelineState::Aborted(e.to_string());
                return Err(e.into());
            }
        };
        stats.discovery = StageStats {
            processed: discovery.documents.len() as u64,
            failed: discovery.failed as u64,
            skipped: discovery.skipped() as u64,
        };
        info!(
            "Discovered {} documents ({} skipped, {} unreadable)",
            discovery.documents.len(),
            discovery.skipped(),
            discovery.failed
        );

        let mut documents = discovery.documents;
        let mut completed_keys: Vec<String> = Vec::new();
        let mut batch_number = 0;

        if resume {
            if let Some(checkpoint) = self.checkpoints.load() {
                let done = checkpoint.completed_set();
                let before = documents.len();
                documents.retain(|doc| !done.contains(&doc.key()));
                stats.resumed_skipped = (before - documents.len()) as u64;
                batch_number = checkpoint.current_batch;
                completed_keys = checkpoint.completed_keys;
                info!(
                    "Resuming after batch {}: {} documents already completed, {} remaining",
                    batch_number,
                    stats.resumed_skipped,
                    documents.len()
                );
            }
        } else {
            self.checkpoints.clear();
        }

        let total_batches = batch_number + documents.len().div_ceil(self.batch_size);
        stats.total_batches = total_batches;

        let mut remaining = documents.into_iter().peekable();
        while remaining.peek().is_some() {
            if self.cancel.is_cancelled() {
                stats.interrupted = true;
                break;
            }

            let batch: Vec<DocumentRecord> = remaining.by_ref().take(self.batch_size).collect();
            batch_number += 1;
            self.state = PipelineState::StreamingBatches {
                batch: batch_number,
                total: total_batches,
            };

            let result = self
                .process_batch(
                    batch,
                    (batch_number, total_batches),
                    root,
                    &mut completed_keys,
                    &mut stats,
                )
                .await;
            match result {
                BatchResult::Finished => stats.batches_completed += 1,
                BatchResult::Interrupted => {
                    stats.interrupted = true;
                    break;
                }
            }
        }
        drop(remaining);

        if stats.interrupted {
            warn!(
                "Run interrupted after {} batches; checkpoint kept at {}",
                stats.batches_completed,
                self.checkpoints.path().display()
            );
            self.flush();
            self.state = PipelineState::Interrupted;
        } else {
            self.state = PipelineState::Finalizing;
            self.flush();
            self.memory.release(true);
            self.checkpoints.clear();
            self.state = PipelineState::Done;
        }

        stats.store_totals = match self.store.totals().await {
            Ok(totals) => totals,
            Err(e) => {
                warn!("Could not read store totals: {}", e);
                Default::default()
            }
        };
        stats.set_cache(self.embedder.cache().stats());
        stats.memory_releases = self.memory.releases();
        stats.duration_ms = started.elapsed().as_millis() as u64;
        Ok(stats)
    }

    /// Store reachable, collection present, cache warm.
    async fn start(&self) -> Result<(), PipelineError> {
        match self.store.health_check().await {
            Ok(true) => {}
            Ok(false) => {
                return Err(PipelineError::Aborted(format!(
                    "vector store collection '{}' is not reachable",
                    self.store.collection()
                )));
            }
            Err(e) => return Err(e.into()),
        }
        self.store.ensure_collection().await?;

        self.embedder.cache().load(&self.cache_path);
        Ok(())
    }

    async fn process_batch(
        &self,
        batch: Vec<DocumentRecord>,
        (number, total): (usize, usize),
        root: &Path,
        completed_keys: &mut Vec<String>,
        stats: &mut PipelineStatistics,
    ) -> BatchResult {
        let size = batch.len();
        info!("Batch {}/{}: {} documents", number, total, size);
        self.memory.log_usage(&format!("before batch {number}"));

        let extracted = self.runner.run(self.extraction.clone(), batch).await;
        stats.extraction.merge(&extracted.stats);

        let ocr = self.runner.run(self.ocr.clone(), extracted.documents).await;
        stats.ocr.merge(&ocr.stats);
        if self.cancel.is_cancelled() {
            return BatchResult::Interrupted;
        }

        let embedded = self.runner.run(self.embedding.clone(), ocr.documents).await;
        stats.embedding.merge(&embedded.stats);
        if self.cancel.is_cancelled() {
            return BatchResult::Interrupted;
        }

        let stored = self.runner.run(self.storage.clone(), embedded.documents).await;
        stats.storage.merge(&stored.stats);

        let documents = stored.documents;
        let mut completed = 0;
        for doc in &documents {
            if doc.is_completed() {
                completed += 1;
                stats.chunks_stored += doc.chunks.len() as u64;
                completed_keys.push(doc.key());
                if let Some(hash) = &doc.file_hash {
                    self.duplicates.record(hash.clone());
                }
            } else if doc.is_failed() {
                stats.documents_failed += 1;
                debug!("{} failed: {}", doc.key(), doc.errors.join("; "));
            }
        }
        stats.documents_completed += completed as u64;

        self.flush();

        let mut metadata = Metadata::new();
        metadata.insert("input".to_string(), Value::String(root.display().to_string()));
        metadata.insert("batch_size".to_string(), Value::from(self.batch_size));
        if let Err(e) = self.checkpoints.save(completed_keys, number, total, metadata) {
            error!("Failed to save checkpoint: {}", e);
        }

        drop(documents);
        self.memory.release(false);
        if !self.memory.within_limit(false) {
            self.memory.release(true);
        }

        if let Some(progress) = &self.progress {
            progress(BatchProgress {
                batch: number,
                total_batches: total,
                documents: size,
                completed,
            });
        }
        info!(
            "Batch {}/{} done: {} of {} documents completed",
            number, total, completed, size
        );
        BatchResult::Finished
    }

    /// Persist the embedding cache and duplicate hashes. Failures are
    /// logged and otherwise ignored.
    fn flush(&self) {
        match self.embedder.cache().save(&self.cache_path) {
            Ok(saved) => debug!("Saved {} cached embeddings", saved),
            Err(e) => warn!("Failed to save embedding cache: {}", e),
        }
        if let Err(e) = self.duplicates.save() {
            warn!("Failed to save duplicate hashes: {}", e);
        }
    }
}
