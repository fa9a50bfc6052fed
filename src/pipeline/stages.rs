//! The four document transforms: extraction, OCR, embedding and storage.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use super::runner::{Stage, StageOutcome};
use crate::extract::{ExtractInput, ExtractorRegistry, OcrChain};
use crate::models::{Chunk, DocumentRecord, META_REQUIRES_OCR};
use crate::services::{CachedEmbedder, ChunkRecord, TextChunker, VectorStore, flatten_metadata};
use crate::utils::retry::{RetryConfig, with_retry};
use crate::utils::text::has_meaningful_content;

/// Sets `content` from the registry's extractors, or flags the document
/// for OCR. Binary payloads are read here, for the current batch only, and
/// kept afterwards only when OCR still needs them.
pub struct ExtractionStage {
    registry: Arc<ExtractorRegistry>,
}

impl ExtractionStage {
    pub fn new(registry: Arc<ExtractorRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Stage for ExtractionStage {
    fn name(&self) -> &str {
        "extraction"
    }

    async fn process(&self, mut doc: DocumentRecord) -> StageOutcome {
        if !self.registry.supports(doc.kind) {
            let reason = format!("no extractor for {}", doc.kind);
            return StageOutcome::Skipped(doc, reason);
        }

        let raw = match doc.raw.take() {
            Some(raw) => Some(raw),
            None if doc.kind.is_binary() => match tokio::fs::read(&doc.path).await {
                Ok(bytes) => Some(bytes),
                Err(e) => return StageOutcome::Failed(doc, format!("cannot read file: {e}")),
            },
            None => None,
        };

        let input = ExtractInput {
            path: doc.path.clone(),
            kind: doc.kind,
            raw: raw.map(Arc::new),
        };

        let extracted = match self.registry.extract(&input).await {
            Ok(extracted) => extracted,
            Err(e) => return StageOutcome::Failed(doc, e.to_string()),
        };

        doc.metadata.extend(extracted.metadata);

        if extracted.requires_ocr {
            doc.set_meta(META_REQUIRES_OCR, true);
            doc.raw = input
                .raw
                .map(|raw| Arc::try_unwrap(raw).unwrap_or_else(|shared| (*shared).clone()));
            return StageOutcome::Processed(doc);
        }

        if !has_meaningful_content(&extracted.content) {
            return StageOutcome::Skipped(doc, "no text content".to_string());
        }
        doc.content = Some(extracted.content);
        StageOutcome::Processed(doc)
    }
}

/// Runs the OCR chain over documents extraction flagged, replacing their
/// content. Applies to nothing else.
pub struct OcrStage {
    chain: Arc<OcrChain>,
}

impl OcrStage {
    pub fn new(chain: Arc<OcrChain>) -> Self {
        Self { chain }
    }
}

#[async_trait]
impl Stage for OcrStage {
    fn name(&self) -> &str {
        "ocr"
    }

    fn applies(&self, doc: &DocumentRecord) -> bool {
        doc.requires_ocr() && doc.content.is_none()
    }

    async fn process(&self, mut doc: DocumentRecord) -> StageOutcome {
        let Some(raw) = doc.raw.take() else {
            return StageOutcome::Failed(doc, "raw data already released".to_string());
        };

        let result = match self.chain.recognize(doc.kind, Arc::new(raw)).await {
            Ok(result) => result,
            Err(e) => return StageOutcome::Failed(doc, e.to_string()),
        };

        info!(
            "OCR {}: {} chars via {} (confidence {:.1})",
            doc.file_name(),
            result.text.len(),
            result.engine,
            result.confidence
        );

        doc.ocr_confidence = Some(result.confidence);
        doc.set_meta("ocr_method", result.engine);
        doc.set_meta("ocr_confidence", f64::from(result.confidence));

        if !has_meaningful_content(&result.text) {
            return StageOutcome::Skipped(doc, "OCR found no text".to_string());
        }
        doc.content = Some(result.text);
        StageOutcome::Processed(doc)
    }
}

/// Chunks the content and attaches a vector to every chunk. A document
/// left with any chunk unembedded is failed; the chunks that did get
/// vectors keep them.
pub struct EmbeddingStage {
    chunker: TextChunker,
    embedder: Arc<CachedEmbedder>,
}

impl EmbeddingStage {
    pub fn new(chunker: TextChunker, embedder: Arc<CachedEmbedder>) -> Self {
        Self { chunker, embedder }
    }
}

#[async_trait]
impl Stage for EmbeddingStage {
    fn name(&self) -> &str {
        "embedding"
    }

    async fn process(&self, mut doc: DocumentRecord) -> StageOutcome {
        let Some(content) = doc.content.as_deref() else {
            return StageOutcome::Skipped(doc, "no content".to_string());
        };

        let mut chunks = self.chunker.chunk(content, &doc.metadata);
        if chunks.is_empty() {
            return StageOutcome::Skipped(doc, "no chunk above the minimum size".to_string());
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let outcome = self.embedder.embed(&texts).await;
        debug!(
            "{}: {} chunks, {} cache hits, {} misses",
            doc.file_name(),
            chunks.len(),
            outcome.cache_hits,
            outcome.cache_misses
        );

        let complete = outcome.is_complete();
        let embedded = outcome.embedded();
        for (chunk, vector) in chunks.iter_mut().zip(outcome.vectors) {
            chunk.embedding = vector;
        }
        let total = chunks.len();
        doc.set_meta("num_chunks", total);
        doc.chunks = chunks;

        if !complete {
            let cause = outcome.error.unwrap_or_else(|| "unknown error".to_string());
            return StageOutcome::Failed(
                doc,
                format!("embedded {embedded} of {total} chunks: {cause}"),
            );
        }
        StageOutcome::Processed(doc)
    }
}

/// Replaces the document's stored chunks with the new ones, then marks the
/// document completed. Transient store errors are retried.
pub struct StorageStage {
    store: Arc<dyn VectorStore>,
    retry: RetryConfig,
}

impl StorageStage {
    pub fn new(store: Arc<dyn VectorStore>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }
}

#[async_trait]
impl Stage for StorageStage {
    fn name(&self) -> &str {
        "storage"
    }

    async fn process(&self, mut doc: DocumentRecord) -> StageOutcome {
        if doc.chunks.is_empty() {
            return StageOutcome::Skipped(doc, "no chunks".to_string());
        }
        if !doc.fully_embedded() {
            return StageOutcome::Skipped(doc, "chunks without vectors".to_string());
        }

        let source = doc.key();
        let records: Vec<ChunkRecord> = doc
            .chunks
            .iter_mut()
            .filter_map(|chunk| {
                let vector = chunk.embedding.take()?;
                let id = Chunk::generate_id(&source, chunk.index);
                chunk.storage_id = Some(id.clone());
                Some(ChunkRecord {
                    id,
                    vector,
                    text: chunk.text.clone(),
                    metadata: flatten_metadata(&chunk.metadata),
                })
            })
            .collect();

        // A shorter re-ingest must not leave the old tail behind.
        let result = with_retry(&self.retry, || {
            let store = self.store.clone();
            let source = source.clone();
            let records = records.clone();
            async move {
                store.delete_by_source(&source).await?;
                store.insert(records).await
            }
        })
        .await
        .into_result();

        match result {
            Ok(inserted) => {
                debug!("Stored {} chunks for {}", inserted, doc.file_name());
                doc.set_meta("stored_chunks", Value::from(inserted));
                doc.mark_completed();
                StageOutcome::Processed(doc)
            }
            Err(e) => {
                for chunk in &mut doc.chunks {
                    chunk.storage_id = None;
                }
                StageOutcome::Failed(doc, e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkingConfig, EmbeddingConfig, FileKind};
    use crate::services::{EmbeddingCache, EmbeddingProvider, MemoryStore, MetadataFilter};
    use crate::error::EmbeddingError;

    struct LengthProvider;

    #[async_trait]
    impl EmbeddingProvider for LengthProvider {
        fn model_name(&self) -> &str {
            "length"
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Ok(texts
                .iter()
                .map(|t| vec![t.len() as f32, 1.0, 0.5])
                .collect())
        }
    }

    fn embedder() -> Arc<CachedEmbedder> {
        let config = EmbeddingConfig {
            request_delay_ms: 0,
            ..Default::default()
        };
        Arc::new(CachedEmbedder::new(
            Arc::new(LengthProvider),
            Arc::new(EmbeddingCache::new(100)),
            &config,
        ))
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig::new(2).with_initial_delay(std::time::Duration::from_millis(1))
    }

    fn chunker() -> TextChunker {
        TextChunker::new(&ChunkingConfig {
            chunk_size: 50,
            chunk_overlap: 10,
            min_chunk_size: 10,
            chars_per_token: 1,
        })
    }

    #[tokio::test]
    async fn test_extraction_sets_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "some extracted words").unwrap();

        let stage = ExtractionStage::new(Arc::new(ExtractorRegistry::with_defaults()));
        match stage.process(DocumentRecord::new(&path, FileKind::Text)).await {
            StageOutcome::Processed(doc) => {
                assert_eq!(doc.content.as_deref(), Some("some extracted words"));
                assert!(!doc.requires_ocr());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_extraction_flags_images_and_keeps_payload() {
        let stage = ExtractionStage::new(Arc::new(ExtractorRegistry::with_defaults()));
        let mut doc = DocumentRecord::new("/scan.png", FileKind::Image);
        doc.raw = Some(vec![1, 2, 3]);

        match stage.process(doc).await {
            StageOutcome::Processed(doc) => {
                assert!(doc.requires_ocr());
                assert_eq!(doc.raw.as_deref(), Some(&[1u8, 2, 3][..]));
                assert!(doc.content.is_none());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_extraction_reads_binary_payload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.png");
        std::fs::write(&path, [0x89, b'P', b'N', b'G']).unwrap();

        let stage = ExtractionStage::new(Arc::new(ExtractorRegistry::with_defaults()));
        match stage.process(DocumentRecord::new(&path, FileKind::Image)).await {
            StageOutcome::Processed(doc) => {
                assert!(doc.requires_ocr());
                assert_eq!(doc.raw.as_deref(), Some(&[0x89, b'P', b'N', b'G'][..]));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let missing = DocumentRecord::new(dir.path().join("gone.pdf"), FileKind::Pdf);
        assert!(matches!(stage.process(missing).await, StageOutcome::Failed(..)));
    }

    #[tokio::test]
    async fn test_extraction_skips_empty_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blank.txt");
        std::fs::write(&path, "  \n\n ").unwrap();

        let stage = ExtractionStage::new(Arc::new(ExtractorRegistry::with_defaults()));
        let outcome = stage.process(DocumentRecord::new(&path, FileKind::Text)).await;
        assert!(matches!(outcome, StageOutcome::Skipped(..)));
    }

    #[tokio::test]
    async fn test_extraction_failure_is_an_outcome() {
        let stage = ExtractionStage::new(Arc::new(ExtractorRegistry::with_defaults()));
        let outcome = stage
            .process(DocumentRecord::new("/does/not/exist.txt", FileKind::Text))
            .await;
        assert!(matches!(outcome, StageOutcome::Failed(..)));
    }

    #[tokio::test]
    async fn test_ocr_stage_only_applies_to_flagged() {
        let stage = OcrStage::new(Arc::new(OcrChain::new()));
        let mut doc = DocumentRecord::new("/scan.png", FileKind::Image);
        assert!(!stage.applies(&doc));
        doc.set_meta(META_REQUIRES_OCR, true);
        assert!(stage.applies(&doc));

        // No engines configured and no payload: both fail cleanly.
        assert!(matches!(stage.process(doc.clone()).await, StageOutcome::Failed(..)));
        doc.raw = Some(vec![0x89, b'P', b'N', b'G']);
        assert!(matches!(stage.process(doc).await, StageOutcome::Failed(..)));
    }

    #[tokio::test]
    async fn test_embed_then_store() {
        let mut doc = DocumentRecord::new("/notes.txt", FileKind::Text);
        doc.content = Some("word ".repeat(40));

        let doc = match EmbeddingStage::new(chunker(), embedder()).process(doc).await {
            StageOutcome::Processed(doc) => doc,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert!(doc.chunks.len() > 1);
        assert!(doc.fully_embedded());

        let store = Arc::new(MemoryStore::new("test"));
        let chunk_count = doc.chunks.len();
        let doc = match StorageStage::new(store.clone(), fast_retry()).process(doc).await {
            StageOutcome::Processed(doc) => doc,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert!(doc.is_completed());
        assert!(doc.chunks.iter().all(|c| c.storage_id.is_some()));
        assert_eq!(store.count().await.unwrap(), chunk_count as u64);
    }

    #[tokio::test]
    async fn test_embedding_skips_short_content() {
        let mut doc = DocumentRecord::new("/tiny.txt", FileKind::Text);
        doc.content = Some("tiny".to_string());
        let outcome = EmbeddingStage::new(chunker(), embedder()).process(doc).await;
        assert!(matches!(outcome, StageOutcome::Skipped(..)));
    }

    #[tokio::test]
    async fn test_storage_replaces_previous_chunks_of_source() {
        let store = Arc::new(MemoryStore::new("test"));
        let stage = StorageStage::new(store.clone(), fast_retry());

        let mut long = DocumentRecord::new("/notes.txt", FileKind::Text);
        long.content = Some("alpha ".repeat(60));
        let long = match EmbeddingStage::new(chunker(), embedder()).process(long).await {
            StageOutcome::Processed(doc) => doc,
            other => panic!("unexpected outcome: {other:?}"),
        };
        let long_chunks = long.chunks.len();
        assert!(long_chunks > 2);
        assert!(matches!(stage.process(long).await, StageOutcome::Processed(_)));
        assert_eq!(store.count().await.unwrap(), long_chunks as u64);

        let mut short = DocumentRecord::new("/notes.txt", FileKind::Text);
        short.content = Some("omega ".repeat(12));
        let short = match EmbeddingStage::new(chunker(), embedder()).process(short).await {
            StageOutcome::Processed(doc) => doc,
            other => panic!("unexpected outcome: {other:?}"),
        };
        let short_chunks = short.chunks.len();
        assert!(short_chunks < long_chunks);
        assert!(matches!(stage.process(short).await, StageOutcome::Processed(_)));

        assert_eq!(store.count().await.unwrap(), short_chunks as u64);
        let stored = store
            .get(&MetadataFilter::source_file("/notes.txt"), None)
            .await
            .unwrap();
        assert!(stored.iter().all(|m| m.text.contains("omega")));
    }

    #[tokio::test]
    async fn test_storage_failure_keeps_document_pending_for_runner() {
        let store = Arc::new(MemoryStore::new("down"));
        store.set_available(false);

        let mut doc = DocumentRecord::new("/a.txt", FileKind::Text);
        let mut chunk = Chunk::new("x".repeat(20), 0, &doc.metadata, 1);
        chunk.embedding = Some(vec![1.0, 0.0, 0.0]);
        doc.chunks.push(chunk);

        match StorageStage::new(store, fast_retry()).process(doc).await {
            StageOutcome::Failed(doc, _) => {
                assert!(!doc.is_completed());
                assert!(doc.chunks[0].storage_id.is_none());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
