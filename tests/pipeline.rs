use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use docstream::error::EmbeddingError;
use docstream::models::{ChunkingConfig, Config, DocumentRecord, FileKind, Metadata};
use docstream::pipeline::{
    CancelToken, EmbeddingStage, Pipeline, PipelineState, Stage, StageOutcome,
};
use docstream::services::{
    CachedEmbedder, EmbeddingCache, EmbeddingProvider, MemoryStore, TextChunker, VectorStore,
};

/// Same text, same vector.
fn vector_for(text: &str) -> Vec<f32> {
    let sum: u32 = text.bytes().map(u32::from).sum();
    vec![text.len() as f32, (sum % 997) as f32, 1.0]
}

#[derive(Default)]
struct MockProvider {
    calls: AtomicUsize,
    /// Cancel this token when the given call number starts.
    cancel_on_call: Option<(usize, CancelToken)>,
    /// Fail every request once this many texts have been served.
    fail_after: Option<usize>,
    served: AtomicUsize,
}

impl MockProvider {
    fn cancelling_on(call: usize, token: CancelToken) -> Self {
        Self {
            cancel_on_call: Some((call, token)),
            ..Default::default()
        }
    }

    fn failing_after(texts: usize) -> Self {
        Self {
            fail_after: Some(texts),
            ..Default::default()
        }
    }
}

#[async_trait]
impl EmbeddingProvider for MockProvider {
    fn model_name(&self) -> &str {
        "mock"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((at, token)) = &self.cancel_on_call
            && call == *at
        {
            token.cancel();
        }
        if let Some(limit) = self.fail_after
            && self.served.load(Ordering::SeqCst) + texts.len() > limit
        {
            return Err(EmbeddingError::ServerError("status 503: unavailable".into()));
        }
        self.served.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| vector_for(t)).collect())
    }
}

fn config(state: &Path) -> Config {
    let mut config = Config::default();
    config.directories.state = state.to_path_buf();
    config.embedding.request_delay_ms = 0;
    config.embedding.initial_backoff_ms = 1;
    config.embedding.max_backoff_ms = 2;
    config.ocr.tesseract.enabled = false;
    config.ocr.vision.enabled = false;
    config.chunking.chunk_size = 60;
    config.chunking.chunk_overlap = 10;
    config.chunking.min_chunk_size = 10;
    config.chunking.chars_per_token = 1;
    config.pipeline.stream_batch_size = 2;
    config
}

fn write_docs(dir: &Path, count: usize) {
    for i in 0..count {
        let body: String = (0..6)
            .map(|s| format!("Document {i} sentence {s} talks about topic {}. ", i * 7 + s))
            .collect();
        std::fs::write(dir.join(format!("doc{i:02}.txt")), body).unwrap();
    }
}

fn stored_ids(store: &MemoryStore) -> BTreeSet<String> {
    store.records().into_iter().map(|r| r.id).collect()
}

#[tokio::test]
async fn test_resume_after_interrupt_matches_uninterrupted_run() {
    let input = tempfile::tempdir().unwrap();
    write_docs(input.path(), 6);

    // Reference: one uninterrupted run.
    let reference_state = tempfile::tempdir().unwrap();
    let mut reference_config = config(reference_state.path());
    reference_config.pipeline.parallel = false;
    reference_config.pipeline.skip_duplicates = false;
    let reference_store = Arc::new(MemoryStore::new("reference"));
    let mut reference = Pipeline::builder(&reference_config)
        .provider(Arc::new(MockProvider::default()))
        .store(reference_store.clone())
        .build()
        .unwrap();
    let reference_stats = reference.run(input.path(), false).await.unwrap();
    assert_eq!(reference_stats.documents_completed, 6);

    // Interrupted run: the third provider call belongs to batch 2, which is
    // abandoned before storage.
    let state = tempfile::tempdir().unwrap();
    let mut config = config(state.path());
    config.pipeline.parallel = false;
    config.pipeline.skip_duplicates = false;
    let store = Arc::new(MemoryStore::new("resumed"));
    let token = CancelToken::new();
    let mut first = Pipeline::builder(&config)
        .provider(Arc::new(MockProvider::cancelling_on(3, token.clone())))
        .store(store.clone())
        .cancel_token(token)
        .build()
        .unwrap();

    let stats = first.run(input.path(), true).await.unwrap();
    assert!(stats.interrupted);
    assert_eq!(first.state(), &PipelineState::Interrupted);
    assert_eq!(stats.batches_completed, 1);
    assert_eq!(stats.documents_completed, 2);

    let checkpoint = first.checkpoints().load().expect("checkpoint kept");
    assert_eq!(checkpoint.current_batch, 1);
    assert_eq!(checkpoint.completed_keys.len(), 2);
    assert!(checkpoint.completed_keys[0].ends_with("doc00.txt"));
    assert!(checkpoint.completed_keys[1].ends_with("doc01.txt"));
    let completed_before = checkpoint.completed_set();

    // Resume with a fresh pipeline over the same state.
    let mut second = Pipeline::builder(&config)
        .provider(Arc::new(MockProvider::default()))
        .store(store.clone())
        .build()
        .unwrap();
    let resumed = second.run(input.path(), true).await.unwrap();

    assert_eq!(second.state(), &PipelineState::Done);
    assert_eq!(resumed.resumed_skipped, 2);
    assert_eq!(resumed.extraction.processed, 4);
    assert_eq!(resumed.documents_completed, 4);
    assert_eq!(resumed.total_batches, 3);
    assert_eq!(resumed.batches_completed, 2);
    assert!(!second.checkpoints().exists());

    let reprocessed: BTreeSet<String> = store
        .records()
        .into_iter()
        .filter_map(|r| r.source_file().map(str::to_string))
        .filter(|source| !completed_before.contains(source))
        .collect();
    assert_eq!(reprocessed.len(), 4);

    assert_eq!(
        store.count().await.unwrap(),
        reference_store.count().await.unwrap()
    );
    assert_eq!(stored_ids(&store), stored_ids(&reference_store));
}

#[tokio::test]
async fn test_partial_embedding_keeps_vectors_and_skips_storage() {
    let state = tempfile::tempdir().unwrap();
    let mut config = config(state.path());
    config.embedding.request_batch_size = 1;
    config.embedding.max_retries = 2;

    let content: String = (0..8)
        .map(|s| format!("Sentence number {s} of the partially embedded document. "))
        .collect();
    let mut doc = DocumentRecord::new("/in/partial.txt", FileKind::Text);
    doc.content = Some(content.clone());

    let expected_chunks = TextChunker::new(&config.chunking)
        .chunk(&content, &Metadata::new())
        .len();
    assert!(expected_chunks > 2);

    let cache = Arc::new(EmbeddingCache::new(100));
    let embedder = Arc::new(CachedEmbedder::new(
        Arc::new(MockProvider::failing_after(2)),
        cache.clone(),
        &config.embedding,
    ));
    let stage = EmbeddingStage::new(TextChunker::new(&config.chunking), embedder);

    let StageOutcome::Failed(doc, error) = stage.process(doc).await else {
        panic!("incomplete embedding must fail the document");
    };
    assert!(error.starts_with(&format!("embedded 2 of {expected_chunks} chunks")));
    assert_eq!(doc.chunks.len(), expected_chunks);
    assert!(doc.chunks[..2].iter().all(|c| c.embedding.is_some()));
    assert!(doc.chunks[2..].iter().all(|c| c.embedding.is_none()));
    assert_eq!(
        doc.chunks[0].embedding.as_deref(),
        Some(vector_for(&doc.chunks[0].text).as_slice())
    );
    assert_eq!(cache.size(), 2);

    // Through the whole pipeline nothing of that document is stored, and
    // the run still finishes.
    let input = tempfile::tempdir().unwrap();
    std::fs::write(input.path().join("partial.txt"), &content).unwrap();
    let store = Arc::new(MemoryStore::new("partial"));
    let mut pipeline = Pipeline::builder(&config)
        .provider(Arc::new(MockProvider::failing_after(2)))
        .store(store.clone())
        .build()
        .unwrap();

    let stats = pipeline.run(input.path(), false).await.unwrap();
    assert_eq!(pipeline.state(), &PipelineState::Done);
    assert_eq!(stats.embedding.failed, 1);
    assert_eq!(stats.documents_failed, 1);
    assert_eq!(stats.storage.processed, 0);
    assert_eq!(store.count().await.unwrap(), 0);
    assert_eq!(pipeline.duplicates().len(), 0);
}

#[tokio::test]
async fn test_parallel_and_sequential_store_the_same_chunks() {
    let input = tempfile::tempdir().unwrap();
    write_docs(input.path(), 8);

    let mut snapshots = Vec::new();
    for parallel in [false, true] {
        let state = tempfile::tempdir().unwrap();
        let mut config = config(state.path());
        config.pipeline.parallel = parallel;
        config.pipeline.max_workers = 4;
        config.pipeline.stream_batch_size = 3;

        let store = Arc::new(MemoryStore::new("equivalence"));
        let mut pipeline = Pipeline::builder(&config)
            .provider(Arc::new(MockProvider::default()))
            .store(store.clone())
            .build()
            .unwrap();
        let stats = pipeline.run(input.path(), false).await.unwrap();
        assert_eq!(stats.documents_completed, 8);

        let mut chunks: Vec<(String, Vec<u32>)> = store
            .records()
            .into_iter()
            .map(|r| (r.text, r.vector.iter().map(|v| v.to_bits()).collect()))
            .collect();
        chunks.sort();
        snapshots.push(chunks);
    }

    assert!(!snapshots[0].is_empty());
    assert_eq!(snapshots[0], snapshots[1]);
}

#[tokio::test]
async fn test_single_document_end_to_end() {
    let state = tempfile::tempdir().unwrap();
    let mut config = config(state.path());
    config.chunking.chunk_size = 800;
    config.chunking.chunk_overlap = 200;
    config.chunking.min_chunk_size = 100;

    let content: String = "The quick brown fox jumps over the lazy dog. "
        .repeat(60)
        .chars()
        .take(2500)
        .collect();
    assert_eq!(content.chars().count(), 2500);

    let input = tempfile::tempdir().unwrap();
    std::fs::write(input.path().join("fox.txt"), &content).unwrap();

    let expected = TextChunker::new(&config.chunking).chunk(&content, &Metadata::new());
    assert!(expected.len() > 1);

    let store = Arc::new(MemoryStore::new("single"));
    let mut pipeline = Pipeline::builder(&config)
        .provider(Arc::new(MockProvider::default()))
        .store(store.clone())
        .build()
        .unwrap();
    let stats = pipeline.run(input.path(), false).await.unwrap();

    assert_eq!(stats.documents_completed, 1);
    assert_eq!(stats.chunks_stored, expected.len() as u64);
    assert_eq!(store.count().await.unwrap(), expected.len() as u64);

    let records = store.records();
    assert!(records.iter().all(|r| r.text.chars().count() >= 100));
    assert!(records.iter().all(|r| r.vector == vector_for(&r.text)));

    let mut indices: Vec<u32> = records
        .iter()
        .filter_map(|r| r.metadata.get("chunk_index").and_then(|v| v.as_i64()))
        .map(|i| i as u32)
        .collect();
    indices.sort_unstable();
    assert_eq!(indices, (0..expected.len() as u32).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_identical_content_is_processed_once() {
    let state = tempfile::tempdir().unwrap();
    let config = config(state.path());
    let store = Arc::new(MemoryStore::new("dedup"));
    let body = "Quarterly report. Revenue grew in every region this year.";

    let first_input = tempfile::tempdir().unwrap();
    std::fs::write(first_input.path().join("a.txt"), body).unwrap();
    std::fs::write(first_input.path().join("b.txt"), body).unwrap();

    let mut pipeline = Pipeline::builder(&config)
        .provider(Arc::new(MockProvider::default()))
        .store(store.clone())
        .build()
        .unwrap();
    let stats = pipeline.run(first_input.path(), false).await.unwrap();
    assert_eq!(stats.discovery.processed, 1);
    assert_eq!(stats.discovery.skipped, 1);
    assert_eq!(stats.documents_completed, 1);

    // A later run sees the same bytes under yet another name.
    let second_input = tempfile::tempdir().unwrap();
    std::fs::write(second_input.path().join("c.txt"), body).unwrap();

    let mut pipeline = Pipeline::builder(&config)
        .provider(Arc::new(MockProvider::default()))
        .store(store.clone())
        .build()
        .unwrap();
    let stats = pipeline.run(second_input.path(), false).await.unwrap();
    assert_eq!(stats.discovery.processed, 0);
    assert_eq!(stats.discovery.skipped, 1);
    assert_eq!(stats.documents_completed, 0);

    let sources: BTreeSet<String> = store
        .records()
        .into_iter()
        .filter_map(|r| r.source_file().map(str::to_string))
        .collect();
    assert_eq!(sources.len(), 1);
    assert!(sources.iter().all(|s| s.ends_with("a.txt")));
}

#[tokio::test]
async fn test_shortened_file_replaces_its_old_chunks() {
    let state = tempfile::tempdir().unwrap();
    let config = config(state.path());
    let store = Arc::new(MemoryStore::new("reingest"));
    let input = tempfile::tempdir().unwrap();
    let path = input.path().join("notes.txt");

    let long: String = (0..12)
        .map(|s| format!("Long draft sentence {s} covers an early idea. "))
        .collect();
    std::fs::write(&path, &long).unwrap();
    let mut pipeline = Pipeline::builder(&config)
        .provider(Arc::new(MockProvider::default()))
        .store(store.clone())
        .build()
        .unwrap();
    pipeline.run(input.path(), false).await.unwrap();
    let long_chunks = store.count().await.unwrap();

    let short = "Final version. Only the summary is left here now.";
    std::fs::write(&path, short).unwrap();
    let expected = TextChunker::new(&config.chunking).chunk(short, &Metadata::new());
    assert!((expected.len() as u64) < long_chunks);

    let mut pipeline = Pipeline::builder(&config)
        .provider(Arc::new(MockProvider::default()))
        .store(store.clone())
        .build()
        .unwrap();
    let stats = pipeline.run(input.path(), false).await.unwrap();
    assert_eq!(stats.documents_completed, 1);

    let records = store.records();
    assert_eq!(records.len(), expected.len());
    assert!(records.iter().all(|r| !r.text.contains("draft")));
    assert!(
        records
            .iter()
            .all(|r| r.source_file().is_some_and(|s| s.ends_with("notes.txt")))
    );
}

#[tokio::test]
async fn test_default_token_ratio_chunks_by_estimated_tokens() {
    let state = tempfile::tempdir().unwrap();
    let mut config = config(state.path());
    config.chunking = ChunkingConfig::default();
    let chunk_chars = (config.chunking.chunk_size * config.chunking.chars_per_token) as usize;

    // Under the default ratio 2,500 characters fit in a single chunk.
    let short: String = "Plain words fill this line. ".repeat(100).chars().take(2500).collect();
    assert_eq!(
        TextChunker::new(&config.chunking)
            .chunk(&short, &Metadata::new())
            .len(),
        1
    );

    let content: String = "Default sized chunks hold several hundred tokens each. "
        .repeat(160)
        .chars()
        .take(8000)
        .collect();
    let input = tempfile::tempdir().unwrap();
    std::fs::write(input.path().join("long.txt"), &content).unwrap();

    let mut expected = TextChunker::new(&config.chunking).chunk(&content, &Metadata::new());
    assert!(expected.len() > 2);
    assert!(expected.iter().all(|c| c.char_count <= chunk_chars));
    assert!(expected.iter().all(|c| c.char_count >= 100));
    assert!(
        expected
            .iter()
            .all(|c| c.token_estimate == c.char_count / config.chunking.chars_per_token as usize)
    );
    for pair in expected.windows(2) {
        let head: String = pair[1].text.chars().take(20).collect();
        assert!(pair[0].text.contains(&head), "consecutive chunks overlap");
    }

    let store = Arc::new(MemoryStore::new("default-ratio"));
    let mut pipeline = Pipeline::builder(&config)
        .provider(Arc::new(MockProvider::default()))
        .store(store.clone())
        .build()
        .unwrap();
    let stats = pipeline.run(input.path(), false).await.unwrap();

    assert_eq!(stats.chunks_stored, expected.len() as u64);
    let mut stored: Vec<String> = store.records().into_iter().map(|r| r.text).collect();
    stored.sort();
    expected.sort_by(|a, b| a.text.cmp(&b.text));
    let expected: Vec<String> = expected.into_iter().map(|c| c.text).collect();
    assert_eq!(stored, expected);
}
