//! Query-side operations over the vector store.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::debug;

use super::embedder::CachedEmbedder;
use super::quotes::{DEFAULT_CONTEXT_CHARS, extract_quotes, reconstruct_document};
use super::vector_store::{MetadataFilter, StoredMatch, VectorStore};
use crate::error::AppError;
use crate::models::{Metadata, SearchQuery, SearchResult, SearchResults};

/// A stored document put back together from its chunks.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentView {
    pub source_file: String,
    pub chunks: usize,
    pub content: String,
    /// Metadata of the first chunk.
    pub metadata: Metadata,
}

pub struct SearchService {
    embedder: Arc<CachedEmbedder>,
    store: Arc<dyn VectorStore>,
}

impl SearchService {
    pub fn new(embedder: Arc<CachedEmbedder>, store: Arc<dyn VectorStore>) -> Self {
        Self { embedder, store }
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResults, AppError> {
        let start = Instant::now();

        let vector = self.embedder.embed_query(&query.query).await?;
        let filter = query.source_file.clone().map(MetadataFilter::source_file);
        let matches = self
            .store
            .query(vector, query.limit as usize, filter.as_ref())
            .await?;
        debug!("Store returned {} matches", matches.len());

        let results = matches
            .into_iter()
            .map(|m| to_result(m, query))
            .filter(|r| query.min_score.is_none_or(|min| r.score >= min))
            .collect();

        Ok(SearchResults::new(
            query.query.clone(),
            results,
            start.elapsed().as_millis() as u64,
        ))
    }

    /// All chunks of `source_file` joined in chunk order, or `None` when
    /// nothing is stored for it.
    pub async fn document(&self, source_file: &str) -> Result<Option<DocumentView>, AppError> {
        let matches = self
            .store
            .get(&MetadataFilter::source_file(source_file), None)
            .await?;
        if matches.is_empty() {
            return Ok(None);
        }

        let mut ordered: Vec<&StoredMatch> = matches.iter().collect();
        ordered.sort_by_key(|m| m.chunk_index().unwrap_or(u32::MAX));
        let metadata = ordered
            .first()
            .map(|m| to_json(m.metadata.clone()))
            .unwrap_or_default();

        let content = reconstruct_document(
            matches
                .iter()
                .map(|m| (m.chunk_index().unwrap_or(u32::MAX), m.text.clone())),
        );

        Ok(Some(DocumentView {
            source_file: source_file.to_string(),
            chunks: matches.len(),
            content,
            metadata,
        }))
    }
}

fn to_json(metadata: super::vector_store::FlatMetadata) -> Metadata {
    metadata.into_iter().map(|(k, v)| (k, v.into())).collect()
}

fn to_result(m: StoredMatch, query: &SearchQuery) -> SearchResult {
    let quotes = if query.with_quotes {
        extract_quotes(&query.query, &m.text, DEFAULT_CONTEXT_CHARS)
    } else {
        Vec::new()
    };
    SearchResult {
        score: m.similarity(),
        source_file: m.source_file().map(str::to_string),
        chunk_index: m.chunk_index(),
        id: m.id,
        distance: m.distance,
        text: m.text,
        metadata: to_json(m.metadata),
        quotes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EmbeddingError;
    use crate::models::{EmbeddingConfig, META_CHUNK_INDEX, META_SOURCE_FILE};
    use crate::services::vector_store::{ChunkRecord, FlatMetadata, Scalar};
    use crate::services::{EmbeddingCache, EmbeddingProvider, MemoryStore};
    use async_trait::async_trait;

    struct AxisProvider;

    #[async_trait]
    impl EmbeddingProvider for AxisProvider {
        fn model_name(&self) -> &str {
            "axis"
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Ok(texts
                .iter()
                .map(|t| {
                    if t.contains("budget") {
                        vec![1.0, 0.0]
                    } else {
                        vec![0.0, 1.0]
                    }
                })
                .collect())
        }
    }

    fn record(source: &str, index: i64, text: &str, vector: Vec<f32>) -> ChunkRecord {
        let mut metadata = FlatMetadata::new();
        metadata.insert(META_SOURCE_FILE.to_string(), Scalar::from(source));
        metadata.insert(META_CHUNK_INDEX.to_string(), Scalar::Int(index));
        ChunkRecord {
            id: format!("{source}:{index}"),
            vector,
            text: text.to_string(),
            metadata,
        }
    }

    async fn service() -> SearchService {
        let store = Arc::new(MemoryStore::new("search"));
        store
            .insert(vec![
                record("/a.txt", 1, "The budget passed. Everyone cheered.", vec![0.9, 0.1]),
                record("/a.txt", 0, "Minutes of the meeting.", vec![0.0, 1.0]),
                record("/b.txt", 0, "Unrelated gardening notes.", vec![0.1, 0.9]),
            ])
            .await
            .unwrap();

        let config = EmbeddingConfig {
            request_delay_ms: 0,
            ..Default::default()
        };
        let embedder = Arc::new(CachedEmbedder::new(
            Arc::new(AxisProvider),
            Arc::new(EmbeddingCache::new(8)),
            &config,
        ));
        SearchService::new(embedder, store)
    }

    #[tokio::test]
    async fn test_search_ranks_and_quotes() {
        let service = service().await;
        let results = service
            .search(&SearchQuery::new("budget").with_limit(2).with_quotes(true))
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        let top = &results.results[0];
        assert_eq!(top.source_file.as_deref(), Some("/a.txt"));
        assert_eq!(top.chunk_index, Some(1));
        assert!(top.score > results.results[1].score);
        assert_eq!(top.quotes[0].quote, "The budget passed.");
        assert_eq!(top.metadata[META_SOURCE_FILE], "/a.txt");
    }

    #[tokio::test]
    async fn test_search_filters() {
        let service = service().await;
        let results = service
            .search(&SearchQuery::new("budget").with_source_file("/b.txt"))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results.results[0].source_file.as_deref(), Some("/b.txt"));

        let results = service
            .search(&SearchQuery::new("budget").with_min_score(0.9))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_document_reconstruction() {
        let service = service().await;
        let view = service.document("/a.txt").await.unwrap().unwrap();
        assert_eq!(view.chunks, 2);
        assert_eq!(
            view.content,
            "Minutes of the meeting.\n\nThe budget passed. Everyone cheered."
        );
        assert_eq!(view.metadata[META_CHUNK_INDEX], 0);
        assert!(service.document("/missing.txt").await.unwrap().is_none());
    }
}
