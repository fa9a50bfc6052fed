//! Embedding, caching, chunking, storage and search services.

pub mod cache;
pub mod chunker;
pub mod embedder;
pub mod embedding;
pub mod quotes;
pub mod search;
pub mod vector_store;

pub use cache::{CacheStats, EmbeddingCache};
pub use chunker::TextChunker;
pub use embedder::{CachedEmbedder, EmbedOutcome, RequestPacer};
pub use embedding::{EmbeddingProvider, HealthResponse, HttpEmbeddingClient};
pub use search::{DocumentView, SearchService};
pub use vector_store::{
    ChunkRecord, FlatMetadata, MemoryStore, MetadataFilter, QdrantBackend, Scalar, StoreTotals,
    StoredMatch, VectorStore, create_backend, flatten_metadata,
};
