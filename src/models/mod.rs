mod config;
mod document;
mod search;

pub use config::{
    CACHE_FILE, CHECKPOINT_FILE, ChunkingConfig, Config, DEFAULT_COLLECTION,
    DEFAULT_EMBEDDING_DIMENSION, DEFAULT_EMBEDDING_MODEL, DEFAULT_EMBEDDING_URL,
    DEFAULT_QDRANT_URL, DirectoriesConfig, EmbeddingConfig, HASHES_FILE, MemoryConfig, OcrConfig,
    PipelineConfig, SearchConfig, StoreBackend, TesseractConfig, VectorStoreConfig, VisionConfig,
};
pub use document::{
    Chunk, DocumentRecord, FileKind, META_CHUNK_INDEX, META_FILE_TYPE, META_REQUIRES_OCR,
    META_SOURCE_FILE, Metadata, ProcessingStatus,
};
pub use search::{OutputFormat, SearchQuery, SearchResult, SearchResults};
