//! Error types for the ingestion pipeline.

use thiserror::Error;

use crate::utils::retry::Retryable;

/// Errors related to embedding operations.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("failed to connect to embedding server: {0}")]
    ConnectionError(String),

    #[error("embedding rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("embedding server error: {0}")]
    ServerError(String),

    #[error("embedding request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),

    #[error("embedding timeout")]
    Timeout,
}

impl EmbeddingError {
    /// True when the error carries a rate-limit or quota signature.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            EmbeddingError::RateLimited(_) => true,
            EmbeddingError::ServerError(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("429")
                    || msg.contains("rate limit")
                    || msg.contains("quota")
                    || msg.contains("too many requests")
            }
            _ => false,
        }
    }
}

impl Retryable for EmbeddingError {
    fn is_retryable(&self) -> bool {
        // Every embedding failure is retried up to the attempt bound; the
        // caller degrades to partial results once attempts are exhausted.
        true
    }

    fn is_rate_limited(&self) -> bool {
        EmbeddingError::is_rate_limited(self)
    }
}

/// Errors related to vector store operations.
#[derive(Debug, Error)]
pub enum VectorStoreError {
    #[error("failed to connect to vector store: {0}")]
    ConnectionError(String),

    #[error("collection error: {0}")]
    CollectionError(String),

    #[error("insert error: {0}")]
    InsertError(String),

    #[error("query error: {0}")]
    QueryError(String),

    #[error("delete error: {0}")]
    DeleteError(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl Retryable for VectorStoreError {
    fn is_retryable(&self) -> bool {
        match self {
            VectorStoreError::ConnectionError(_) => true,
            VectorStoreError::CollectionError(msg)
            | VectorStoreError::InsertError(msg)
            | VectorStoreError::QueryError(msg)
            | VectorStoreError::DeleteError(msg) => {
                let msg_lower = msg.to_lowercase();
                msg_lower.contains("timeout")
                    || msg_lower.contains("connection")
                    || msg_lower.contains("unavailable")
                    || msg_lower.contains("too many")
            }
            VectorStoreError::DimensionMismatch { .. } => false,
        }
    }
}

/// Errors raised by text extraction and OCR backends.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("unsupported format: {0}")]
    Unsupported(String),

    #[error("no raw data loaded for {0}")]
    MissingPayload(String),

    #[error("{backend} failed: {message}")]
    Backend { backend: String, message: String },

    #[error("OCR engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("OCR request failed: {0}")]
    RequestError(#[from] reqwest::Error),
}

impl ExtractionError {
    pub fn backend(backend: impl Into<String>, message: impl ToString) -> Self {
        ExtractionError::Backend {
            backend: backend.into(),
            message: message.to_string(),
        }
    }
}

/// Errors related to document discovery.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid input path: {0}")]
    InvalidPath(String),

    #[error("directory walk error: {0}")]
    WalkError(String),

    #[error("file read error: {0}")]
    FileReadError(String),
}

/// Errors reading or writing durable pipeline state (cache, checkpoint,
/// duplicate hashes). Callers log these and carry on as if the state were
/// absent.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("encode error: {0}")]
    EncodeError(#[from] bincode::error::EncodeError),

    #[error("decode error: {0}")]
    DecodeError(#[from] bincode::error::DecodeError),

    #[error("failed to persist {path}: {message}")]
    PersistError { path: String, message: String },
}

/// Errors related to configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    #[error("path error: {0}")]
    PathError(String),

    #[error("missing required configuration: {0}")]
    MissingValue(String),

    #[error("validation error: {0}")]
    ValidationError(String),
}

/// Unrecoverable pipeline errors. Per-item failures never surface here.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("discovery failed: {0}")]
    Discovery(#[from] SourceError),

    #[error("vector store unavailable: {0}")]
    StoreUnavailable(#[from] VectorStoreError),

    #[error("pipeline setup failed: {0}")]
    Setup(String),

    #[error("pipeline aborted: {0}")]
    Aborted(String),
}

/// Application-level errors that wrap domain errors.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("vector store error: {0}")]
    VectorStore(#[from] VectorStoreError),

    #[error("{0}")]
    Other(String),
}
