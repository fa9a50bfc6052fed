//! Vector store abstraction layer.
//!
//! The pipeline talks to storage only through [`VectorStore`]. Metadata is
//! flattened to scalar fields before it reaches a backend.

mod memory;
mod qdrant;

pub use memory::MemoryStore;
pub use qdrant::QdrantBackend;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::VectorStoreError;
use crate::models::{META_CHUNK_INDEX, META_SOURCE_FILE, Metadata, StoreBackend, VectorStoreConfig};

/// A primitive metadata value accepted by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Text(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::Text(s)
    }
}

impl From<i64> for Scalar {
    fn from(n: i64) -> Self {
        Scalar::Int(n)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Bool(b)
    }
}

impl From<Scalar> for Value {
    fn from(scalar: Scalar) -> Self {
        match scalar {
            Scalar::Bool(b) => Value::Bool(b),
            Scalar::Int(n) => Value::from(n),
            Scalar::Float(x) => Value::from(x),
            Scalar::Text(s) => Value::String(s),
        }
    }
}

impl std::fmt::Display for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Int(n) => write!(f, "{n}"),
            Scalar::Float(x) => write!(f, "{x}"),
            Scalar::Text(s) => f.write_str(s),
        }
    }
}

pub type FlatMetadata = BTreeMap<String, Scalar>;

/// Flatten metadata to scalar fields. Lists of strings are joined with
/// `", "`, other nested values become their JSON text, nulls are omitted.
pub fn flatten_metadata(metadata: &Metadata) -> FlatMetadata {
    metadata
        .iter()
        .filter_map(|(key, value)| flatten_value(value).map(|v| (key.clone(), v)))
        .collect()
}

fn flatten_value(value: &Value) -> Option<Scalar> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(Scalar::Bool(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(Scalar::Int(i)),
            None => n.as_f64().map(Scalar::Float),
        },
        Value::String(s) => Some(Scalar::Text(s.clone())),
        Value::Array(items) if items.iter().all(Value::is_string) => Some(Scalar::Text(
            items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(", "),
        )),
        other => Some(Scalar::Text(other.to_string())),
    }
}

/// One chunk ready for persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub text: String,
    pub metadata: FlatMetadata,
}

impl ChunkRecord {
    pub fn source_file(&self) -> Option<&str> {
        self.metadata.get(META_SOURCE_FILE).and_then(Scalar::as_str)
    }
}

/// Equality conditions over flattened fields, all of which must hold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    conditions: Vec<(String, Scalar)>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source_file(source: impl Into<String>) -> Self {
        Self::new().eq(META_SOURCE_FILE, Scalar::Text(source.into()))
    }

    pub fn eq(mut self, key: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.conditions.push((key.into(), value.into()));
        self
    }

    pub fn conditions(&self) -> &[(String, Scalar)] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, metadata: &FlatMetadata) -> bool {
        self.conditions
            .iter()
            .all(|(key, value)| metadata.get(key) == Some(value))
    }
}

/// A stored chunk returned by `query` or `get`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMatch {
    pub id: String,
    pub text: String,
    pub metadata: FlatMetadata,
    /// Cosine distance to the query vector; zero for `get`.
    pub distance: f32,
}

impl StoredMatch {
    pub fn similarity(&self) -> f32 {
        1.0 - self.distance
    }

    pub fn source_file(&self) -> Option<&str> {
        self.metadata.get(META_SOURCE_FILE).and_then(Scalar::as_str)
    }

    pub fn chunk_index(&self) -> Option<u32> {
        self.metadata
            .get(META_CHUNK_INDEX)
            .and_then(Scalar::as_i64)
            .and_then(|n| u32::try_from(n).ok())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreTotals {
    pub chunks: u64,
    pub sources: u64,
}

/// Count distinct sources over a set of matches.
pub(crate) fn count_sources<'a>(sources: impl Iterator<Item = Option<&'a str>>) -> u64 {
    sources.flatten().collect::<BTreeSet<_>>().len() as u64
}

/// Abstract trait for vector store operations.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Check if the vector store is reachable.
    async fn health_check(&self) -> Result<bool, VectorStoreError>;

    /// Create the collection if it doesn't exist.
    async fn ensure_collection(&self) -> Result<(), VectorStoreError>;

    /// Insert chunks. Records with an existing id replace it.
    async fn insert(&self, records: Vec<ChunkRecord>) -> Result<usize, VectorStoreError>;

    /// Nearest neighbours of `vector`, closest first.
    async fn query(
        &self,
        vector: Vec<f32>,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<StoredMatch>, VectorStoreError>;

    /// All chunks matching `filter`, up to `limit`.
    async fn get(
        &self,
        filter: &MetadataFilter,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMatch>, VectorStoreError>;

    async fn count(&self) -> Result<u64, VectorStoreError>;

    /// Stored chunk count and number of distinct source files.
    async fn totals(&self) -> Result<StoreTotals, VectorStoreError>;

    async fn delete_by_source(&self, source_file: &str) -> Result<(), VectorStoreError>;

    /// Drop every stored chunk and recreate an empty collection.
    async fn reset(&self) -> Result<(), VectorStoreError>;

    /// Get the collection name.
    fn collection(&self) -> &str;
}

/// Create the configured vector store backend.
pub fn create_backend(
    config: &VectorStoreConfig,
    embedding_dim: u64,
) -> Result<Arc<dyn VectorStore>, VectorStoreError> {
    match config.backend {
        StoreBackend::Qdrant => Ok(Arc::new(QdrantBackend::new(config, embedding_dim)?)),
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new(&config.collection))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flatten_metadata() {
        let meta = json!({
            "title": "Minutes",
            "pages": 12,
            "ratio": 0.5,
            "requires_ocr": false,
            "tags": ["finance", "q3"],
            "author": null,
            "page_info": [{"page": 1, "chars": 200}],
            "headers": {"from": "a@b.c"}
        });
        let flat = flatten_metadata(meta.as_object().unwrap());

        assert_eq!(flat["title"], Scalar::Text("Minutes".into()));
        assert_eq!(flat["pages"], Scalar::Int(12));
        assert_eq!(flat["ratio"], Scalar::Float(0.5));
        assert_eq!(flat["requires_ocr"], Scalar::Bool(false));
        assert_eq!(flat["tags"], Scalar::Text("finance, q3".into()));
        assert!(!flat.contains_key("author"));
        let page_info = flat["page_info"].as_str().unwrap();
        assert!(page_info.starts_with('['));
        assert!(page_info.contains(r#""page":1"#));
        assert_eq!(flat["headers"], Scalar::Text(r#"{"from":"a@b.c"}"#.into()));
    }

    #[test]
    fn test_filter_matches() {
        let mut flat = FlatMetadata::new();
        flat.insert("source_file".into(), "/a.pdf".into());
        flat.insert("chunk_index".into(), Scalar::Int(2));

        assert!(MetadataFilter::new().matches(&flat));
        assert!(MetadataFilter::source_file("/a.pdf").matches(&flat));
        assert!(
            MetadataFilter::source_file("/a.pdf")
                .eq("chunk_index", 2i64)
                .matches(&flat)
        );
        assert!(!MetadataFilter::source_file("/b.pdf").matches(&flat));
    }

    #[test]
    fn test_stored_match_accessors() {
        let mut metadata = FlatMetadata::new();
        metadata.insert(META_SOURCE_FILE.into(), "/a.txt".into());
        metadata.insert(META_CHUNK_INDEX.into(), Scalar::Int(4));
        let m = StoredMatch {
            id: "x".into(),
            text: "t".into(),
            metadata,
            distance: 0.25,
        };
        assert_eq!(m.similarity(), 0.75);
        assert_eq!(m.source_file(), Some("/a.txt"));
        assert_eq!(m.chunk_index(), Some(4));
    }
}
