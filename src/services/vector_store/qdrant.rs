//! Qdrant vector store backend implementation.

use async_trait::async_trait;
use qdrant_client::Qdrant;
use qdrant_client::qdrant::point_id::PointIdOptions;
use qdrant_client::qdrant::value::Kind;
use qdrant_client::qdrant::{
    Condition, CountPointsBuilder, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter,
    PayloadIncludeSelector, PointId, PointStruct, Range, ScrollPointsBuilder, SearchPointsBuilder,
    UpsertPointsBuilder, Value as QdrantValue, VectorParamsBuilder,
};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use super::{
    ChunkRecord, FlatMetadata, MetadataFilter, Scalar, StoreTotals, StoredMatch, VectorStore,
};
use crate::error::VectorStoreError;
use crate::models::{META_SOURCE_FILE, VectorStoreConfig};

/// Payload field holding the chunk text. Metadata keys starting with `_`
/// are stored with one more `_` so they can never collide with it.
const CONTENT_FIELD: &str = "_content";
const SCROLL_PAGE: u32 = 256;

/// Qdrant vector store backend.
pub struct QdrantBackend {
    client: Qdrant,
    collection: String,
    embedding_dim: u64,
}

impl QdrantBackend {
    /// Create a new Qdrant backend from configuration with the given embedding dimension.
    pub fn new(config: &VectorStoreConfig, embedding_dim: u64) -> Result<Self, VectorStoreError> {
        let mut builder = Qdrant::from_url(&config.url);

        if let Some(api_key) = config.api_key.as_deref().filter(|k| !k.starts_with("${")) {
            builder = builder.api_key(api_key.to_string());
        }

        let client = builder
            .build()
            .map_err(|e| VectorStoreError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            collection: config.collection.clone(),
            embedding_dim,
        })
    }

    async fn collection_exists(&self) -> Result<bool, VectorStoreError> {
        self.client
            .collection_exists(&self.collection)
            .await
            .map_err(|e| VectorStoreError::CollectionError(e.to_string()))
    }

    fn payload_key(key: &str) -> String {
        if key.starts_with('_') {
            format!("_{key}")
        } else {
            key.to_string()
        }
    }

    fn metadata_key(key: String) -> String {
        if key.starts_with("__") {
            key[1..].to_string()
        } else {
            key
        }
    }

    fn build_filter(filter: &MetadataFilter) -> Option<Filter> {
        if filter.is_empty() {
            return None;
        }

        let conditions: Vec<Condition> = filter
            .conditions()
            .iter()
            .map(|(key, value)| {
                let key = Self::payload_key(key);
                match value {
                    Scalar::Text(s) => Condition::matches(key, s.clone()),
                    Scalar::Int(n) => Condition::matches(key, *n),
                    Scalar::Bool(b) => Condition::matches(key, *b),
                    Scalar::Float(x) => Condition::range(
                        key,
                        Range {
                            gte: Some(*x),
                            lte: Some(*x),
                            ..Default::default()
                        },
                    ),
                }
            })
            .collect();

        Some(Filter::must(conditions))
    }

    fn to_payload(record: ChunkRecord) -> HashMap<String, QdrantValue> {
        let mut payload: HashMap<String, QdrantValue> = record
            .metadata
            .into_iter()
            .map(|(key, value)| {
                let value: QdrantValue = match value {
                    Scalar::Bool(b) => b.into(),
                    Scalar::Int(n) => n.into(),
                    Scalar::Float(x) => x.into(),
                    Scalar::Text(s) => s.into(),
                };
                (Self::payload_key(&key), value)
            })
            .collect();
        payload.insert(CONTENT_FIELD.to_string(), record.text.into());
        payload
    }

    fn from_payload(
        id: Option<PointId>,
        mut payload: HashMap<String, QdrantValue>,
        distance: f32,
    ) -> StoredMatch {
        let text = match payload.remove(CONTENT_FIELD).and_then(|v| v.kind) {
            Some(Kind::StringValue(s)) => s,
            _ => String::new(),
        };

        let metadata: FlatMetadata = payload
            .into_iter()
            .filter_map(|(key, value)| {
                let scalar = match value.kind? {
                    Kind::StringValue(s) => Scalar::Text(s),
                    Kind::IntegerValue(n) => Scalar::Int(n),
                    Kind::DoubleValue(x) => Scalar::Float(x),
                    Kind::BoolValue(b) => Scalar::Bool(b),
                    _ => return None,
                };
                Some((Self::metadata_key(key), scalar))
            })
            .collect();

        StoredMatch {
            id: Self::point_id_string(id),
            text,
            metadata,
            distance,
        }
    }

    fn point_id_string(id: Option<PointId>) -> String {
        match id.and_then(|id| id.point_id_options) {
            Some(PointIdOptions::Uuid(uuid)) => uuid,
            Some(PointIdOptions::Num(num)) => num.to_string(),
            None => String::new(),
        }
    }

    /// Page through the collection, handing each batch of points to `visit`.
    async fn scroll_all<F>(
        &self,
        filter: Option<Filter>,
        fields: Option<Vec<String>>,
        limit: Option<usize>,
        mut visit: F,
    ) -> Result<(), VectorStoreError>
    where
        F: FnMut(Option<PointId>, HashMap<String, QdrantValue>),
    {
        let mut offset: Option<PointId> = None;
        let mut seen = 0usize;

        loop {
            let mut scroll_builder = ScrollPointsBuilder::new(&self.collection)
                .limit(SCROLL_PAGE)
                .with_vectors(false);

            scroll_builder = match &fields {
                Some(fields) => scroll_builder.with_payload(PayloadIncludeSelector {
                    fields: fields.clone(),
                }),
                None => scroll_builder.with_payload(true),
            };
            if let Some(f) = &filter {
                scroll_builder = scroll_builder.filter(f.clone());
            }
            if let Some(off) = offset {
                scroll_builder = scroll_builder.offset(off);
            }

            let response = self
                .client
                .scroll(scroll_builder)
                .await
                .map_err(|e| VectorStoreError::QueryError(e.to_string()))?;

            if response.result.is_empty() {
                break;
            }

            for point in response.result {
                if limit.is_some_and(|l| seen >= l) {
                    return Ok(());
                }
                visit(point.id, point.payload);
                seen += 1;
            }

            offset = response.next_page_offset;
            if offset.is_none() {
                break;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl VectorStore for QdrantBackend {
    async fn health_check(&self) -> Result<bool, VectorStoreError> {
        self.client
            .health_check()
            .await
            .map(|_| true)
            .map_err(|e| VectorStoreError::ConnectionError(e.to_string()))
    }

    async fn ensure_collection(&self) -> Result<(), VectorStoreError> {
        if self.collection_exists().await? {
            return Ok(());
        }

        let create_collection = CreateCollectionBuilder::new(&self.collection).vectors_config(
            VectorParamsBuilder::new(self.embedding_dim, Distance::Cosine),
        );

        self.client
            .create_collection(create_collection)
            .await
            .map_err(|e| VectorStoreError::CollectionError(e.to_string()))?;

        debug!("Created collection '{}'", self.collection);
        Ok(())
    }

    async fn insert(&self, records: Vec<ChunkRecord>) -> Result<usize, VectorStoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let count = records.len();
        let points: Vec<PointStruct> = records
            .into_iter()
            .map(|record| {
                if record.vector.len() as u64 != self.embedding_dim {
                    return Err(VectorStoreError::DimensionMismatch {
                        expected: self.embedding_dim as usize,
                        actual: record.vector.len(),
                    });
                }
                let id = record.id.clone();
                let vector = record.vector.clone();
                Ok(PointStruct::new(id, vector, Self::to_payload(record)))
            })
            .collect::<Result<_, _>>()?;

        let upsert = UpsertPointsBuilder::new(&self.collection, points).wait(true);

        self.client
            .upsert_points(upsert)
            .await
            .map_err(|e| VectorStoreError::InsertError(e.to_string()))?;

        Ok(count)
    }

    async fn query(
        &self,
        vector: Vec<f32>,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<StoredMatch>, VectorStoreError> {
        let mut search_builder =
            SearchPointsBuilder::new(&self.collection, vector, k as u64).with_payload(true);

        if let Some(f) = filter.and_then(Self::build_filter) {
            search_builder = search_builder.filter(f);
        }

        let results = self
            .client
            .search_points(search_builder)
            .await
            .map_err(|e| VectorStoreError::QueryError(e.to_string()))?;

        // Qdrant reports cosine similarity as the score.
        Ok(results
            .result
            .into_iter()
            .map(|point| Self::from_payload(point.id, point.payload, 1.0 - point.score))
            .collect())
    }

    async fn get(
        &self,
        filter: &MetadataFilter,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMatch>, VectorStoreError> {
        let mut matches = Vec::new();
        self.scroll_all(Self::build_filter(filter), None, limit, |id, payload| {
            matches.push(Self::from_payload(id, payload, 0.0));
        })
        .await?;
        Ok(matches)
    }

    async fn count(&self) -> Result<u64, VectorStoreError> {
        if !self.collection_exists().await? {
            return Ok(0);
        }

        let response = self
            .client
            .count(CountPointsBuilder::new(&self.collection).exact(true))
            .await
            .map_err(|e| VectorStoreError::QueryError(e.to_string()))?;

        Ok(response.result.map_or(0, |r| r.count))
    }

    async fn totals(&self) -> Result<StoreTotals, VectorStoreError> {
        let chunks = self.count().await?;
        if chunks == 0 {
            return Ok(StoreTotals::default());
        }

        let mut sources = BTreeSet::new();
        self.scroll_all(
            None,
            Some(vec![META_SOURCE_FILE.to_string()]),
            None,
            |_, mut payload| {
                if let Some(Kind::StringValue(s)) =
                    payload.remove(META_SOURCE_FILE).and_then(|v| v.kind)
                {
                    sources.insert(s);
                }
            },
        )
        .await?;

        Ok(StoreTotals {
            chunks,
            sources: sources.len() as u64,
        })
    }

    async fn delete_by_source(&self, source_file: &str) -> Result<(), VectorStoreError> {
        let filter = Filter::must([Condition::matches(
            META_SOURCE_FILE,
            source_file.to_string(),
        )]);
        let delete = DeletePointsBuilder::new(&self.collection)
            .points(filter)
            .wait(true);

        self.client
            .delete_points(delete)
            .await
            .map_err(|e| VectorStoreError::DeleteError(e.to_string()))?;

        Ok(())
    }

    async fn reset(&self) -> Result<(), VectorStoreError> {
        if self.collection_exists().await? {
            self.client
                .delete_collection(&self.collection)
                .await
                .map_err(|e| VectorStoreError::DeleteError(e.to_string()))?;
        }

        self.ensure_collection().await
    }

    fn collection(&self) -> &str {
        &self.collection
    }
}
