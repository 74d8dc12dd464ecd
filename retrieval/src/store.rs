//! Persistence of stored vectors.
//!
//! The service talks to storage through [`VectorStore`]. Rows carry their
//! vector in whatever encoding the backing store produced; [`StoredVectorData::decode`]
//! normalizes every supported encoding to `Vec<f32>` and fails per row.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use quarry_embeddings::Embedding;

use crate::error::Result;

const PREVIEW_CHARS: usize = 100;

/// Why a stored vector could not be decoded.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("embedding field is null")]
    Missing,

    #[error("unexpected type in embedding array at index {index}: {kind}")]
    InvalidElement { index: usize, kind: &'static str },

    #[error("failed to unmarshal embedding string: {0}")]
    InvalidJson(String),

    #[error("unexpected embedding type: {kind}, value preview: {preview}")]
    UnsupportedShape { kind: &'static str, preview: String },
}

/// Vector payload as it comes out of the backing store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredVectorData {
    /// Typed single-precision array.
    F32(Vec<f32>),

    /// Typed double-precision array.
    F64(Vec<f64>),

    /// Raw JSON: an array of numbers, or a string holding one.
    Json(Value),
}

impl StoredVectorData {
    /// Normalize the payload to single-precision floats.
    pub fn decode(&self) -> std::result::Result<Embedding, DecodeError> {
        match self {
            Self::F32(v) => Ok(v.clone()),
            Self::F64(v) => Ok(v.iter().map(|x| *x as f32).collect()),
            Self::Json(value) => decode_json(value),
        }
    }
}

impl From<Embedding> for StoredVectorData {
    fn from(v: Embedding) -> Self {
        Self::F32(v)
    }
}

fn decode_json(value: &Value) -> std::result::Result<Embedding, DecodeError> {
    match value {
        Value::Null => Err(DecodeError::Missing),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                item.as_f64()
                    .map(|x| x as f32)
                    .ok_or(DecodeError::InvalidElement {
                        index,
                        kind: json_kind(item),
                    })
            })
            .collect(),
        Value::String(s) => {
            let floats: Vec<f64> =
                serde_json::from_str(s).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
            Ok(floats.into_iter().map(|x| x as f32).collect())
        }
        other => Err(DecodeError::UnsupportedShape {
            kind: json_kind(other),
            preview: other.to_string().chars().take(PREVIEW_CHARS).collect(),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One stored embedding row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredVector {
    pub record_id: String,
    pub dataset_id: String,
    pub field_name: String,
    pub data: StoredVectorData,
    pub model: String,
    pub dimensions: usize,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for creating or replacing a stored vector.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertVector {
    pub record_id: String,
    pub dataset_id: String,
    pub field_name: String,
    pub vector: Embedding,
    pub model: String,
    pub dimensions: usize,
}

/// Selects stored vectors for deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VectorFilter {
    /// Every field of one record.
    Record(String),

    /// Every record and field of a dataset.
    Dataset(String),

    /// One field across a dataset.
    Field {
        dataset_id: String,
        field_name: String,
    },
}

impl VectorFilter {
    pub fn matches(&self, v: &StoredVector) -> bool {
        match self {
            Self::Record(record_id) => v.record_id == *record_id,
            Self::Dataset(dataset_id) => v.dataset_id == *dataset_id,
            Self::Field {
                dataset_id,
                field_name,
            } => v.dataset_id == *dataset_id && v.field_name == *field_name,
        }
    }
}

/// Storage for embedding rows, unique on `(record_id, field_name)`.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Every stored vector for a dataset field.
    async fn find_vectors(&self, dataset_id: &str, field_name: &str) -> Result<Vec<StoredVector>>;

    /// The stored vector for one record field, if any.
    async fn find_vector(&self, record_id: &str, field_name: &str) -> Result<Option<StoredVector>>;

    /// Create the row, or update it in place when it already exists.
    async fn upsert_vector(&self, vector: UpsertVector) -> Result<()>;

    /// Delete matching rows, returning what was removed.
    async fn delete_vectors(&self, filter: VectorFilter) -> Result<Vec<StoredVector>>;
}

/// In-process [`VectorStore`].
#[derive(Default)]
pub struct InMemoryVectorStore {
    rows: RwLock<BTreeMap<(String, String), StoredVector>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row as-is, whatever its encoding.
    pub async fn insert(&self, row: StoredVector) {
        let key = (row.record_id.clone(), row.field_name.clone());
        self.rows.write().await.insert(key, row);
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn find_vectors(&self, dataset_id: &str, field_name: &str) -> Result<Vec<StoredVector>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|v| v.dataset_id == dataset_id && v.field_name == field_name)
            .cloned()
            .collect())
    }

    async fn find_vector(&self, record_id: &str, field_name: &str) -> Result<Option<StoredVector>> {
        let key = (record_id.to_string(), field_name.to_string());
        Ok(self.rows.read().await.get(&key).cloned())
    }

    async fn upsert_vector(&self, vector: UpsertVector) -> Result<()> {
        let key = (vector.record_id.clone(), vector.field_name.clone());
        let mut rows = self.rows.write().await;
        let now = Utc::now();

        match rows.get_mut(&key) {
            Some(row) => {
                row.dataset_id = vector.dataset_id;
                row.data = vector.vector.into();
                row.model = vector.model;
                row.dimensions = vector.dimensions;
                row.updated_at = now;
            }
            None => {
                rows.insert(
                    key,
                    StoredVector {
                        record_id: vector.record_id,
                        dataset_id: vector.dataset_id,
                        field_name: vector.field_name,
                        data: vector.vector.into(),
                        model: vector.model,
                        dimensions: vector.dimensions,
                        updated_at: now,
                    },
                );
            }
        }

        Ok(())
    }

    async fn delete_vectors(&self, filter: VectorFilter) -> Result<Vec<StoredVector>> {
        let mut rows = self.rows.write().await;
        let keys: Vec<(String, String)> = rows
            .iter()
            .filter(|(_, v)| filter.matches(v))
            .map(|(k, _)| k.clone())
            .collect();

        let removed: Vec<StoredVector> = keys.iter().filter_map(|k| rows.remove(k)).collect();
        debug!("Deleted {} stored vectors for {filter:?}", removed.len());
        Ok(removed)
    }
}
