//! Request and response types for the embeddings service.

use serde::{Deserialize, Serialize};

use quarry_embeddings::{CacheInfo, SimilarRecord};

use crate::catalog::FieldKind;

/// Field name under which whole-record embeddings are stored.
pub const RECORD_FIELD_NAME: &str = "_record";

/// Whether embeddings cover a single field or a whole record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingMode {
    /// Embed one text/editor field.
    #[default]
    Field,

    /// Embed a text rendering of the entire record.
    Record,
}

/// Request to generate and store embeddings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateEmbeddingsRequest {
    /// Dataset name or id.
    pub dataset_id: String,

    /// Field to embed (field mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_name: Option<String>,

    #[serde(default)]
    pub mode: EmbeddingMode,

    /// Records to process; all records when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_ids: Option<Vec<String>>,

    /// `{fieldName}` template for record mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

impl GenerateEmbeddingsRequest {
    /// Embed one field of every record.
    pub fn field(dataset_id: impl Into<String>, field_name: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            field_name: Some(field_name.into()),
            ..Self::default()
        }
    }

    /// Embed whole records.
    pub fn record(dataset_id: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            mode: EmbeddingMode::Record,
            ..Self::default()
        }
    }

    pub fn with_record_ids(mut self, ids: Vec<String>) -> Self {
        self.record_ids = Some(ids);
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }
}

/// Outcome of a generation run.
///
/// A run in which every batch failed is still a response, with
/// `generated == 0` and the failures listed in `errors`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateEmbeddingsResponse {
    pub generated: usize,
    pub skipped: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Request to find records similar to a text or to an existing record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindSimilarRequest {
    /// Dataset name or id.
    pub dataset_id: String,

    /// Field to search (field mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_name: Option<String>,

    #[serde(default)]
    pub mode: EmbeddingMode,

    /// Text to embed and search with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Record whose stored vector is the query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,

    /// Maximum results; non-positive or absent means the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
}

impl FindSimilarRequest {
    /// Search one field by text.
    pub fn text(
        dataset_id: impl Into<String>,
        field_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            field_name: Some(field_name.into()),
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// Search one field using a record's stored vector.
    pub fn like_record(
        dataset_id: impl Into<String>,
        field_name: impl Into<String>,
        record_id: impl Into<String>,
    ) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            field_name: Some(field_name.into()),
            record_id: Some(record_id.into()),
            ..Self::default()
        }
    }

    /// Search whole-record embeddings instead of a field.
    pub fn in_record_mode(mut self) -> Self {
        self.mode = EmbeddingMode::Record;
        self.field_name = None;
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Ranked results plus diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindSimilarResponse {
    pub results: Vec<SimilarRecord>,
    pub debug: SimilarityDebug,
}

/// Diagnostics for one similarity search.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarityDebug {
    pub dataset_id: String,
    pub field_name: String,
    pub query_embedding_len: usize,

    /// Stored vectors considered (before decode failures on a miss).
    pub stored_embeddings: usize,

    /// Candidates actually scored.
    pub processed_count: usize,

    /// Stored vectors that failed to decode.
    pub error_count: usize,
    pub cache_hit: bool,

    /// The loaded set was too large to cache.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cache_skipped: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_stats: Option<CacheInfo>,

    /// First few decode failures.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Embedding coverage of one dataset field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingStats {
    pub total_records: usize,
    pub embedded_records: usize,
    pub not_embedded_records: usize,
}

/// A field that can be embedded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddableField {
    pub name: String,
    pub kind: FieldKind,
}
