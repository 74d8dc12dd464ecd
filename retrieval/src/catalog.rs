//! Dataset metadata and record access.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::error::Result;

/// Kind of a dataset field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    /// Rich text stored as HTML.
    Editor,
    Email,
    Url,
    Number,
    Bool,
    Json,
    Other,
}

impl FieldKind {
    /// Kinds included when a whole record is rendered as text.
    pub fn is_textual(self) -> bool {
        matches!(self, Self::Text | Self::Editor | Self::Email | Self::Url)
    }
}

/// Schema of one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub kind: FieldKind,

    /// Whether the field was marked for embedding.
    #[serde(default)]
    pub embeddable: bool,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            embeddable: false,
        }
    }

    /// Mark the field for embedding.
    pub fn embeddable(mut self) -> Self {
        self.embeddable = true;
        self
    }

    /// Only text and editor fields explicitly marked embeddable qualify.
    pub fn is_embeddable(&self) -> bool {
        self.embeddable && matches!(self.kind, FieldKind::Text | FieldKind::Editor)
    }
}

/// A dataset and its schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub name: String,
    pub fields: Vec<FieldSchema>,
}

impl Dataset {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: FieldSchema) -> Self {
        self.fields.push(field);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A record: an id plus a JSON object of field values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub values: Map<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            values: Map::new(),
        }
    }

    pub fn with_value(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(field.into(), value.into());
        self
    }

    /// Field value as text; missing and null values are empty.
    pub fn get_string(&self, field: &str) -> String {
        match self.values.get(field) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }
}

/// Read-only access to datasets and their records.
#[async_trait]
pub trait DatasetCatalog: Send + Sync {
    /// Look a dataset up by id, falling back to its name.
    async fn find_dataset(&self, name_or_id: &str) -> Result<Option<Dataset>>;

    /// Every record of a dataset.
    async fn list_records(&self, dataset_id: &str) -> Result<Vec<Record>>;

    /// One record of a dataset.
    async fn find_record(&self, dataset_id: &str, record_id: &str) -> Result<Option<Record>>;
}

/// In-process [`DatasetCatalog`].
#[derive(Default)]
pub struct InMemoryCatalog {
    datasets: RwLock<Vec<Dataset>>,
    records: RwLock<HashMap<String, Vec<Record>>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_dataset(&self, dataset: Dataset) {
        self.datasets.write().await.push(dataset);
    }

    pub async fn add_record(&self, dataset_id: &str, record: Record) {
        self.records
            .write()
            .await
            .entry(dataset_id.to_string())
            .or_default()
            .push(record);
    }
}

#[async_trait]
impl DatasetCatalog for InMemoryCatalog {
    async fn find_dataset(&self, name_or_id: &str) -> Result<Option<Dataset>> {
        let datasets = self.datasets.read().await;
        Ok(datasets
            .iter()
            .find(|d| d.id == name_or_id)
            .or_else(|| datasets.iter().find(|d| d.name == name_or_id))
            .cloned())
    }

    async fn list_records(&self, dataset_id: &str) -> Result<Vec<Record>> {
        Ok(self
            .records
            .read()
            .await
            .get(dataset_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn find_record(&self, dataset_id: &str, record_id: &str) -> Result<Option<Record>> {
        Ok(self
            .records
            .read()
            .await
            .get(dataset_id)
            .and_then(|records| records.iter().find(|r| r.id == record_id))
            .cloned())
    }
}
