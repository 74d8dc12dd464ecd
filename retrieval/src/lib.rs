//! # Retrieval
//!
//! Embedding generation and similarity search over record datasets.
//!
//! - **Generation**: embed one field or a text rendering of whole records,
//!   in batches, storing one vector per `(record, field)`
//! - **Search**: find the records closest to a text or to another record,
//!   ranked by cosine similarity over a cached candidate set
//! - **Maintenance**: coverage stats, pending records, deletion with cache
//!   invalidation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      EmbeddingsService                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │   Dataset    │  │   Vector     │  │  Embedding   │           │
//! │  │   Catalog    │  │    Store     │  │  Provider    │           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! │         │                │                  │                   │
//! │         └────────────────┼──────────────────┘                   │
//! │                          ▼                                      │
//! │                  ┌──────────────┐                               │
//! │                  │  Embedding   │                               │
//! │                  │    Cache     │                               │
//! │                  └──────────────┘                               │
//! │                          │                                      │
//! │                          ▼                                      │
//! │                  ┌──────────────┐                               │
//! │                  │  Similarity  │                               │
//! │                  │    Engine    │                               │
//! │                  └──────────────┘                               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use quarry_retrieval::{EmbeddingsService, FindSimilarRequest, RetrievalConfig};
//!
//! let config = RetrievalConfig::load("quarry.toml")?;
//! let service = EmbeddingsService::new(config, catalog, store);
//!
//! let response = service
//!     .find_similar(FindSimilarRequest::text("articles", "title", "borrow checker"))
//!     .await?;
//! ```

pub mod catalog;
pub mod config;
pub mod error;
pub mod service;
pub mod store;
pub mod text;
pub mod types;

pub use catalog::{Dataset, DatasetCatalog, FieldKind, FieldSchema, InMemoryCatalog, Record};
pub use config::{AiConfig, GenerationConfig, QueryConfig, RetrievalConfig};
pub use error::{Result, RetrievalError};
pub use service::{EmbeddingsService, EmbeddingsServiceBuilder};
pub use store::{
    DecodeError, InMemoryVectorStore, StoredVector, StoredVectorData, UpsertVector, VectorFilter,
    VectorStore,
};
pub use types::{
    EmbeddableField, EmbeddingMode, EmbeddingStats, FindSimilarRequest, FindSimilarResponse,
    GenerateEmbeddingsRequest, GenerateEmbeddingsResponse, RECORD_FIELD_NAME, SimilarityDebug,
};

// Re-export from dependencies for convenience
pub use quarry_embeddings::{CacheConfig, CacheInfo, CacheStats, EmbeddingCache, SimilarRecord};
