//! # Embeddings
//!
//! In-process embedding cache and similarity search for record datasets.
//!
//! ## Features
//!
//! - **Vector math**: magnitudes and cosine similarity that never produce NaN
//! - **Embedding cache**: memory-budgeted, LRU + idle-TTL cache of per-field
//!   vector sets with precomputed magnitudes
//! - **Similarity engine**: top-K ranking fanned out over blocking workers
//! - **Providers**: OpenAI-compatible batch embedding API
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Embeddings System                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  EmbeddingProvider ──► Embedding ──► EmbeddingCache            │
//! │                                          │                      │
//! │                                          ▼                      │
//! │                 QueryVector ──► SimilarityEngine ──► top_k      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod engine;
pub mod error;
pub mod provider;
pub mod similarity;

pub use cache::{
    CacheConfig, CacheGeneration, CacheInfo, CacheStats, CachedVector, EmbeddingCache,
};
pub use engine::{QueryVector, SimilarityEngine};
pub use error::{EmbeddingError, Result};
pub use provider::{EmbeddingProvider, EmbeddingRequest, EmbeddingResponse, OpenAIProvider};
pub use similarity::{
    DEFAULT_LIMIT, SimilarRecord, cosine_similarity, cosine_similarity_with_magnitudes, magnitude,
    top_k,
};

/// A dense vector embedding.
pub type Embedding = Vec<f32>;
