//! Error types for the embeddings service.

use thiserror::Error;

use crate::store::DecodeError;

/// Result type alias for retrieval operations.
pub type Result<T> = std::result::Result<T, RetrievalError>;

/// Errors that can occur in the embeddings service.
///
/// Failures scoped to one record or one generation batch are collected into
/// the response instead of being returned as errors.
#[derive(Error, Debug)]
pub enum RetrievalError {
    /// Feature disabled or missing credentials/model.
    #[error("configuration error: {0}")]
    Config(String),

    /// Dataset, field or stored vector not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Neither text nor a record id was supplied.
    #[error("either text or recordId must be provided")]
    MissingQuery,

    /// The query record's stored vector could not be decoded.
    #[error("failed to parse stored embedding: {0}")]
    Decode(#[from] DecodeError),

    /// Embedding provider error.
    #[error("embedding error: {0}")]
    Embedding(#[from] quarry_embeddings::EmbeddingError),

    /// Persistence collaborator error.
    #[error("store error: {0}")]
    Store(String),

    /// Configuration file could not be parsed.
    #[error("invalid configuration file: {0}")]
    Toml(#[from] toml::de::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
