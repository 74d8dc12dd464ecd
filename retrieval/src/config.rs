//! Configuration for the embeddings service.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use quarry_embeddings::CacheConfig;
use quarry_embeddings::provider::DEFAULT_BASE_URL;

use crate::error::Result;

/// Environment variable consulted when no API key is configured.
pub const API_KEY_ENV_VAR: &str = "OPENAI_API_KEY";

/// Configuration for the embeddings service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Embedding provider settings.
    pub ai: AiConfig,

    /// Embedding cache limits.
    pub cache: CacheConfig,

    /// Search settings.
    pub query: QueryConfig,

    /// Embedding generation settings.
    pub generation: GenerationConfig,
}

impl RetrievalConfig {
    /// Parse a TOML document. Missing sections take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Set the AI configuration.
    pub fn with_ai(mut self, config: AiConfig) -> Self {
        self.ai = config;
        self
    }

    /// Set the cache configuration.
    pub fn with_cache(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }

    /// Set the query configuration.
    pub fn with_query(mut self, config: QueryConfig) -> Self {
        self.query = config;
        self
    }

    /// Set the generation configuration.
    pub fn with_generation(mut self, config: GenerationConfig) -> Self {
        self.generation = config;
        self
    }
}

/// Embedding provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    /// Master switch for every embedding feature.
    pub enabled: bool,

    /// Provider API key. Falls back to `OPENAI_API_KEY` when unset.
    pub api_key: Option<String>,

    /// Model used for embeddings.
    pub embedding_model: String,

    /// Requested output dimensions (text-embedding-3 models only).
    pub embedding_dimensions: Option<usize>,

    /// API root.
    pub base_url: String,

    /// Timeout for embedding a single search query.
    pub query_timeout_secs: u64,

    /// Timeout for each generation batch.
    pub generation_timeout_secs: u64,
}

impl AiConfig {
    /// An enabled configuration with the given key.
    pub fn enabled(api_key: impl Into<String>) -> Self {
        Self {
            enabled: true,
            api_key: Some(api_key.into()),
            ..Self::default()
        }
    }

    /// Set the embedding model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    /// Set the output dimensions.
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.embedding_dimensions = Some(dimensions);
        self
    }

    /// Set the API root.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// The configured key, or the one from the environment.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var(API_KEY_ENV_VAR).ok().filter(|k| !k.is_empty()))
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: None,
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dimensions: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            query_timeout_secs: 30,
            generation_timeout_secs: 120,
        }
    }
}

/// Search settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Results returned when the request does not ask for a limit.
    pub default_limit: usize,

    /// Upper bound on the requested limit.
    pub max_results: usize,
}

impl QueryConfig {
    /// Resolve a requested limit: non-positive means default, then clamp.
    pub fn resolve_limit(&self, requested: Option<i64>) -> usize {
        let limit = match requested {
            Some(n) if n > 0 => usize::try_from(n).unwrap_or(usize::MAX),
            _ => self.default_limit,
        };
        limit.min(self.max_results.max(1))
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            max_results: 100,
        }
    }
}

/// Embedding generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Texts sent in a single provider request.
    pub max_texts_per_batch: usize,

    /// Characters kept per field when building whole-record text.
    pub max_field_chars: usize,

    /// Error messages kept in a generation response.
    pub max_reported_errors: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_texts_per_batch: 2048,
            max_field_chars: 2000,
            max_reported_errors: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RetrievalConfig::default();
        assert!(!config.ai.enabled);
        assert_eq!(config.ai.embedding_model, "text-embedding-3-small");
        assert_eq!(config.ai.generation_timeout(), Duration::from_secs(120));
        assert_eq!(config.cache.max_per_entry, 50_000);
        assert_eq!(config.generation.max_texts_per_batch, 2048);
        assert_eq!(config.query.default_limit, 10);
    }

    #[test]
    fn test_partial_toml() {
        let config = RetrievalConfig::from_toml_str(
            r#"
            [ai]
            enabled = true
            api_key = "sk-test"
            embedding_dimensions = 256

            [cache]
            max_memory_mb = 64.0
            ttl_secs = 30
            "#,
        )
        .unwrap();

        assert!(config.ai.enabled);
        assert_eq!(config.ai.resolved_api_key(), Some("sk-test".to_string()));
        assert_eq!(config.ai.embedding_dimensions, Some(256));
        assert_eq!(config.ai.embedding_model, "text-embedding-3-small");
        assert_eq!(config.cache.max_memory_mb, 64.0);
        assert_eq!(config.cache.ttl(), Duration::from_secs(30));
        assert_eq!(config.cache.max_per_entry, 50_000);
        assert_eq!(config.generation.max_field_chars, 2000);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[query]\nmax_results = 5").unwrap();

        let config = RetrievalConfig::load(file.path()).unwrap();
        assert_eq!(config.query.max_results, 5);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(RetrievalConfig::from_toml_str("[ai\nenabled = ").is_err());
    }

    #[test]
    fn test_resolve_limit() {
        let query = QueryConfig {
            default_limit: 10,
            max_results: 50,
        };
        assert_eq!(query.resolve_limit(None), 10);
        assert_eq!(query.resolve_limit(Some(0)), 10);
        assert_eq!(query.resolve_limit(Some(-3)), 10);
        assert_eq!(query.resolve_limit(Some(7)), 7);
        assert_eq!(query.resolve_limit(Some(500)), 50);
    }
}
