//! The embeddings service: generation and similarity search over datasets.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use quarry_embeddings::{
    CacheInfo, CacheStats, CachedVector, EmbeddingCache, EmbeddingError, EmbeddingProvider,
    EmbeddingRequest, OpenAIProvider, QueryVector, SimilarityEngine, top_k,
};

use crate::catalog::{Dataset, DatasetCatalog};
use crate::config::RetrievalConfig;
use crate::error::{Result, RetrievalError};
use crate::store::{UpsertVector, VectorFilter, VectorStore};
use crate::text::{field_text, record_text};
use crate::types::{
    EmbeddableField, EmbeddingMode, EmbeddingStats, FindSimilarRequest, FindSimilarResponse,
    GenerateEmbeddingsRequest, GenerateEmbeddingsResponse, RECORD_FIELD_NAME, SimilarityDebug,
};

/// Decode failures kept as samples in the search diagnostics.
const MAX_DECODE_ERROR_SAMPLES: usize = 3;

/// Generates, stores and searches embeddings for dataset records.
///
/// The service owns no data itself: records come from a [`DatasetCatalog`],
/// vectors live in a [`VectorStore`], and loaded candidate sets are kept in a
/// shared [`EmbeddingCache`].
pub struct EmbeddingsService {
    config: RetrievalConfig,
    catalog: Arc<dyn DatasetCatalog>,
    store: Arc<dyn VectorStore>,
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<EmbeddingCache>,
    engine: SimilarityEngine,
}

impl EmbeddingsService {
    /// Create a service builder.
    pub fn builder(
        catalog: Arc<dyn DatasetCatalog>,
        store: Arc<dyn VectorStore>,
    ) -> EmbeddingsServiceBuilder {
        EmbeddingsServiceBuilder::new(catalog, store)
    }

    /// Create a service with the default provider, cache and engine.
    pub fn new(
        config: RetrievalConfig,
        catalog: Arc<dyn DatasetCatalog>,
        store: Arc<dyn VectorStore>,
    ) -> Self {
        Self::builder(catalog, store).with_config(config).build()
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// The shared candidate cache.
    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    /// Find the records most similar to a text or to an existing record.
    pub async fn find_similar(&self, request: FindSimilarRequest) -> Result<FindSimilarResponse> {
        self.require_enabled()?;
        let dataset = self.resolve_dataset(&request.dataset_id).await?;
        let field_name = search_field(&dataset, &request)?;
        let limit = self.config.query.resolve_limit(request.limit);

        let text = request.text.as_deref().filter(|t| !t.is_empty());
        let record_id = request.record_id.as_deref().filter(|r| !r.is_empty());
        let (query, exclude_id) = match (text, record_id) {
            (Some(_), Some(_)) => {
                return Err(RetrievalError::InvalidRequest(
                    "provide either text or recordId, not both".to_string(),
                ));
            }
            (Some(text), None) => (self.embed_query(text).await?, None),
            (None, Some(record_id)) => (
                self.stored_query_vector(record_id, &field_name).await?,
                Some(record_id),
            ),
            (None, None) => return Err(RetrievalError::MissingQuery),
        };

        let mut diagnostics = SimilarityDebug {
            dataset_id: dataset.id.clone(),
            field_name: field_name.clone(),
            query_embedding_len: query.len(),
            ..SimilarityDebug::default()
        };

        let candidates = self
            .load_candidates(&dataset.id, &field_name, &mut diagnostics)
            .await?;

        let ranked = self.engine.rank(&query, candidates, exclude_id).await;
        diagnostics.processed_count = ranked.len();
        diagnostics.cache_stats = Some(self.cache.info().await);

        let results = top_k(ranked, limit);
        debug!(
            "Similarity search on {}:{} returned {} of {} candidates",
            dataset.id,
            field_name,
            results.len(),
            diagnostics.processed_count
        );

        Ok(FindSimilarResponse {
            results,
            debug: diagnostics,
        })
    }

    /// Embed records and store the vectors.
    ///
    /// Batch and per-record failures are reported in the response; only
    /// precondition and collaborator lookup failures are returned as errors.
    pub async fn generate_embeddings(
        &self,
        request: GenerateEmbeddingsRequest,
    ) -> Result<GenerateEmbeddingsResponse> {
        self.require_provider()?;
        let dataset = self.resolve_dataset(&request.dataset_id).await?;

        let field = match request.mode {
            EmbeddingMode::Field => {
                let name = request
                    .field_name
                    .as_deref()
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| {
                        RetrievalError::InvalidRequest(
                            "fieldName is required for field mode".to_string(),
                        )
                    })?;
                let field = dataset.field(name).ok_or_else(|| {
                    RetrievalError::NotFound(format!("field {name} in dataset {}", dataset.name))
                })?;
                if !field.is_embeddable() {
                    return Err(RetrievalError::InvalidRequest(format!(
                        "field {name} is not embeddable"
                    )));
                }
                Some(field)
            }
            EmbeddingMode::Record => None,
        };
        let field_name = field.map_or(RECORD_FIELD_NAME, |f| f.name.as_str());

        let records = match request.record_ids.as_deref() {
            Some(ids) if !ids.is_empty() => {
                let mut records = Vec::with_capacity(ids.len());
                for id in ids {
                    match self.catalog.find_record(&dataset.id, id).await? {
                        Some(record) => records.push(record),
                        None => debug!("Skipping unknown record {id}"),
                    }
                }
                records
            }
            _ => self.catalog.list_records(&dataset.id).await?,
        };

        if records.is_empty() {
            return Ok(GenerateEmbeddingsResponse::default());
        }

        let max_field_chars = self.config.generation.max_field_chars;
        let texts: Vec<(String, String)> = records
            .iter()
            .filter_map(|record| {
                let text = match field {
                    Some(field) => field_text(record, field),
                    None => record_text(
                        record,
                        &dataset,
                        request.template.as_deref(),
                        max_field_chars,
                    ),
                };
                (!text.is_empty()).then(|| (record.id.clone(), text))
            })
            .collect();

        let mut response = GenerateEmbeddingsResponse {
            skipped: records.len() - texts.len(),
            ..GenerateEmbeddingsResponse::default()
        };
        if texts.is_empty() {
            info!(
                "No text to embed for {}:{field_name} ({} records)",
                dataset.id,
                records.len()
            );
            return Ok(response);
        }

        let ai = &self.config.ai;
        let batch_size = self.config.generation.max_texts_per_batch.max(1);
        for (batch_index, batch) in texts.chunks(batch_size).enumerate() {
            debug!(
                "Embedding batch {} ({} texts) for {}:{field_name}",
                batch_index + 1,
                batch.len(),
                dataset.id
            );

            let embed_request = EmbeddingRequest::new(
                batch.iter().map(|(_, text)| text.clone()).collect(),
                ai.embedding_model.clone(),
            )
            .with_dimensions(ai.embedding_dimensions)
            .with_timeout(ai.generation_timeout());

            let embedded = match self.provider.embed(embed_request).await {
                Ok(embedded) => embedded,
                Err(e) => {
                    warn!("Embedding batch {} failed: {e}", batch_index + 1);
                    response.errors.push(format!("batch error: {e}"));
                    response.skipped += batch.len();
                    continue;
                }
            };

            let returned = embedded.embeddings.len();
            if returned < batch.len() {
                response.errors.push(format!(
                    "batch error: provider returned {returned} embeddings for {} texts",
                    batch.len()
                ));
                response.skipped += batch.len() - returned;
            }

            for ((record_id, _), vector) in batch.iter().zip(embedded.embeddings) {
                let upsert = UpsertVector {
                    record_id: record_id.clone(),
                    dataset_id: dataset.id.clone(),
                    field_name: field_name.to_string(),
                    dimensions: vector.len(),
                    vector,
                    model: ai.embedding_model.clone(),
                };
                match self.store.upsert_vector(upsert).await {
                    Ok(()) => {
                        response.generated += 1;
                        self.cache.invalidate(&dataset.id, field_name).await;
                    }
                    Err(e) => {
                        warn!("Failed to store embedding for record {record_id}: {e}");
                        response.errors.push(format!("record {record_id}: {e}"));
                        response.skipped += 1;
                    }
                }
            }
        }

        cap_errors(
            &mut response.errors,
            self.config.generation.max_reported_errors,
        );
        info!(
            "Generated {} embeddings for {}:{field_name} ({} skipped, {} errors)",
            response.generated,
            dataset.id,
            response.skipped,
            response.errors.len()
        );
        Ok(response)
    }

    /// Delete every stored vector of a record. Returns the number deleted.
    pub async fn delete_embeddings_for_record(&self, record_id: &str) -> Result<usize> {
        let removed = self
            .store
            .delete_vectors(VectorFilter::Record(record_id.to_string()))
            .await?;

        let keys: HashSet<(&str, &str)> = removed
            .iter()
            .map(|v| (v.dataset_id.as_str(), v.field_name.as_str()))
            .collect();
        for (dataset_id, field_name) in keys {
            self.cache.invalidate(dataset_id, field_name).await;
        }

        Ok(removed.len())
    }

    /// Delete every stored vector of a dataset. Returns the number deleted.
    ///
    /// Takes the dataset id as stored, so it works after the dataset itself
    /// is gone from the catalog.
    pub async fn delete_embeddings_for_dataset(&self, dataset_id: &str) -> Result<usize> {
        let removed = self
            .store
            .delete_vectors(VectorFilter::Dataset(dataset_id.to_string()))
            .await?;
        self.cache.invalidate_dataset(dataset_id).await;
        info!("Deleted {} embeddings for dataset {dataset_id}", removed.len());
        Ok(removed.len())
    }

    /// Delete the stored vectors of one field. Returns the number deleted.
    pub async fn delete_embeddings_for_field(
        &self,
        dataset_id: &str,
        field_name: &str,
    ) -> Result<usize> {
        let removed = self
            .store
            .delete_vectors(VectorFilter::Field {
                dataset_id: dataset_id.to_string(),
                field_name: field_name.to_string(),
            })
            .await?;
        self.cache.invalidate(dataset_id, field_name).await;
        info!(
            "Deleted {} embeddings for {dataset_id}:{field_name}",
            removed.len()
        );
        Ok(removed.len())
    }

    /// Embedding coverage of a field (`_record` for whole-record vectors).
    pub async fn embedding_stats(&self, dataset: &str, field_name: &str) -> Result<EmbeddingStats> {
        let dataset = self.resolve_dataset(dataset).await?;
        let total_records = self.catalog.list_records(&dataset.id).await?.len();
        let embedded_records = self.store.find_vectors(&dataset.id, field_name).await?.len();

        Ok(EmbeddingStats {
            total_records,
            embedded_records,
            not_embedded_records: total_records.saturating_sub(embedded_records),
        })
    }

    /// Ids of records with no stored vector for the field, ascending.
    pub async fn pending_record_ids(&self, dataset: &str, field_name: &str) -> Result<Vec<String>> {
        let dataset = self.resolve_dataset(dataset).await?;
        let embedded: HashSet<String> = self
            .store
            .find_vectors(&dataset.id, field_name)
            .await?
            .into_iter()
            .map(|v| v.record_id)
            .collect();

        let pending: BTreeSet<String> = self
            .catalog
            .list_records(&dataset.id)
            .await?
            .into_iter()
            .map(|r| r.id)
            .filter(|id| !embedded.contains(id))
            .collect();

        Ok(pending.into_iter().collect())
    }

    /// Fields of a dataset that can be embedded.
    pub async fn embeddable_fields(&self, dataset: &str) -> Result<Vec<EmbeddableField>> {
        let dataset = self.resolve_dataset(dataset).await?;
        Ok(dataset
            .fields
            .iter()
            .filter(|f| f.is_embeddable())
            .map(|f| EmbeddableField {
                name: f.name.clone(),
                kind: f.kind,
            })
            .collect())
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    pub async fn cache_info(&self) -> CacheInfo {
        self.cache.info().await
    }

    pub async fn clear_cache(&self) {
        self.cache.clear().await;
    }

    fn require_enabled(&self) -> Result<()> {
        if self.config.ai.enabled {
            Ok(())
        } else {
            Err(RetrievalError::Config(
                "AI features are not enabled".to_string(),
            ))
        }
    }

    fn require_provider(&self) -> Result<()> {
        self.require_enabled()?;
        if !self.provider.is_available() {
            return Err(RetrievalError::Config(format!(
                "embedding provider {} has no API key configured",
                self.provider.name()
            )));
        }
        if self.config.ai.embedding_model.is_empty() {
            return Err(RetrievalError::Config(
                "embedding model is not configured".to_string(),
            ));
        }
        Ok(())
    }

    async fn resolve_dataset(&self, name_or_id: &str) -> Result<Dataset> {
        self.catalog
            .find_dataset(name_or_id)
            .await?
            .ok_or_else(|| RetrievalError::NotFound(format!("dataset {name_or_id}")))
    }

    async fn embed_query(&self, text: &str) -> Result<QueryVector> {
        self.require_provider()?;
        let ai = &self.config.ai;
        let request = EmbeddingRequest::new(vec![text.to_string()], ai.embedding_model.clone())
            .with_dimensions(ai.embedding_dimensions)
            .with_timeout(ai.query_timeout());

        let embedded = self.provider.embed(request).await?;
        let vector = embedded.embeddings.into_iter().next().ok_or_else(|| {
            EmbeddingError::InvalidResponse("no embedding returned for query text".to_string())
        })?;
        Ok(QueryVector::new(vector))
    }

    async fn stored_query_vector(&self, record_id: &str, field_name: &str) -> Result<QueryVector> {
        let stored = self
            .store
            .find_vector(record_id, field_name)
            .await?
            .ok_or_else(|| {
                RetrievalError::NotFound(format!("embedding for record {record_id}:{field_name}"))
            })?;
        Ok(QueryVector::new(stored.data.decode()?))
    }

    async fn load_candidates(
        &self,
        dataset_id: &str,
        field_name: &str,
        diagnostics: &mut SimilarityDebug,
    ) -> Result<Arc<[CachedVector]>> {
        if let Some(cached) = self.cache.get(dataset_id, field_name).await {
            diagnostics.cache_hit = true;
            diagnostics.stored_embeddings = cached.len();
            return Ok(cached);
        }

        let generation = self.cache.generation().await;
        let rows = self.store.find_vectors(dataset_id, field_name).await?;
        diagnostics.stored_embeddings = rows.len();

        let mut vectors = Vec::with_capacity(rows.len());
        for row in rows {
            match row.data.decode() {
                Ok(vector) => vectors.push(CachedVector::new(row.record_id, vector)),
                Err(e) => {
                    diagnostics.error_count += 1;
                    if diagnostics.errors.len() < MAX_DECODE_ERROR_SAMPLES {
                        diagnostics.errors.push(format!("record {}: {e}", row.record_id));
                    }
                }
            }
        }
        let error_count = diagnostics.error_count;
        if error_count > 0 {
            warn!("{error_count} stored embeddings for {dataset_id}:{field_name} could not be decoded");
        }

        // A store that lands while the rows are being read invalidates the key,
        // and the now stale set is then used for this search only.
        let vectors: Arc<[CachedVector]> = vectors.into();
        diagnostics.cache_skipped = !self
            .cache
            .set_if_unchanged(dataset_id, field_name, Arc::clone(&vectors), generation)
            .await;
        Ok(vectors)
    }
}

/// The field selector of a search request.
fn search_field(dataset: &Dataset, request: &FindSimilarRequest) -> Result<String> {
    match request.mode {
        EmbeddingMode::Record => Ok(RECORD_FIELD_NAME.to_string()),
        EmbeddingMode::Field => {
            let name = request
                .field_name
                .as_deref()
                .filter(|n| !n.is_empty())
                .ok_or_else(|| {
                    RetrievalError::InvalidRequest(
                        "fieldName is required for field-level search mode".to_string(),
                    )
                })?;
            match dataset.field(name) {
                Some(field) => Ok(field.name.clone()),
                None => Err(RetrievalError::NotFound(format!(
                    "field {name} in dataset {}",
                    dataset.name
                ))),
            }
        }
    }
}

/// Keep the first `max` errors and summarize the rest.
fn cap_errors(errors: &mut Vec<String>, max: usize) {
    if errors.len() > max {
        let more = errors.len() - max;
        errors.truncate(max);
        errors.push(format!("... and {more} more errors"));
    }
}

/// Builder for [`EmbeddingsService`].
pub struct EmbeddingsServiceBuilder {
    config: RetrievalConfig,
    catalog: Arc<dyn DatasetCatalog>,
    store: Arc<dyn VectorStore>,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    cache: Option<Arc<EmbeddingCache>>,
    engine: Option<SimilarityEngine>,
}

impl EmbeddingsServiceBuilder {
    pub fn new(catalog: Arc<dyn DatasetCatalog>, store: Arc<dyn VectorStore>) -> Self {
        Self {
            config: RetrievalConfig::default(),
            catalog,
            store,
            provider: None,
            cache: None,
            engine: None,
        }
    }

    pub fn with_config(mut self, config: RetrievalConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom embedding provider instead of the configured API.
    pub fn with_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Share an existing cache.
    pub fn with_cache(mut self, cache: Arc<EmbeddingCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_engine(mut self, engine: SimilarityEngine) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Build the service.
    pub fn build(self) -> EmbeddingsService {
        let config = self.config;

        let provider = self.provider.unwrap_or_else(|| {
            let mut provider = OpenAIProvider::new().with_base_url(config.ai.base_url.clone());
            if let Some(key) = config.ai.resolved_api_key() {
                provider = provider.with_api_key(key);
            }
            Arc::new(provider)
        });
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(EmbeddingCache::new(config.cache.clone())));
        let engine = self.engine.unwrap_or_default();

        debug!(
            "Embeddings service using provider {} with {} ranking workers",
            provider.name(),
            engine.workers()
        );

        EmbeddingsService {
            config,
            catalog: self.catalog,
            store: self.store,
            provider,
            cache,
            engine,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FieldKind, FieldSchema, InMemoryCatalog, Record};
    use crate::config::AiConfig;
    use crate::store::{InMemoryVectorStore, StoredVector, StoredVectorData};
    use async_trait::async_trait;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use quarry_embeddings::EmbeddingResponse;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    /// Embeds each text as `[len, 1]`; fails any batch containing "boom".
    /// Always reports its own model name, whatever was requested.
    struct MockProvider {
        requests: Mutex<Vec<EmbeddingRequest>>,
    }

    impl MockProvider {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
            })
        }

        fn batch_sizes(&self) -> Vec<usize> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.texts.len())
                .collect()
        }
    }

    #[async_trait]
    impl EmbeddingProvider for MockProvider {
        fn name(&self) -> &str {
            "mock"
        }

        fn is_available(&self) -> bool {
            true
        }

        async fn embed(&self, request: EmbeddingRequest) -> quarry_embeddings::Result<EmbeddingResponse> {
            self.requests.lock().unwrap().push(request.clone());
            if request.texts.iter().any(|t| t.contains("boom")) {
                return Err(EmbeddingError::ApiRequest("status 500: boom".to_string()));
            }
            Ok(EmbeddingResponse {
                embeddings: request
                    .texts
                    .iter()
                    .map(|t| vec![t.len() as f32, 1.0])
                    .collect(),
                model: "mock-embedding-v1".to_string(),
                tokens_used: None,
            })
        }
    }

    /// Rejects upserts for one record id.
    struct FlakyStore {
        inner: InMemoryVectorStore,
        reject: String,
    }

    #[async_trait]
    impl VectorStore for FlakyStore {
        async fn find_vectors(&self, dataset_id: &str, field_name: &str) -> Result<Vec<StoredVector>> {
            self.inner.find_vectors(dataset_id, field_name).await
        }

        async fn find_vector(&self, record_id: &str, field_name: &str) -> Result<Option<StoredVector>> {
            self.inner.find_vector(record_id, field_name).await
        }

        async fn upsert_vector(&self, vector: UpsertVector) -> Result<()> {
            if vector.record_id == self.reject {
                return Err(RetrievalError::Store("disk full".to_string()));
            }
            self.inner.upsert_vector(vector).await
        }

        async fn delete_vectors(&self, filter: VectorFilter) -> Result<Vec<StoredVector>> {
            self.inner.delete_vectors(filter).await
        }
    }

    /// Holds the next `find_vectors` call after it has read its rows until
    /// `release` is notified.
    #[derive(Default)]
    struct PausingStore {
        inner: InMemoryVectorStore,
        pause_next: AtomicBool,
        loaded: Notify,
        release: Notify,
    }

    #[async_trait]
    impl VectorStore for PausingStore {
        async fn find_vectors(&self, dataset_id: &str, field_name: &str) -> Result<Vec<StoredVector>> {
            let rows = self.inner.find_vectors(dataset_id, field_name).await?;
            if self.pause_next.swap(false, Ordering::SeqCst) {
                self.loaded.notify_one();
                self.release.notified().await;
            }
            Ok(rows)
        }

        async fn find_vector(&self, record_id: &str, field_name: &str) -> Result<Option<StoredVector>> {
            self.inner.find_vector(record_id, field_name).await
        }

        async fn upsert_vector(&self, vector: UpsertVector) -> Result<()> {
            self.inner.upsert_vector(vector).await
        }

        async fn delete_vectors(&self, filter: VectorFilter) -> Result<Vec<StoredVector>> {
            self.inner.delete_vectors(filter).await
        }
    }

    fn enabled_config() -> RetrievalConfig {
        RetrievalConfig::default().with_ai(AiConfig::enabled("test-key"))
    }

    async fn catalog_with(records: &[(&str, &str)]) -> Arc<InMemoryCatalog> {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog
            .add_dataset(
                Dataset::new("ds1", "articles")
                    .with_field(FieldSchema::new("title", FieldKind::Text).embeddable())
                    .with_field(FieldSchema::new("body", FieldKind::Editor).embeddable())
                    .with_field(FieldSchema::new("slug", FieldKind::Text)),
            )
            .await;
        for (id, title) in records {
            catalog
                .add_record("ds1", Record::new(*id).with_value("title", *title))
                .await;
        }
        catalog
    }

    fn service(
        config: RetrievalConfig,
        catalog: Arc<InMemoryCatalog>,
        store: Arc<dyn VectorStore>,
        provider: Arc<MockProvider>,
    ) -> EmbeddingsService {
        EmbeddingsService::builder(catalog, store)
            .with_config(config)
            .with_provider(provider)
            .with_engine(SimilarityEngine::with_workers(2))
            .build()
    }

    fn stored(record_id: &str, data: StoredVectorData) -> StoredVector {
        StoredVector {
            record_id: record_id.to_string(),
            dataset_id: "ds1".to_string(),
            field_name: "title".to_string(),
            data,
            model: "m".to_string(),
            dimensions: 2,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_disabled_fails_before_lookup() {
        let catalog = Arc::new(InMemoryCatalog::new());
        let svc = service(
            RetrievalConfig::default(),
            catalog,
            Arc::new(InMemoryVectorStore::new()),
            MockProvider::new(),
        );

        let err = svc
            .find_similar(FindSimilarRequest::text("missing", "title", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::Config(_)));
    }

    #[tokio::test]
    async fn test_find_similar_preconditions() {
        let catalog = catalog_with(&[]).await;
        let svc = service(
            enabled_config(),
            catalog,
            Arc::new(InMemoryVectorStore::new()),
            MockProvider::new(),
        );

        let err = svc
            .find_similar(FindSimilarRequest::text("nope", "title", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::NotFound(_)));

        let mut request = FindSimilarRequest::text("articles", "title", "x");
        request.field_name = None;
        let err = svc.find_similar(request).await.unwrap_err();
        assert!(matches!(err, RetrievalError::InvalidRequest(_)));

        let err = svc
            .find_similar(FindSimilarRequest::text("articles", "missing", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::NotFound(_)));

        let mut request = FindSimilarRequest::text("articles", "title", "");
        request.text = None;
        let err = svc.find_similar(request).await.unwrap_err();
        assert!(matches!(err, RetrievalError::MissingQuery));

        let mut request = FindSimilarRequest::text("articles", "title", "x");
        request.record_id = Some("r1".to_string());
        let err = svc.find_similar(request).await.unwrap_err();
        assert!(matches!(err, RetrievalError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_find_similar_counts_decode_errors() {
        let catalog = catalog_with(&[]).await;
        let store = Arc::new(InMemoryVectorStore::new());
        store
            .insert(stored("a", StoredVectorData::F32(vec![1.0, 0.0])))
            .await;
        store
            .insert(stored("b", StoredVectorData::Json(json!("[0.0, 1.0]"))))
            .await;
        for id in ["c", "d", "e", "f"] {
            store
                .insert(stored(id, StoredVectorData::Json(json!({ "bad": true }))))
                .await;
        }

        let svc = service(enabled_config(), catalog, store, MockProvider::new());
        let response = svc
            .find_similar(FindSimilarRequest::like_record("articles", "title", "a"))
            .await
            .unwrap();

        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].record_id, "b");
        assert_eq!(response.debug.stored_embeddings, 6);
        assert_eq!(response.debug.processed_count, 1);
        assert_eq!(response.debug.error_count, 4);
        assert_eq!(response.debug.errors.len(), MAX_DECODE_ERROR_SAMPLES);
        assert!(response.debug.errors[0].starts_with("record c: "));
        assert!(!response.debug.cache_hit);
    }

    #[tokio::test]
    async fn test_query_record_decode_failure_is_an_error() {
        let catalog = catalog_with(&[]).await;
        let store = Arc::new(InMemoryVectorStore::new());
        store
            .insert(stored("a", StoredVectorData::Json(json!([1.0, "x"]))))
            .await;

        let svc = service(enabled_config(), catalog, store, MockProvider::new());
        let err = svc
            .find_similar(FindSimilarRequest::like_record("articles", "title", "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::Decode(_)));

        let err = svc
            .find_similar(FindSimilarRequest::like_record("articles", "title", "zz"))
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_generate_batches_and_partial_failure() {
        let catalog =
            catalog_with(&[("r1", "one"), ("r2", "boom"), ("r3", "three"), ("r4", "")]).await;
        let store = Arc::new(InMemoryVectorStore::new());
        let provider = MockProvider::new();
        let mut config = enabled_config();
        config.generation.max_texts_per_batch = 2;

        let svc = service(config, catalog, store.clone(), provider.clone());
        let response = svc
            .generate_embeddings(GenerateEmbeddingsRequest::field("articles", "title"))
            .await
            .unwrap();

        // r4 has no text; the first batch (r1, r2) fails as a whole.
        assert_eq!(provider.batch_sizes(), vec![2, 1]);
        assert_eq!(response.generated, 1);
        assert_eq!(response.skipped, 3);
        assert_eq!(
            response.errors,
            vec!["batch error: API request failed: status 500: boom".to_string()]
        );
        assert_eq!(store.len().await, 1);
        assert!(store.find_vector("r3", "title").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_generate_caps_reported_errors() {
        let records: Vec<(String, String)> = (0..5)
            .map(|i| (format!("r{i}"), format!("boom {i}")))
            .collect();
        let refs: Vec<(&str, &str)> = records
            .iter()
            .map(|(id, t)| (id.as_str(), t.as_str()))
            .collect();
        let catalog = catalog_with(&refs).await;

        let mut config = enabled_config();
        config.generation.max_texts_per_batch = 1;
        config.generation.max_reported_errors = 2;

        let svc = service(
            config,
            catalog,
            Arc::new(InMemoryVectorStore::new()),
            MockProvider::new(),
        );
        let response = svc
            .generate_embeddings(GenerateEmbeddingsRequest::field("articles", "title"))
            .await
            .unwrap();

        assert_eq!(response.generated, 0);
        assert_eq!(response.skipped, 5);
        assert_eq!(response.errors.len(), 3);
        assert_eq!(response.errors[2], "... and 3 more errors");
    }

    #[tokio::test]
    async fn test_generate_reports_store_failures() {
        let catalog = catalog_with(&[("r1", "one"), ("r2", "two")]).await;
        let store = Arc::new(FlakyStore {
            inner: InMemoryVectorStore::new(),
            reject: "r2".to_string(),
        });

        let svc = service(enabled_config(), catalog, store, MockProvider::new());
        let response = svc
            .generate_embeddings(GenerateEmbeddingsRequest::field("articles", "title"))
            .await
            .unwrap();

        assert_eq!(response.generated, 1);
        assert_eq!(response.skipped, 1);
        assert_eq!(
            response.errors,
            vec!["record r2: store error: disk full".to_string()]
        );
    }

    #[tokio::test]
    async fn test_generate_field_preconditions() {
        let catalog = catalog_with(&[("r1", "one")]).await;
        let svc = service(
            enabled_config(),
            catalog,
            Arc::new(InMemoryVectorStore::new()),
            MockProvider::new(),
        );

        let err = svc
            .generate_embeddings(GenerateEmbeddingsRequest::field("articles", "slug"))
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::InvalidRequest(_)));

        let err = svc
            .generate_embeddings(GenerateEmbeddingsRequest::field("articles", "nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::NotFound(_)));

        let response = svc
            .generate_embeddings(
                GenerateEmbeddingsRequest::field("articles", "title")
                    .with_record_ids(vec!["missing".to_string()]),
            )
            .await
            .unwrap();
        assert_eq!(response, GenerateEmbeddingsResponse::default());
    }

    #[tokio::test]
    async fn test_generate_without_text_skips_everything() {
        let catalog = catalog_with(&[("r1", ""), ("r2", "")]).await;
        let provider = MockProvider::new();
        let svc = service(
            enabled_config(),
            catalog,
            Arc::new(InMemoryVectorStore::new()),
            provider.clone(),
        );

        let response = svc
            .generate_embeddings(GenerateEmbeddingsRequest::field("articles", "body"))
            .await
            .unwrap();
        assert_eq!(response.generated, 0);
        assert_eq!(response.skipped, 2);
        assert!(provider.batch_sizes().is_empty());
    }

    #[tokio::test]
    async fn test_record_mode_uses_sentinel_field() {
        let catalog = catalog_with(&[("r1", "one"), ("r2", "two")]).await;
        let store = Arc::new(InMemoryVectorStore::new());
        let svc = service(enabled_config(), catalog, store.clone(), MockProvider::new());

        let response = svc
            .generate_embeddings(GenerateEmbeddingsRequest::record("articles"))
            .await
            .unwrap();
        assert_eq!(response.generated, 2);
        assert!(store.find_vector("r1", RECORD_FIELD_NAME).await.unwrap().is_some());

        let response = svc
            .find_similar(FindSimilarRequest::like_record("articles", "", "r1").in_record_mode())
            .await
            .unwrap();
        assert_eq!(response.debug.field_name, RECORD_FIELD_NAME);
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].record_id, "r2");
    }

    #[tokio::test]
    async fn test_stats_pending_and_deletes() {
        let catalog = catalog_with(&[("r3", "three"), ("r1", "one"), ("r2", "two")]).await;
        let store = Arc::new(InMemoryVectorStore::new());
        let svc = service(enabled_config(), catalog, store.clone(), MockProvider::new());

        svc.generate_embeddings(
            GenerateEmbeddingsRequest::field("articles", "title")
                .with_record_ids(vec!["r2".to_string()]),
        )
        .await
        .unwrap();

        assert_eq!(
            svc.embedding_stats("articles", "title").await.unwrap(),
            EmbeddingStats {
                total_records: 3,
                embedded_records: 1,
                not_embedded_records: 2,
            }
        );
        assert_eq!(
            svc.pending_record_ids("articles", "title").await.unwrap(),
            vec!["r1".to_string(), "r3".to_string()]
        );

        // Warm the cache, then make sure deletion drops it.
        svc.find_similar(FindSimilarRequest::like_record("articles", "title", "r2"))
            .await
            .unwrap();
        assert_eq!(svc.cache_info().await.entries_count, 1);

        assert_eq!(svc.delete_embeddings_for_record("r2").await.unwrap(), 1);
        assert_eq!(svc.cache_info().await.entries_count, 0);
        assert!(store.is_empty().await);

        svc.generate_embeddings(GenerateEmbeddingsRequest::field("articles", "title"))
            .await
            .unwrap();
        assert_eq!(svc.delete_embeddings_for_field("ds1", "title").await.unwrap(), 3);
        svc.generate_embeddings(GenerateEmbeddingsRequest::record("articles"))
            .await
            .unwrap();
        assert_eq!(svc.delete_embeddings_for_dataset("ds1").await.unwrap(), 3);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_store_during_load_keeps_stale_set_out_of_cache() {
        let catalog = catalog_with(&[("r1", "one"), ("r2", "two"), ("r3", "three")]).await;
        let store = Arc::new(PausingStore::default());
        let svc = Arc::new(service(
            enabled_config(),
            catalog,
            store.clone(),
            MockProvider::new(),
        ));

        svc.generate_embeddings(
            GenerateEmbeddingsRequest::field("articles", "title")
                .with_record_ids(vec!["r1".to_string(), "r2".to_string()]),
        )
        .await
        .unwrap();

        store.pause_next.store(true, Ordering::SeqCst);
        let search = tokio::spawn({
            let svc = Arc::clone(&svc);
            async move {
                svc.find_similar(FindSimilarRequest::like_record("articles", "title", "r1"))
                    .await
            }
        });

        // r3 is stored after the search has read its rows but before it caches them.
        store.loaded.notified().await;
        svc.generate_embeddings(
            GenerateEmbeddingsRequest::field("articles", "title")
                .with_record_ids(vec!["r3".to_string()]),
        )
        .await
        .unwrap();
        store.release.notify_one();

        let first = search.await.unwrap().unwrap();
        let ids: Vec<&str> = first.results.iter().map(|r| r.record_id.as_str()).collect();
        assert_eq!(ids, vec!["r2"]);
        assert!(first.debug.cache_skipped);
        assert_eq!(svc.cache_info().await.entries_count, 0);

        let second = svc
            .find_similar(FindSimilarRequest::like_record("articles", "title", "r1"))
            .await
            .unwrap();
        assert!(!second.debug.cache_hit);
        assert_eq!(second.debug.stored_embeddings, 3);
        assert!(second.results.iter().any(|r| r.record_id == "r3"));
    }

    #[tokio::test]
    async fn test_stored_rows_record_configured_model() {
        let catalog = catalog_with(&[("r1", "one")]).await;
        let store = Arc::new(InMemoryVectorStore::new());
        let config = RetrievalConfig::default()
            .with_ai(AiConfig::enabled("test-key").with_model("text-embedding-3-large"));
        let svc = service(config, catalog, store.clone(), MockProvider::new());

        svc.generate_embeddings(GenerateEmbeddingsRequest::field("articles", "title"))
            .await
            .unwrap();

        let row = store.find_vector("r1", "title").await.unwrap().unwrap();
        assert_eq!(row.model, "text-embedding-3-large");
    }

    #[tokio::test]
    async fn test_embeddable_fields() {
        let catalog = catalog_with(&[]).await;
        let svc = service(
            enabled_config(),
            catalog,
            Arc::new(InMemoryVectorStore::new()),
            MockProvider::new(),
        );

        let fields = svc.embeddable_fields("ds1").await.unwrap();
        assert_eq!(
            fields,
            vec![
                EmbeddableField {
                    name: "title".to_string(),
                    kind: FieldKind::Text,
                },
                EmbeddableField {
                    name: "body".to_string(),
                    kind: FieldKind::Editor,
                },
            ]
        );
    }

    #[test]
    fn test_cap_errors() {
        let mut errors: Vec<String> = (0..4).map(|i| i.to_string()).collect();
        cap_errors(&mut errors, 10);
        assert_eq!(errors.len(), 4);

        cap_errors(&mut errors, 1);
        assert_eq!(errors, vec!["0".to_string(), "... and 3 more errors".to_string()]);
    }
}
