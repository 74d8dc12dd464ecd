//! Memory-bounded cache of embedding sets.
//!
//! One entry holds every vector stored for a `(dataset, field)` pair, with
//! magnitudes precomputed, so repeated searches over the same dataset skip
//! both the store round-trip and the O(n·d) norm computation.
//!
//! Eviction combines three rules:
//! - a global memory budget, enforced on `set` by evicting least recently used
//!   entries first;
//! - a sliding TTL, checked lazily on `get`: only inactivity expires an entry;
//! - a per-entry vector count limit: oversized sets are never cached.
//!
//! Memory is an estimate (`count * bytes_per_record`), not a measurement.
//!
//! Callers that load a set from storage take a [`CacheGeneration`] before the
//! load and store it with [`EmbeddingCache::set_if_unchanged`], so a set read
//! before an invalidation is never put back afterwards.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::Embedding;
use crate::similarity::magnitude;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Configuration for an [`EmbeddingCache`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Total memory budget in megabytes.
    pub max_memory_mb: f64,

    /// Maximum number of vectors a single entry may hold.
    pub max_per_entry: usize,

    /// Idle time after which an entry expires, in seconds.
    pub ttl_secs: u64,

    /// Estimated bytes per cached vector (floats, id, magnitude, overhead).
    pub bytes_per_record: usize,
}

impl CacheConfig {
    /// Set the memory budget.
    pub fn with_max_memory_mb(mut self, mb: f64) -> Self {
        self.max_memory_mb = mb;
        self
    }

    /// Set the per-entry vector limit.
    pub fn with_max_per_entry(mut self, count: usize) -> Self {
        self.max_per_entry = count;
        self
    }

    /// Set the idle TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_secs = ttl.as_secs();
        self
    }

    /// Set the per-record byte estimate.
    pub fn with_bytes_per_record(mut self, bytes: usize) -> Self {
        self.bytes_per_record = bytes;
        self
    }

    /// The idle TTL as a [`Duration`].
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Estimated size in megabytes of an entry holding `count` vectors.
    pub fn estimate_mb(&self, count: usize) -> f64 {
        (count as f64 * self.bytes_per_record as f64) / BYTES_PER_MB
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 500.0,
            max_per_entry: 50_000,
            ttl_secs: 10 * 60,
            // 1536 floats * 4 bytes + record id + magnitude + overhead
            bytes_per_record: 6200,
        }
    }
}

/// A stored vector loaded into memory with its magnitude precomputed.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedVector {
    /// ID of the record the vector belongs to.
    pub record_id: String,

    /// The embedding vector.
    pub vector: Embedding,

    /// L2 norm of `vector`.
    pub magnitude: f32,
}

impl CachedVector {
    /// Wrap a vector, computing its magnitude once.
    pub fn new(record_id: impl Into<String>, vector: Embedding) -> Self {
        let magnitude = magnitude(&vector);
        Self {
            record_id: record_id.into(),
            vector,
            magnitude,
        }
    }
}

/// Cache key: one dataset field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub dataset_id: String,
    pub field_name: String,
}

impl CacheKey {
    pub fn new(dataset_id: impl Into<String>, field_name: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            field_name: field_name.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dataset_id, self.field_name)
    }
}

#[derive(Debug)]
struct CacheEntry {
    vectors: Arc<[CachedVector]>,
    memory_mb: f64,
    created_at: Instant,
    accessed_at: Instant,
}

/// Point in the cache's invalidation history.
///
/// Taken with [`EmbeddingCache::generation`] before loading a set from
/// storage, then passed to [`EmbeddingCache::set_if_unchanged`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CacheGeneration(u64);

#[derive(Default)]
struct Invalidations {
    /// Bumped by every invalidation.
    sequence: u64,
    keys: HashMap<CacheKey, u64>,
    datasets: HashMap<String, u64>,
    cleared: u64,
}

impl Invalidations {
    fn bump(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn key(&mut self, key: &CacheKey) {
        let seq = self.bump();
        self.keys.insert(key.clone(), seq);
    }

    fn dataset(&mut self, dataset_id: &str) {
        let seq = self.bump();
        self.datasets.insert(dataset_id.to_string(), seq);
    }

    fn clear(&mut self) {
        let seq = self.bump();
        self.keys.clear();
        self.datasets.clear();
        self.cleared = seq;
    }

    /// Whether `key` was invalidated after `since` was taken.
    fn touched_since(&self, key: &CacheKey, since: CacheGeneration) -> bool {
        let last = [
            self.cleared,
            self.keys.get(key).copied().unwrap_or(0),
            self.datasets.get(&key.dataset_id).copied().unwrap_or(0),
        ];
        last.into_iter().any(|seq| seq > since.0)
    }
}

struct CacheState {
    /// Entries in recency order, least recently used first out.
    entries: LruCache<CacheKey, CacheEntry>,

    /// Sum of every entry's `memory_mb`.
    total_memory_mb: f64,

    invalidations: Invalidations,
}

impl CacheState {
    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.release(entry.memory_mb);
        Some(entry)
    }

    fn release(&mut self, memory_mb: f64) {
        self.total_memory_mb -= memory_mb;
        // Keep float drift from accumulating once the cache is empty.
        if self.entries.is_empty() {
            self.total_memory_mb = 0.0;
        }
    }
}

/// Process-shared cache of embedding sets keyed by `(dataset, field)`.
///
/// Construct one per service and share it behind an `Arc`. All mutating
/// operations (including `get`, which refreshes recency and expires idle
/// entries) take the write lock; `stats` and `info` only read.
pub struct EmbeddingCache {
    state: RwLock<CacheState>,
    config: CacheConfig,
}

impl EmbeddingCache {
    /// Create an empty cache.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            state: RwLock::new(CacheState {
                entries: LruCache::unbounded(),
                total_memory_mb: 0.0,
                invalidations: Invalidations::default(),
            }),
            config,
        }
    }

    /// The configuration this cache was built with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get the cached vectors for a dataset field.
    ///
    /// An entry idle for longer than the TTL is evicted and reported as a
    /// miss. A hit refreshes the entry's access time and recency.
    pub async fn get(&self, dataset_id: &str, field_name: &str) -> Option<Arc<[CachedVector]>> {
        let key = CacheKey::new(dataset_id, field_name);
        let ttl = self.config.ttl();
        let mut state = self.state.write().await;

        let expired = state.entries.peek(&key)?.accessed_at.elapsed() > ttl;
        if expired {
            state.remove(&key);
            debug!("Embedding cache entry {key} expired");
            return None;
        }

        let entry = state.entries.get_mut(&key)?;
        entry.accessed_at = Instant::now();
        debug!("Embedding cache hit for {key} ({} vectors)", entry.vectors.len());
        Some(Arc::clone(&entry.vectors))
    }

    /// Store the vectors for a dataset field, replacing any previous entry.
    ///
    /// Returns `false` without touching the cache when the set holds more
    /// than `max_per_entry` vectors or would exceed the whole budget alone.
    /// Otherwise least recently used entries are evicted until the new entry
    /// fits.
    pub async fn set(
        &self,
        dataset_id: &str,
        field_name: &str,
        vectors: impl Into<Arc<[CachedVector]>>,
    ) -> bool {
        let key = CacheKey::new(dataset_id, field_name);
        let vectors: Arc<[CachedVector]> = vectors.into();
        let Some(memory_mb) = self.admit(&key, vectors.len()) else {
            return false;
        };

        let mut state = self.state.write().await;
        self.insert(&mut state, key, vectors, memory_mb);
        true
    }

    /// The current invalidation generation.
    pub async fn generation(&self) -> CacheGeneration {
        CacheGeneration(self.state.read().await.invalidations.sequence)
    }

    /// Like [`set`](Self::set), but also returns `false` when the key, its
    /// dataset or the whole cache was invalidated after `since` was taken.
    pub async fn set_if_unchanged(
        &self,
        dataset_id: &str,
        field_name: &str,
        vectors: impl Into<Arc<[CachedVector]>>,
        since: CacheGeneration,
    ) -> bool {
        let key = CacheKey::new(dataset_id, field_name);
        let vectors: Arc<[CachedVector]> = vectors.into();
        let Some(memory_mb) = self.admit(&key, vectors.len()) else {
            return false;
        };

        let mut state = self.state.write().await;
        if state.invalidations.touched_since(&key, since) {
            debug!("Not caching {key}: invalidated while loading");
            return false;
        }
        self.insert(&mut state, key, vectors, memory_mb);
        true
    }

    /// Estimated size of a set of `count` vectors, or `None` when it may not
    /// be cached at all.
    fn admit(&self, key: &CacheKey, count: usize) -> Option<f64> {
        if count > self.config.max_per_entry {
            debug!(
                "Not caching {key}: {count} vectors exceeds per-entry limit {}",
                self.config.max_per_entry
            );
            return None;
        }

        let memory_mb = self.config.estimate_mb(count);
        if memory_mb > self.config.max_memory_mb {
            debug!(
                "Not caching {key}: {memory_mb:.2}MB exceeds budget {}MB",
                self.config.max_memory_mb
            );
            return None;
        }
        Some(memory_mb)
    }

    fn insert(
        &self,
        state: &mut CacheState,
        key: CacheKey,
        vectors: Arc<[CachedVector]>,
        memory_mb: f64,
    ) {
        state.remove(&key);

        while state.total_memory_mb + memory_mb > self.config.max_memory_mb {
            let Some((evicted_key, evicted)) = state.entries.pop_lru() else {
                break;
            };
            state.release(evicted.memory_mb);
            debug!(
                "Evicted embedding cache entry {evicted_key} ({:.2}MB)",
                evicted.memory_mb
            );
        }

        let now = Instant::now();
        let count = vectors.len();
        debug!(
            "Caching {count} vectors for {key} ({memory_mb:.2}MB, total {:.2}MB)",
            state.total_memory_mb + memory_mb
        );
        state.entries.put(
            key,
            CacheEntry {
                vectors,
                memory_mb,
                created_at: now,
                accessed_at: now,
            },
        );
        state.total_memory_mb += memory_mb;
    }

    /// Remove the entry for a dataset field, if present.
    pub async fn invalidate(&self, dataset_id: &str, field_name: &str) {
        let key = CacheKey::new(dataset_id, field_name);
        let mut state = self.state.write().await;
        state.invalidations.key(&key);
        if state.remove(&key).is_some() {
            debug!("Invalidated embedding cache entry {key}");
        }
    }

    /// Remove every entry belonging to a dataset.
    pub async fn invalidate_dataset(&self, dataset_id: &str) {
        let mut state = self.state.write().await;
        state.invalidations.dataset(dataset_id);

        let keys: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(key, _)| key.dataset_id == dataset_id)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &keys {
            state.remove(key);
        }

        if !keys.is_empty() {
            debug!(
                "Invalidated {} embedding cache entries for dataset {dataset_id}",
                keys.len()
            );
        }
    }

    /// Drop every entry.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.entries.clear();
        state.total_memory_mb = 0.0;
        state.invalidations.clear();
        info!("Cleared embedding cache");
    }

    /// Detailed snapshot for monitoring.
    pub async fn stats(&self) -> CacheStats {
        let state = self.state.read().await;

        let entries: Vec<CacheEntryStats> = state
            .entries
            .iter()
            .map(|(key, entry)| CacheEntryStats {
                key: key.to_string(),
                count: entry.vectors.len(),
                memory_mb: entry.memory_mb,
                age_ms: duration_ms(entry.created_at.elapsed()),
                idle_ms: duration_ms(entry.accessed_at.elapsed()),
            })
            .collect();

        CacheStats {
            entries_count: entries.len(),
            total_vectors: entries.iter().map(|e| e.count).sum(),
            memory_used_mb: state.total_memory_mb,
            memory_budget_mb: self.config.max_memory_mb,
            memory_usage_percent: usage_percent(state.total_memory_mb, self.config.max_memory_mb),
            max_per_entry: self.config.max_per_entry,
            ttl_secs: self.config.ttl_secs,
            entries,
        }
    }

    /// Summary snapshot, cheap enough to attach to every search response.
    pub async fn info(&self) -> CacheInfo {
        let state = self.state.read().await;
        CacheInfo {
            entries_count: state.entries.len(),
            memory_used_mb: state.total_memory_mb,
            memory_budget_mb: self.config.max_memory_mb,
            memory_usage_percent: usage_percent(state.total_memory_mb, self.config.max_memory_mb),
        }
    }
}

impl Default for EmbeddingCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

fn usage_percent(used: f64, budget: f64) -> f64 {
    if budget > 0.0 {
        used / budget * 100.0
    } else {
        0.0
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Detailed statistics about the embedding cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries_count: usize,
    pub total_vectors: usize,
    pub memory_used_mb: f64,
    pub memory_budget_mb: f64,
    pub memory_usage_percent: f64,
    pub max_per_entry: usize,
    pub ttl_secs: u64,
    pub entries: Vec<CacheEntryStats>,
}

/// Statistics for a single cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntryStats {
    /// Key in `datasetId:fieldName` form.
    pub key: String,
    pub count: usize,
    pub memory_mb: f64,

    /// Time since the entry was stored.
    pub age_ms: u64,

    /// Time since the entry was last read.
    pub idle_ms: u64,
}

/// Summary of the cache state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheInfo {
    pub entries_count: usize,
    pub memory_used_mb: f64,
    pub memory_budget_mb: f64,
    pub memory_usage_percent: f64,
}
