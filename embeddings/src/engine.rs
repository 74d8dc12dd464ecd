//! Parallel similarity ranking over a candidate set.

use std::num::NonZeroUsize;
use std::ops::Range;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::cache::CachedVector;
use crate::similarity::{SimilarRecord, cosine_similarity_with_magnitudes, magnitude};

/// A query vector with its magnitude computed once per search.
#[derive(Debug, Clone)]
pub struct QueryVector {
    values: Arc<[f32]>,
    magnitude: f32,
}

impl QueryVector {
    /// Wrap a query embedding.
    pub fn new(values: Vec<f32>) -> Self {
        let magnitude = magnitude(&values);
        Self {
            values: values.into(),
            magnitude,
        }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn magnitude(&self) -> f32 {
        self.magnitude
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Scores a query against a candidate set on blocking worker tasks.
///
/// The candidate set is split into contiguous chunks, one per worker, and
/// every chunk is scored independently. Output order is unspecified; use
/// [`crate::similarity::top_k`] to rank it.
#[derive(Debug, Clone)]
pub struct SimilarityEngine {
    workers: usize,
}

impl SimilarityEngine {
    /// Create an engine using one worker per available CPU.
    pub fn new() -> Self {
        let workers = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        Self { workers }
    }

    /// Create an engine with a fixed worker count (at least one).
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Score every candidate except `exclude_id` against the query.
    ///
    /// Never fails: a worker that panics is logged and its chunk dropped.
    pub async fn rank(
        &self,
        query: &QueryVector,
        candidates: Arc<[CachedVector]>,
        exclude_id: Option<&str>,
    ) -> Vec<SimilarRecord> {
        if candidates.is_empty() {
            return Vec::new();
        }

        let chunks = chunk_ranges(candidates.len(), self.workers);
        debug!(
            "Ranking {} candidates across {} workers",
            candidates.len(),
            chunks.len()
        );

        let exclude_id: Option<Arc<str>> = exclude_id.map(Arc::from);
        let mut tasks = JoinSet::new();
        for range in chunks {
            let query = query.clone();
            let candidates = Arc::clone(&candidates);
            let exclude_id = exclude_id.clone();
            tasks.spawn_blocking(move || {
                score_chunk(&query, &candidates[range], exclude_id.as_deref())
            });
        }

        let mut results = Vec::with_capacity(candidates.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(scored) => results.extend(scored),
                Err(e) => warn!("Similarity worker failed, dropping its chunk: {e}"),
            }
        }

        results
    }
}

impl Default for SimilarityEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn score_chunk(
    query: &QueryVector,
    chunk: &[CachedVector],
    exclude_id: Option<&str>,
) -> Vec<SimilarRecord> {
    chunk
        .iter()
        .filter(|c| exclude_id != Some(c.record_id.as_str()))
        .map(|c| {
            let similarity = cosine_similarity_with_magnitudes(
                query.values(),
                query.magnitude(),
                &c.vector,
                c.magnitude,
            );
            SimilarRecord::new(c.record_id.clone(), similarity)
        })
        .collect()
}

/// Split `len` items into at most `workers` contiguous, non-empty ranges.
fn chunk_ranges(len: usize, workers: usize) -> Vec<Range<usize>> {
    let workers = workers.clamp(1, len.max(1));
    let chunk_size = len.div_ceil(workers).max(1);
    (0..len)
        .step_by(chunk_size)
        .map(|start| start..(start + chunk_size).min(len))
        .collect()
}
