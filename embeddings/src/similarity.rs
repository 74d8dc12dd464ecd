//! Vector math and ranking helpers.
//!
//! Every function here is total: malformed input (empty vectors, length
//! mismatches, zero magnitudes, NaN or infinite components) yields a
//! similarity of `0.0` instead of an error or NaN, so one bad stored vector
//! can never fail or top a search.

use std::cmp::Ordering;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

/// Number of results returned when the caller does not ask for a limit.
pub const DEFAULT_LIMIT: usize = 10;

/// Compute the magnitude (L2 norm) of a vector.
pub fn magnitude(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Compute the dot product of two vectors.
///
/// Only the overlapping prefix is used; callers check lengths first.
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Compute the cosine similarity between two embeddings.
///
/// Returns a value between -1.0 and 1.0, where:
/// - 1.0 means identical direction
/// - 0.0 means orthogonal vectors (or unusable input)
/// - -1.0 means opposite vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    cosine_similarity_with_magnitudes(a, magnitude(a), b, magnitude(b))
}

/// Cosine similarity using magnitudes computed ahead of time.
///
/// Only the dot product is recomputed, which is what makes caching the
/// magnitudes of a candidate set worthwhile.
pub fn cosine_similarity_with_magnitudes(a: &[f32], mag_a: f32, b: &[f32], mag_b: f32) -> f32 {
    if a.len() != b.len() || a.is_empty() || mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    let similarity = dot_product(a, b) / (mag_a * mag_b);
    if similarity.is_finite() {
        similarity
    } else {
        0.0
    }
}

/// A record paired with its similarity to the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarRecord {
    /// ID of the matched record.
    pub record_id: String,

    /// Cosine similarity score.
    pub similarity: f32,
}

impl SimilarRecord {
    /// Create a new similarity result.
    pub fn new(record_id: impl Into<String>, similarity: f32) -> Self {
        Self {
            record_id: record_id.into(),
            similarity,
        }
    }
}

/// Ranking order: descending similarity, ties broken by record id ascending.
fn rank_order(a: &SimilarRecord, b: &SimilarRecord) -> Ordering {
    OrderedFloat(b.similarity)
        .cmp(&OrderedFloat(a.similarity))
        .then_with(|| a.record_id.cmp(&b.record_id))
}

/// Sort results into their final ranking order.
pub fn sort_ranked(results: &mut [SimilarRecord]) {
    results.sort_unstable_by(rank_order);
}

/// Sort results and keep the best `limit` of them.
///
/// A `limit` of zero selects [`DEFAULT_LIMIT`].
pub fn top_k(mut results: Vec<SimilarRecord>, limit: usize) -> Vec<SimilarRecord> {
    let limit = if limit == 0 { DEFAULT_LIMIT } else { limit };
    sort_ranked(&mut results);
    results.truncate(limit);
    results
}
