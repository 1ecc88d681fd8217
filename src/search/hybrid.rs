//! Hybrid search: reciprocal-rank fusion of a BM25 ranking and a vector
//! kNN ranking.
//!
//! The quality multiplier is applied once, inside [`super::bm25`], before
//! either ranking reaches this module — RRF fuses ranks, not raw scores,
//! so there is nothing here for that multiplier to touch a second time.

use std::collections::HashMap;

use crate::hash::{safe_max, safe_min};
use crate::model::Id;

use super::bm25::Bm25Hit;
use super::vector::VectorHit;

const DEFAULT_RRF_K: f64 = 60.0;
const DEFAULT_WEIGHT: f64 = 1.0;
const MAX_WEIGHT: f64 = 2.0;

/// Tunables for [`fuse`].
#[derive(Debug, Clone, Copy)]
pub struct FusionParams {
    pub k: f64,
    pub weight_bm25: f64,
    pub weight_semantic: f64,
}

impl Default for FusionParams {
    fn default() -> Self {
        FusionParams {
            k: DEFAULT_RRF_K,
            weight_bm25: DEFAULT_WEIGHT,
            weight_semantic: DEFAULT_WEIGHT,
        }
    }
}

impl FusionParams {
    fn clamped(&self) -> FusionParams {
        FusionParams {
            k: self.k,
            weight_bm25: self.weight_bm25.clamp(0.0, MAX_WEIGHT),
            weight_semantic: self.weight_semantic.clamp(0.0, MAX_WEIGHT),
        }
    }
}

/// One fused result: the entity it came from, its document, the RRF
/// score, and the final 1-based rank.
#[derive(Debug, Clone)]
pub struct FusedHit {
    pub entity_id: Id,
    pub document_id: Id,
    pub rrf_score: f64,
    pub rank: i64,
    pub bm25_rank: Option<i64>,
    pub vector_rank: Option<i64>,
    pub bm25_score: Option<f64>,
    pub vector_score: Option<f64>,
}

/// Fuse a BM25 ranking and a vector ranking by reciprocal rank, deduping
/// on entity id. `rrf_score(doc) = sum over sources of weight_source /
/// (k + rank_source)`; an entity present in only one ranking simply omits
/// that source's term.
pub fn fuse(bm25_hits: &[Bm25Hit], vector_hits: &[VectorHit], params: FusionParams) -> Vec<FusedHit> {
    let params = params.clamped();

    let mut scores: HashMap<Id, FusedHit> = HashMap::new();

    for (i, hit) in bm25_hits.iter().enumerate() {
        let rank = (i + 1) as i64;
        let term = params.weight_bm25 / (params.k + rank as f64);
        scores
            .entry(hit.entity_id.clone())
            .and_modify(|e| {
                e.rrf_score += term;
                e.bm25_rank = Some(rank);
                e.bm25_score = Some(hit.score);
            })
            .or_insert(FusedHit {
                entity_id: hit.entity_id.clone(),
                document_id: hit.document_id.clone(),
                rrf_score: term,
                rank: 0,
                bm25_rank: Some(rank),
                vector_rank: None,
                bm25_score: Some(hit.score),
                vector_score: None,
            });
    }

    for (i, hit) in vector_hits.iter().enumerate() {
        let rank = (i + 1) as i64;
        let term = params.weight_semantic / (params.k + rank as f64);
        scores
            .entry(hit.entity_id.clone())
            .and_modify(|e| {
                e.rrf_score += term;
                e.vector_rank = Some(rank);
                e.vector_score = Some(hit.score);
            })
            .or_insert(FusedHit {
                entity_id: hit.entity_id.clone(),
                document_id: hit.document_id.clone(),
                rrf_score: term,
                rank: 0,
                bm25_rank: None,
                vector_rank: Some(rank),
                bm25_score: None,
                vector_score: Some(hit.score),
            });
    }

    let mut fused: Vec<FusedHit> = scores.into_values().collect();
    fused.sort_by(|a, b| {
        b.rrf_score
            .partial_cmp(&a.rrf_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    for (i, hit) in fused.iter_mut().enumerate() {
        hit.rank = (i + 1) as i64;
    }
    fused
}

/// Normalize a score into `[0, 1]` against the min/max of `all_scores`,
/// for comparing relevance across otherwise-incomparable databases. A
/// zero-width range (every score identical, or a single score) maps to
/// the neutral `0.5`.
pub fn normalize_cross_database(score: f64, all_scores: &[f64]) -> f64 {
    let Some(min) = safe_min(all_scores.iter().copied()) else {
        return 0.5;
    };
    let Some(max) = safe_max(all_scores.iter().copied()) else {
        return 0.5;
    };
    let range = max - min;
    if range <= f64::EPSILON {
        return 0.5;
    }
    ((score - min) / range).clamp(0.0, 1.0)
}
