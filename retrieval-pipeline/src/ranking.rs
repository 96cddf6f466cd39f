use std::cmp::Ordering;

use common::error::AppError;
use serde::Serialize;

use crate::corpus::{Corpus, CorpusEntry};

/// A corpus entry paired with its cosine similarity to the query.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RankedResult {
    pub entry: CorpusEntry,
    pub score: f32,
}

pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Zero, NaN and infinite norms all make the similarity meaningless.
pub(crate) fn is_usable_norm(norm: f32) -> bool {
    norm.is_finite() && norm > 0.0
}

fn similarity_from_parts(dot: f32, a_norm: f32, b_norm: f32) -> f32 {
    (dot / (a_norm * b_norm)).clamp(-1.0, 1.0)
}

/// Cosine similarity of two raw vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, AppError> {
    if a.len() != b.len() {
        return Err(AppError::DegenerateVector(format!(
            "dimension mismatch: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    let a_norm = l2_norm(a);
    let b_norm = l2_norm(b);
    if !is_usable_norm(a_norm) || !is_usable_norm(b_norm) {
        return Err(AppError::DegenerateVector(
            "cosine similarity is undefined for zero-norm or non-finite vectors".into(),
        ));
    }
    Ok(similarity_from_parts(dot(a, b), a_norm, b_norm))
}

/// Ranks every corpus entry against `query` and keeps the best `limit`.
///
/// Ordering is by descending similarity. Ties keep corpus order. An empty corpus
/// yields an empty result without inspecting the query.
pub fn rank(query: &[f32], corpus: &Corpus, limit: usize) -> Result<Vec<RankedResult>, AppError> {
    if corpus.is_empty() {
        return Ok(Vec::new());
    }

    if query.len() != corpus.dimension() {
        return Err(AppError::DegenerateVector(format!(
            "query has {} dimensions but the corpus uses {}",
            query.len(),
            corpus.dimension()
        )));
    }

    let query_norm = l2_norm(query);
    if !is_usable_norm(query_norm) {
        return Err(AppError::DegenerateVector(
            "query embedding has zero or non-finite norm".into(),
        ));
    }

    let mut scored: Vec<(&CorpusEntry, f32)> = corpus
        .scan()
        .map(|(entry, norm)| {
            (
                entry,
                similarity_from_parts(dot(query, &entry.vector), query_norm, norm),
            )
        })
        .collect();

    // `sort_by` is stable, so equal scores stay in insertion order.
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    scored.truncate(limit);

    Ok(scored
        .into_iter()
        .map(|(entry, score)| RankedResult {
            entry: entry.clone(),
            score,
        })
        .collect())
}
