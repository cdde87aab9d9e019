//! Relevance scoring.
//!
//! `score = similarity * importance / max(ln(elapsed_minutes + 1), 1)`
//!
//! The decay is flat for roughly the first 1.7 minutes and logarithmic after.

use super::entry::{MemoryEntry, MemoryId};
use chrono::NaiveDateTime;
use std::cmp::Ordering;
use thiserror::Error;
use tracing::warn;

/// A stored entry that cannot be scored.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MalformedMemory {
    #[error("memory {id} has {found} dimensions, query has {expected}")]
    DimensionMismatch {
        id: MemoryId,
        expected: usize,
        found: usize,
    },

    #[error("memory {id} has non-finite embedding values")]
    NonFinite { id: MemoryId },
}

/// Cosine similarity; zero when either vector has no length.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Minutes from `then` to `now`, clamped at zero.
pub fn elapsed_minutes(now: NaiveDateTime, then: NaiveDateTime) -> f64 {
    let millis = (now - then).num_milliseconds();
    (millis as f64 / 60_000.0).max(0.0)
}

pub fn recency_decay(elapsed_minutes: f64) -> f64 {
    (elapsed_minutes.max(0.0) + 1.0).ln().max(1.0)
}

pub fn relevance_score(similarity: f64, importance: u8, elapsed_minutes: f64) -> f64 {
    similarity * importance as f64 / recency_decay(elapsed_minutes)
}

/// Score one entry against a query embedding.
pub fn score_entry(
    query: &[f32],
    entry: &MemoryEntry,
    now: NaiveDateTime,
) -> Result<f64, MalformedMemory> {
    if entry.embedding.len() != query.len() {
        return Err(MalformedMemory::DimensionMismatch {
            id: entry.id,
            expected: query.len(),
            found: entry.embedding.len(),
        });
    }
    if entry.embedding.iter().any(|x| !x.is_finite()) {
        return Err(MalformedMemory::NonFinite { id: entry.id });
    }
    let similarity = cosine_similarity(query, &entry.embedding);
    Ok(relevance_score(
        similarity,
        entry.importance,
        elapsed_minutes(now, entry.timestamp),
    ))
}

/// An entry with its relevance to a query.
#[derive(Debug, Clone, Copy)]
pub struct ScoredMemory<'a> {
    pub entry: &'a MemoryEntry,
    pub score: f64,
}

/// The `k` most relevant entries, best first.
///
/// Equal scores put the newer entry first. Malformed entries are logged and
/// left out.
pub fn rank<'a>(
    query: &[f32],
    entries: impl IntoIterator<Item = &'a MemoryEntry>,
    now: NaiveDateTime,
    k: usize,
) -> Vec<ScoredMemory<'a>> {
    let mut scored: Vec<ScoredMemory<'a>> = entries
        .into_iter()
        .filter_map(|entry| match score_entry(query, entry, now) {
            Ok(score) => Some(ScoredMemory { entry, score }),
            Err(err) => {
                warn!(error = %err, "Skipping malformed memory");
                None
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.entry.id.cmp(&a.entry.id))
    });
    scored.truncate(k);
    scored
}
