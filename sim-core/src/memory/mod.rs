//! Sim memory.
//!
//! Each sim owns a [`MemoryStore`]: an append-only log of observations and
//! reflections ranked by relevance, one consolidated [`Relationship`] per
//! other sim, and merged notes about objects. [`MemoryEngine`] performs the
//! operations that need the embedder or summarizer.

mod engine;
mod entry;
mod relationship;
mod scoring;
mod store;

pub use engine::{describe_sim, format_memories, relationship_name, MemoryEngine, MemoryError};
pub use entry::{clamp_importance, MemoryEntry, MemoryId, MemoryKind, MAX_IMPORTANCE, MIN_IMPORTANCE};
pub use relationship::Relationship;
pub use scoring::{
    cosine_similarity, elapsed_minutes, rank, recency_decay, relevance_score, score_entry,
    MalformedMemory, ScoredMemory,
};
pub use store::MemoryStore;
