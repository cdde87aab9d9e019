//! Memory log entries.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MIN_IMPORTANCE: u8 = 1;
pub const MAX_IMPORTANCE: u8 = 10;

/// Identifier of an entry in one sim's memory log. Monotonic per sim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryId(pub u64);

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What produced an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemoryKind {
    /// Something the sim perceived.
    Observation,
    /// A higher-level conclusion drawn from earlier entries.
    Reflection { sources: Vec<MemoryId> },
}

/// One immutable entry in a sim's memory log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: MemoryId,
    #[serde(flatten)]
    pub kind: MemoryKind,
    /// Simulation time at which the entry was written.
    pub timestamp: NaiveDateTime,
    pub title: String,
    pub content: String,
    /// 1 (mundane) to 10 (life changing).
    pub importance: u8,
    pub embedding: Vec<f32>,
}

impl MemoryEntry {
    pub fn is_reflection(&self) -> bool {
        matches!(self.kind, MemoryKind::Reflection { .. })
    }
}

/// Clamp an importance rating into `[MIN_IMPORTANCE, MAX_IMPORTANCE]`.
pub fn clamp_importance(importance: i64) -> u8 {
    importance.clamp(MIN_IMPORTANCE as i64, MAX_IMPORTANCE as i64) as u8
}
