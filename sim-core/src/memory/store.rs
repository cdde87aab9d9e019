//! Per-sim memory storage.

use super::entry::{clamp_importance, MemoryEntry, MemoryId, MemoryKind};
use super::relationship::Relationship;
use crate::world::{LocationId, ObjectId, SimId};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Everything one sim remembers.
///
/// - an append-only log of observations and reflections
/// - one consolidated relationship per other sim
/// - free text notes about objects, keyed by location and object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStore {
    #[serde(default)]
    entries: Vec<MemoryEntry>,
    #[serde(default)]
    relationships: BTreeMap<SimId, Relationship>,
    #[serde(default)]
    object_memories: BTreeMap<LocationId, BTreeMap<ObjectId, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id the next appended entry will receive.
    pub fn next_id(&self) -> MemoryId {
        self.entries
            .iter()
            .map(|entry| entry.id.0 + 1)
            .max()
            .map(MemoryId)
            .unwrap_or(MemoryId(0))
    }

    /// Append an already embedded entry and return its id.
    ///
    /// Importance is clamped into range.
    pub fn append(
        &mut self,
        kind: MemoryKind,
        title: impl Into<String>,
        content: impl Into<String>,
        importance: i64,
        embedding: Vec<f32>,
        timestamp: NaiveDateTime,
    ) -> MemoryId {
        let id = self.next_id();
        self.entries.push(MemoryEntry {
            id,
            kind,
            timestamp,
            title: title.into(),
            content: content.into(),
            importance: clamp_importance(importance),
            embedding,
        });
        id
    }

    pub fn entries(&self) -> &[MemoryEntry] {
        &self.entries
    }

    pub fn get(&self, id: MemoryId) -> Option<&MemoryEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn relationship(&self, other: SimId) -> Option<&Relationship> {
        self.relationships.get(&other)
    }

    pub fn relationships(&self) -> &BTreeMap<SimId, Relationship> {
        &self.relationships
    }

    pub fn set_relationship(&mut self, other: SimId, relationship: Relationship) {
        self.relationships.insert(other, relationship);
    }

    /// Rename how this sim refers to `other`. Returns false when there is no
    /// relationship yet.
    pub fn rename_relationship(&mut self, other: SimId, name: impl Into<String>) -> bool {
        match self.relationships.get_mut(&other) {
            Some(relationship) => {
                relationship.name = name.into();
                true
            }
            None => false,
        }
    }

    pub fn object_memory(&self, location: LocationId, object: ObjectId) -> Option<&str> {
        self.object_memories
            .get(&location)
            .and_then(|objects| objects.get(&object))
            .map(String::as_str)
    }

    pub fn object_memories(&self) -> &BTreeMap<LocationId, BTreeMap<ObjectId, String>> {
        &self.object_memories
    }

    /// Merge a note about an object into what is already remembered.
    pub fn add_object_memory(&mut self, location: LocationId, object: ObjectId, text: &str) {
        let slot = self
            .object_memories
            .entry(location)
            .or_default()
            .entry(object)
            .or_default();
        if slot.is_empty() {
            slot.push_str(text);
        } else {
            slot.push_str(". ");
            slot.push_str(text);
        }
    }

    /// Forget an object. Returns what was remembered about it.
    pub fn delete_object_memory(&mut self, location: LocationId, object: ObjectId) -> Option<String> {
        let objects = self.object_memories.get_mut(&location)?;
        let removed = objects.remove(&object);
        if objects.is_empty() {
            self.object_memories.remove(&location);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::SimClock;

    #[test]
    fn test_ids_are_monotonic_from_zero() {
        let now = SimClock::default().now();
        let mut store = MemoryStore::new();
        assert_eq!(store.next_id(), MemoryId(0));
        let a = store.append(MemoryKind::Observation, "a", "", 3, vec![1.0], now);
        let b = store.append(MemoryKind::Observation, "b", "", 30, vec![1.0], now);
        assert_eq!((a, b), (MemoryId(0), MemoryId(1)));
        assert_eq!(store.get(b).unwrap().importance, 10);
    }

    #[test]
    fn test_object_memory_merge_and_delete() {
        let mut store = MemoryStore::new();
        let (loc, obj) = (LocationId(1), ObjectId(4));

        store.add_object_memory(loc, obj, "A rusty bucket");
        store.add_object_memory(loc, obj, "There is a hole in it");
        assert_eq!(
            store.object_memory(loc, obj),
            Some("A rusty bucket. There is a hole in it")
        );

        assert_eq!(
            store.delete_object_memory(loc, obj).as_deref(),
            Some("A rusty bucket. There is a hole in it")
        );
        assert!(store.object_memory(loc, obj).is_none());
        assert!(store.object_memories().is_empty());
        assert!(store.delete_object_memory(loc, obj).is_none());
    }

    #[test]
    fn test_relationship_rename() {
        let mut store = MemoryStore::new();
        assert!(!store.rename_relationship(SimId(2), "Anna"));
        store.set_relationship(SimId(2), Relationship::new("a young woman", "Bakes bread."));
        assert!(store.rename_relationship(SimId(2), "Anna"));
        assert_eq!(store.relationship(SimId(2)).unwrap().name, "Anna");
    }

    #[test]
    fn test_store_serializes_with_integer_keys() {
        let mut store = MemoryStore::new();
        store.set_relationship(SimId(2), Relationship::new("Anna", "Bakes bread."));
        store.add_object_memory(LocationId(1), ObjectId(4), "A bucket");

        let json = serde_json::to_string(&store).unwrap();
        let back: MemoryStore = serde_json::from_str(&json).unwrap();
        assert_eq!(back, store);
    }
}
