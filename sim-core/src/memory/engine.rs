//! Memory operations against the shared world.
//!
//! Embedding and summarization happen without holding the world lock; the
//! lock is only taken to read or write the sim's store.

use super::entry::{MemoryEntry, MemoryId, MemoryKind};
use super::relationship::Relationship;
use super::scoring::rank;
use crate::embedding::{validate_embedding, Embedder, EmbeddingError};
use crate::llm::LlmError;
use crate::summary::Summarizer;
use crate::world::{LocationId, ObjectId, SharedWorld, SimId, World, WorldError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors from memory operations.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("embedding service failed: {0}")]
    EmbeddingService(#[from] EmbeddingError),

    #[error(transparent)]
    World(#[from] WorldError),

    #[error("summarizer failed: {0}")]
    Summary(#[from] LlmError),

    #[error("reflection source {id} does not exist")]
    UnknownSource { id: MemoryId },
}

/// Render memories for a prompt.
pub fn format_memories<'a>(memories: impl IntoIterator<Item = &'a MemoryEntry>) -> String {
    let body: Vec<String> = memories
        .into_iter()
        .map(|m| format!("{}: {}", m.title, m.content))
        .collect();
    format!("<Memory>{}</Memory>", body.join(" \n "))
}

/// How `viewer` currently refers to `other`, if it has a name for them.
pub fn relationship_name(world: &World, viewer: SimId, other: SimId) -> Result<Option<String>, WorldError> {
    Ok(world
        .sim(viewer)?
        .memory
        .relationship(other)
        .map(|rel| rel.name.clone())
        .filter(|name| !name.trim().is_empty()))
}

/// What `viewer` would call `other`: its relationship name, else what it
/// knows about them, else `other`'s outward description.
pub fn describe_sim(world: &World, viewer: SimId, other: SimId) -> Result<String, WorldError> {
    if let Some(name) = relationship_name(world, viewer, other)? {
        return Ok(name);
    }
    let other_sim = world.sim(other)?;
    Ok(world
        .sim(viewer)?
        .memory
        .relationship(other)
        .map(|rel| rel.text.clone())
        .filter(|text| !text.trim().is_empty())
        .unwrap_or_else(|| other_sim.description.clone()))
}

/// Writes, scores and consolidates sim memories.
#[derive(Clone)]
pub struct MemoryEngine {
    embedder: Arc<dyn Embedder>,
    summarizer: Arc<dyn Summarizer>,
    max_similar_memories: usize,
}

impl MemoryEngine {
    pub fn new(embedder: Arc<dyn Embedder>, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            embedder,
            summarizer,
            max_similar_memories: crate::config::DEFAULT_MAX_SIMILAR_MEMORIES,
        }
    }

    pub fn with_max_similar_memories(mut self, k: usize) -> Self {
        self.max_similar_memories = k;
        self
    }

    pub fn max_similar_memories(&self) -> usize {
        self.max_similar_memories
    }

    pub fn summarizer(&self) -> &Arc<dyn Summarizer> {
        &self.summarizer
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        let embedding = self.embedder.embed(text).await?;
        validate_embedding(&embedding, self.embedder.dimension())?;
        Ok(embedding)
    }

    /// Record an observation. Nothing is written if embedding fails.
    #[instrument(skip(self, world, content), fields(sim = %sim))]
    pub async fn add(
        &self,
        world: &SharedWorld,
        sim: SimId,
        title: &str,
        content: &str,
        importance: i64,
    ) -> Result<MemoryId, MemoryError> {
        self.append(world, sim, MemoryKind::Observation, title, content, importance)
            .await
    }

    /// Record a reflection derived from earlier entries.
    #[instrument(skip(self, world, content, sources), fields(sim = %sim))]
    pub async fn add_reflection(
        &self,
        world: &SharedWorld,
        sim: SimId,
        title: &str,
        content: &str,
        importance: i64,
        sources: Vec<MemoryId>,
    ) -> Result<MemoryId, MemoryError> {
        {
            let world = world.read().await;
            let store = &world.sim(sim)?.memory;
            if let Some(&id) = sources.iter().find(|&&id| store.get(id).is_none()) {
                return Err(MemoryError::UnknownSource { id });
            }
        }
        self.append(
            world,
            sim,
            MemoryKind::Reflection { sources },
            title,
            content,
            importance,
        )
        .await
    }

    async fn append(
        &self,
        world: &SharedWorld,
        sim: SimId,
        kind: MemoryKind,
        title: &str,
        content: &str,
        importance: i64,
    ) -> Result<MemoryId, MemoryError> {
        let embedding = self.embed(content).await?;

        let mut world = world.write().await;
        let now = world.now();
        let id = world
            .sim_mut(sim)?
            .memory
            .append(kind, title, content, importance, embedding, now);
        debug!(memory = %id, title, "Memory added");
        Ok(id)
    }

    /// The default number of entries most relevant to `query`, best first.
    pub async fn retrieve(
        &self,
        world: &SharedWorld,
        sim: SimId,
        query: &str,
    ) -> Result<Vec<MemoryEntry>, MemoryError> {
        self.retrieve_top(world, sim, query, self.max_similar_memories)
            .await
    }

    /// The `k` entries most relevant to `query`, best first.
    #[instrument(skip(self, world, query), fields(sim = %sim))]
    pub async fn retrieve_top(
        &self,
        world: &SharedWorld,
        sim: SimId,
        query: &str,
        k: usize,
    ) -> Result<Vec<MemoryEntry>, MemoryError> {
        let query = self.embed(query).await?;

        let world = world.read().await;
        let store = &world.sim(sim)?.memory;
        let ranked = rank(&query, store.entries(), world.now(), k);
        debug!(
            candidates = store.len(),
            returned = ranked.len(),
            "Memories retrieved"
        );
        Ok(ranked.into_iter().map(|s| s.entry.clone()).collect())
    }

    /// Fold new information about `other` into `sim`'s relationship.
    ///
    /// The first piece of information is stored as is. Later pieces are
    /// appended to the existing text and the result re-summarized, so each
    /// pair of sims keeps a single relationship entry.
    #[instrument(skip(self, world, delta), fields(sim = %sim, other = %other))]
    pub async fn update_relationship(
        &self,
        world: &SharedWorld,
        sim: SimId,
        other: SimId,
        delta: &str,
    ) -> Result<(), MemoryError> {
        let (existing, other_description) = {
            let world = world.read().await;
            let other_description = world.sim(other)?.description.clone();
            let existing = world.sim(sim)?.memory.relationship(other).cloned();
            (existing, other_description)
        };

        let relationship = match existing {
            None => {
                info!("New relationship");
                Relationship::new(other_description, delta.trim())
            }
            Some(current) => {
                let combined = current.appended(delta);
                let context = format!(
                    "Everything I know about {}. Keep names, facts and how they treated me.",
                    current.name
                );
                let text = self.summarizer.summarize(&context, &combined).await?;
                Relationship::new(current.name, text)
            }
        };

        let mut world = world.write().await;
        let store = &mut world.sim_mut(sim)?.memory;
        // Keep a name learned while the summarizer was running.
        let name = store
            .relationship(other)
            .map(|rel| rel.name.clone())
            .unwrap_or(relationship.name);
        store.set_relationship(other, Relationship::new(name, relationship.text));
        Ok(())
    }

    /// Remember something about an object.
    pub async fn add_object_memory(
        &self,
        world: &SharedWorld,
        sim: SimId,
        location: LocationId,
        object: ObjectId,
        text: &str,
    ) -> Result<(), MemoryError> {
        let mut world = world.write().await;
        world
            .sim_mut(sim)?
            .memory
            .add_object_memory(location, object, text);
        Ok(())
    }

    /// Forget an object. Returns what was remembered.
    pub async fn delete_object_memory(
        &self,
        world: &SharedWorld,
        sim: SimId,
        location: LocationId,
        object: ObjectId,
    ) -> Result<Option<String>, MemoryError> {
        let mut world = world.write().await;
        Ok(world
            .sim_mut(sim)?
            .memory
            .delete_object_memory(location, object))
    }

    pub async fn object_memory(
        &self,
        world: &SharedWorld,
        sim: SimId,
        location: LocationId,
        object: ObjectId,
    ) -> Result<Option<String>, MemoryError> {
        let world = world.read().await;
        Ok(world
            .sim(sim)?
            .memory
            .object_memory(location, object)
            .map(str::to_string))
    }

    /// Condense memories down to what matters for `context`.
    pub async fn summarize_memories(
        &self,
        context: &str,
        memories: &[MemoryEntry],
    ) -> Result<String, MemoryError> {
        if memories.is_empty() {
            return Ok(String::new());
        }
        Ok(self
            .summarizer
            .summarize(context, &format_memories(memories))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ConcatSummarizer, FixedEmbedder};
    use crate::world::World;

    fn setup() -> (SharedWorld, SimId, SimId) {
        let mut world = World::new();
        let village = world.add_location("Village", "A quiet village");
        let anna = world.add_sim("Anna", "a young baker", village).unwrap();
        let piotr = world.add_sim("Piotr", "a tall miller", village).unwrap();
        (world.into_shared(), anna, piotr)
    }

    fn engine(embedder: FixedEmbedder) -> (MemoryEngine, Arc<ConcatSummarizer>) {
        let summarizer = Arc::new(ConcatSummarizer::new());
        let engine = MemoryEngine::new(Arc::new(embedder), summarizer.clone());
        (engine, summarizer)
    }

    #[tokio::test]
    async fn test_add_and_retrieve() {
        let (world, anna, _) = setup();
        let embedder = FixedEmbedder::new(2)
            .with("bread", vec![1.0, 0.0])
            .with("river", vec![0.0, 1.0])
            .with("baking", vec![0.9, 0.1]);
        let (engine, _) = engine(embedder);

        let bread = engine.add(&world, anna, "Bread", "bread", 5).await.unwrap();
        let river = engine.add(&world, anna, "River", "river", 9).await.unwrap();
        assert_eq!((bread, river), (MemoryId(0), MemoryId(1)));

        let found = engine.retrieve(&world, anna, "baking").await.unwrap();
        let ids: Vec<MemoryId> = found.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![bread, river]);

        let top = engine.retrieve_top(&world, anna, "baking", 1).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].title, "Bread");
    }

    #[tokio::test]
    async fn test_embedding_failure_appends_nothing() {
        let (world, anna, _) = setup();
        let (engine, _) = engine(FixedEmbedder::new(2));

        let err = engine.add(&world, anna, "t", "unknown text", 5).await.unwrap_err();
        assert!(matches!(err, MemoryError::EmbeddingService(_)));
        assert!(world.read().await.sim(anna).unwrap().memory.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_dimension_rejected_on_write() {
        let (world, anna, _) = setup();
        let (engine, _) = engine(FixedEmbedder::new(3).with("short", vec![1.0]));
        let err = engine.add(&world, anna, "t", "short", 5).await.unwrap_err();
        assert!(matches!(
            err,
            MemoryError::EmbeddingService(EmbeddingError::Dimension { expected: 3, found: 1 })
        ));
    }

    #[tokio::test]
    async fn test_importance_is_clamped() {
        let (world, anna, _) = setup();
        let (engine, _) = engine(FixedEmbedder::new(2).with_fallback(vec![1.0, 0.0]));
        let id = engine.add(&world, anna, "t", "c", 99).await.unwrap();
        let world = world.read().await;
        assert_eq!(world.sim(anna).unwrap().memory.get(id).unwrap().importance, 10);
    }

    #[tokio::test]
    async fn test_reflection_sources_must_exist() {
        let (world, anna, _) = setup();
        let (engine, _) = engine(FixedEmbedder::new(2).with_fallback(vec![1.0, 0.0]));
        let first = engine.add(&world, anna, "a", "a", 3).await.unwrap();

        let reflection = engine
            .add_reflection(&world, anna, "r", "insight", 6, vec![first])
            .await
            .unwrap();
        {
            let world = world.read().await;
            let entry = world.sim(anna).unwrap().memory.get(reflection).unwrap().clone();
            assert_eq!(entry.kind, MemoryKind::Reflection { sources: vec![first] });
        }

        let err = engine
            .add_reflection(&world, anna, "r", "insight", 6, vec![MemoryId(40)])
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::UnknownSource { id: MemoryId(40) }));
    }

    #[tokio::test]
    async fn test_relationship_consolidates() {
        let (world, anna, piotr) = setup();
        let (engine, summarizer) = engine(FixedEmbedder::new(2));

        engine
            .update_relationship(&world, anna, piotr, "He sells flour.")
            .await
            .unwrap();
        assert_eq!(summarizer.calls().len(), 0);

        engine
            .update_relationship(&world, anna, piotr, "He owes me money.")
            .await
            .unwrap();
        let calls = summarizer.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "He sells flour. He owes me money.");

        let world = world.read().await;
        let memory = &world.sim(anna).unwrap().memory;
        assert_eq!(memory.relationships().len(), 1);
        let rel = memory.relationship(piotr).unwrap();
        assert_eq!(rel.name, "a tall miller");
        assert_eq!(rel.text, "He sells flour. He owes me money.");
    }

    #[tokio::test]
    async fn test_describe_sim_fallbacks() {
        let (world, anna, piotr) = setup();
        {
            let world = world.read().await;
            assert_eq!(relationship_name(&world, anna, piotr).unwrap(), None);
            assert_eq!(describe_sim(&world, anna, piotr).unwrap(), "a tall miller");
        }
        {
            let mut world = world.write().await;
            let memory = &mut world.sim_mut(anna).unwrap().memory;
            memory.set_relationship(piotr, Relationship::new("", "Grinds grain."));
        }
        {
            let world = world.read().await;
            assert_eq!(describe_sim(&world, anna, piotr).unwrap(), "Grinds grain.");
        }
        {
            let mut world = world.write().await;
            world.sim_mut(anna).unwrap().memory.rename_relationship(piotr, "Piotr");
        }
        let world = world.read().await;
        assert_eq!(describe_sim(&world, anna, piotr).unwrap(), "Piotr");
        assert!(matches!(
            describe_sim(&world, anna, SimId(9)),
            Err(WorldError::UnknownSim(SimId(9)))
        ));
    }

    #[tokio::test]
    async fn test_object_memory_through_engine() {
        let (world, anna, _) = setup();
        let (engine, _) = engine(FixedEmbedder::new(2));
        let (loc, obj) = (LocationId(0), ObjectId(3));

        engine.add_object_memory(&world, anna, loc, obj, "A well").await.unwrap();
        engine.add_object_memory(&world, anna, loc, obj, "The water is clear").await.unwrap();
        assert_eq!(
            engine.object_memory(&world, anna, loc, obj).await.unwrap().as_deref(),
            Some("A well. The water is clear")
        );
        engine.delete_object_memory(&world, anna, loc, obj).await.unwrap();
        assert_eq!(engine.object_memory(&world, anna, loc, obj).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_format_and_summarize_memories() {
        let (world, anna, _) = setup();
        let (engine, summarizer) = engine(FixedEmbedder::new(2).with_fallback(vec![1.0, 0.0]));
        engine.add(&world, anna, "Bread", "I baked bread", 3).await.unwrap();
        engine.add(&world, anna, "Rain", "It rained", 2).await.unwrap();

        let memories = world.read().await.sim(anna).unwrap().memory.entries().to_vec();
        assert_eq!(
            format_memories(&memories),
            "<Memory>Bread: I baked bread \n Rain: It rained</Memory>"
        );

        assert_eq!(engine.summarize_memories("ctx", &[]).await.unwrap(), "");
        let summary = engine.summarize_memories("ctx", &memories).await.unwrap();
        assert_eq!(summary, format_memories(&memories));
        assert_eq!(summarizer.calls()[0].0, "ctx");
    }
}
