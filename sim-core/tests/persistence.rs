//! Saving and restoring a world with sim memories.

use sim_core::memory::{MemoryEngine, Relationship};
use sim_core::persist::{JsonStorage, PersistError, SavedWorld, SimStorage};
use sim_core::testing::{ConcatSummarizer, FixedEmbedder};
use sim_core::world::{SimEvent, World};
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test]
async fn test_save_and_reopen_keeps_memories() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("saves").join("village.json");

    let mut world = World::new();
    let village = world.add_location("Village", "Mill by the river");
    let well = world
        .location_mut(village)
        .unwrap()
        .add_object("Stone well", "Deep and cold");
    let anna = world.add_sim("Anna", "a young baker", village).unwrap();
    let piotr = world.add_sim("Piotr", "a tall miller", village).unwrap();
    let world = world.into_shared();

    let engine = MemoryEngine::new(
        Arc::new(FixedEmbedder::new(3).with_fallback(vec![0.25, 0.5, 1.0])),
        Arc::new(ConcatSummarizer::new()),
    );
    engine
        .add(&world, anna, "Baked", "I baked rye bread", 4)
        .await
        .unwrap();
    world.write().await.clock.advance_minutes(90);
    let second = engine
        .add_reflection(&world, anna, "Busy", "Mornings are busy", 7, vec![])
        .await
        .unwrap();
    engine
        .update_relationship(&world, anna, piotr, "He sells flour.")
        .await
        .unwrap();
    engine
        .add_object_memory(&world, anna, village, well, "The water is clear")
        .await
        .unwrap();
    {
        let mut world = world.write().await;
        world
            .sim_mut(anna)
            .unwrap()
            .memory
            .rename_relationship(piotr, "Piotr");
        world
            .push_event(piotr, SimEvent::Arrival { sim: anna })
            .unwrap();
    }

    let storage = JsonStorage::new(world.clone(), &path);
    storage.save().await.unwrap();

    let reopened = JsonStorage::open(&path).await.unwrap();
    let restored = reopened.get_sim(anna).await.unwrap();
    let saved = storage.get_sim(anna).await.unwrap();
    assert_eq!(restored.memory, saved.memory);
    assert_eq!(restored.memory.len(), 2);
    assert!(restored.memory.get(second).unwrap().is_reflection());
    assert_eq!(
        restored.memory.relationship(piotr),
        Some(&Relationship::new("Piotr", "He sells flour."))
    );
    assert_eq!(
        restored.memory.object_memory(village, well),
        Some("The water is clear")
    );
    assert_eq!(
        reopened.get_sim(piotr).await.unwrap().events.len(),
        1
    );
    assert_eq!(
        reopened.world().read().await.now(),
        world.read().await.now()
    );

    // Ids continue where the saved log left off.
    assert_eq!(restored.memory.next_id().0, 2);

    let metadata = SavedWorld::peek_metadata(&path).await.unwrap();
    assert_eq!(metadata.memories, 2);
    assert_eq!(metadata.sims, 2);
}

#[tokio::test]
async fn test_open_missing_file() {
    let temp_dir = TempDir::new().unwrap();
    let err = JsonStorage::open(temp_dir.path().join("missing.json"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, PersistError::Io(_)));
}
