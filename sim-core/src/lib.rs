//! Simulation engine for autonomous characters.
//!
//! This crate provides:
//! - Parameter resolution: actions declare the parameters they need and a
//!   registry of providers computes the missing ones in dependency order
//! - Sim memory: observations ranked by relevance, importance and recency,
//!   plus consolidated relationship memories
//! - Action dispatch, built-in providers and actions, event perception
//! - World persistence
//!
//! # Quick Start
//!
//! ```ignore
//! use sim_core::{default_dispatcher, default_registry, ActionType, ClaudeModel};
//! use sim_core::{EngineConfig, KnownValues, Services, World};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::from_env()?;
//!     let mut world = World::new();
//!     let village = world.add_location("Village", "A quiet village");
//!     let anna = world.add_sim("Anna", "a young baker", village)?;
//!
//!     let services = Services::from_config(world.into_shared(), ClaudeModel::from_env()?, &config);
//!     let registry = Arc::new(default_registry(&services)?);
//!     let dispatcher = default_dispatcher(&services, registry).with_config(&config);
//!
//!     let mut seed = KnownValues::new();
//!     seed.insert("actor_character_id", anna.0.into());
//!     seed.insert("intent", "Look at the well".into());
//!     dispatcher.dispatch(ActionType::InvestigateObject, seed).await?;
//!     Ok(())
//! }
//! ```

extern crate self as sim_core;

pub mod actions;
pub mod config;
pub mod dispatch;
pub mod embedding;
pub mod extract;
pub mod llm;
pub mod memory;
pub mod parameter;
pub mod perception;
pub mod persist;
pub mod provider;
pub mod providers;
pub mod resolution;
pub mod services;
pub mod summary;
pub mod testing;
pub mod world;

pub use sim_macros::Parameters;

// Primary public API
pub use actions::default_dispatcher;
pub use config::EngineConfig;
pub use dispatch::{ActionDispatcher, ActionRouter, ActionType, DispatchError};
pub use embedding::{Embedder, HashEmbedder};
pub use llm::{ClaudeModel, LanguageModel};
pub use memory::{MemoryEngine, MemoryEntry, MemoryId, MemoryStore};
pub use parameter::{FilledParameter, KnownValues, Parameter, ParameterSet};
pub use perception::Perception;
pub use persist::{JsonStorage, SavedWorld, SimStorage};
pub use provider::{Provider, ProviderRegistry};
pub use providers::default_registry;
pub use resolution::{CancelToken, ResolutionContext, ResolveError};
pub use services::Services;
pub use summary::{LlmSummarizer, Summarizer};
pub use world::{SharedWorld, SimId, World};
