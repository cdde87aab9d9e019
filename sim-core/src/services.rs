//! Handles shared by the built-in providers and actions.

use crate::config::EngineConfig;
use crate::embedding::{Embedder, HashEmbedder, TimedEmbedder};
use crate::llm::{LanguageModel, TimedModel};
use crate::memory::MemoryEngine;
use crate::summary::LlmSummarizer;
use crate::world::SharedWorld;
use std::sync::Arc;

#[derive(Clone)]
pub struct Services {
    pub world: SharedWorld,
    pub memory: MemoryEngine,
    pub model: Arc<dyn LanguageModel>,
    /// Extra attempts when a model reply does not parse.
    pub parse_retries: usize,
}

impl Services {
    pub fn new(world: SharedWorld, memory: MemoryEngine, model: Arc<dyn LanguageModel>) -> Self {
        Self {
            world,
            memory,
            model,
            parse_retries: crate::config::DEFAULT_PARSE_RETRIES,
        }
    }

    pub fn with_parse_retries(mut self, retries: usize) -> Self {
        self.parse_retries = retries;
        self
    }

    /// Wire up the local embedder and a model-backed summarizer, with the
    /// configured timeouts around every model and embedding call.
    pub fn from_config<M: LanguageModel + 'static>(
        world: SharedWorld,
        model: M,
        config: &EngineConfig,
    ) -> Self {
        let model: Arc<dyn LanguageModel> = Arc::new(TimedModel::new(model, config.llm_timeout));
        let embedder: Arc<dyn Embedder> = Arc::new(TimedEmbedder::new(
            HashEmbedder::new(config.embedding_dimension),
            config.embed_timeout,
        ));
        let summarizer = Arc::new(LlmSummarizer::new(model.clone()));
        let memory = MemoryEngine::new(embedder, summarizer)
            .with_max_similar_memories(config.max_similar_memories);
        Self::new(world, memory, model).with_parse_retries(config.parse_retries)
    }
}
