//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MAX_SIMILAR_MEMORIES: usize = 5;
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_EMBED_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_PARSE_RETRIES: usize = 2;
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 256;

/// Errors from reading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Tunables shared by the resolver, memory engine and collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How many memories `retrieve` returns by default.
    pub max_similar_memories: usize,

    /// Upper bound on a single provider execution.
    pub provider_timeout: Duration,

    /// Upper bound on a single embedding call.
    pub embed_timeout: Duration,

    /// Upper bound on a single language model call.
    pub llm_timeout: Duration,

    /// Extra attempts when a model reply does not parse.
    pub parse_retries: usize,

    /// Dimension of embeddings produced by the local embedder.
    pub embedding_dimension: usize,

    /// Where the world is saved, if anywhere.
    pub save_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_similar_memories: DEFAULT_MAX_SIMILAR_MEMORIES,
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
            embed_timeout: DEFAULT_EMBED_TIMEOUT,
            llm_timeout: DEFAULT_LLM_TIMEOUT,
            parse_retries: DEFAULT_PARSE_RETRIES,
            embedding_dimension: DEFAULT_EMBEDDING_DIMENSION,
            save_path: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from `SIM_*` environment variables.
    ///
    /// A `.env` file in the working directory is read first when present.
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let mut cfg = Self::default();
        if let Some(v) = env_parse("SIM_MAX_SIMILAR_MEMORIES")? {
            cfg.max_similar_memories = v;
        }
        if let Some(secs) = env_parse("SIM_PROVIDER_TIMEOUT_SECS")? {
            cfg.provider_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("SIM_EMBED_TIMEOUT_SECS")? {
            cfg.embed_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("SIM_LLM_TIMEOUT_SECS")? {
            cfg.llm_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = env_parse("SIM_PARSE_RETRIES")? {
            cfg.parse_retries = v;
        }
        if let Some(v) = env_parse("SIM_EMBEDDING_DIMENSION")? {
            cfg.embedding_dimension = v;
        }
        if let Ok(path) = std::env::var("SIM_SAVE_PATH") {
            if !path.is_empty() {
                cfg.save_path = Some(PathBuf::from(path));
            }
        }
        Ok(cfg)
    }

    pub fn with_max_similar_memories(mut self, k: usize) -> Self {
        self.max_similar_memories = k;
        self
    }

    pub fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }

    pub fn with_embed_timeout(mut self, timeout: Duration) -> Self {
        self.embed_timeout = timeout;
        self
    }

    pub fn with_llm_timeout(mut self, timeout: Duration) -> Self {
        self.llm_timeout = timeout;
        self
    }

    pub fn with_parse_retries(mut self, retries: usize) -> Self {
        self.parse_retries = retries;
        self
    }

    pub fn with_embedding_dimension(mut self, dimension: usize) -> Self {
        self.embedding_dimension = dimension;
        self
    }

    pub fn with_save_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.save_path = Some(path.into());
        self
    }
}

fn env_parse<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(None),
    }
}
