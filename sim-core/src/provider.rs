//! Providers compute parameter values from other parameter values.

use crate::embedding::EmbeddingError;
use crate::extract::{ParseError, ParseFailure};
use crate::llm::LlmError;
use crate::memory::MemoryError;
use crate::parameter::{FilledParameter, KnownValues, Parameter, ParameterMap, ValueError};
use crate::world::WorldError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while a provider computes its outputs.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("could not parse model reply: {0}")]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Value(#[from] ValueError),

    #[error("language model error: {0}")]
    Llm(#[from] LlmError),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("world error: {0}")]
    World(#[from] WorldError),

    #[error("provider did not produce '{name}'")]
    MissingOutput { name: String },

    #[error("{0}")]
    Failed(String),
}

impl ParseFailure for ProviderError {
    fn is_parse_failure(&self) -> bool {
        matches!(self, ProviderError::Parse(_))
    }
}

/// Something that can fill in parameters.
///
/// A provider declares the inputs it reads and the outputs it may produce.
/// When invoked for one of its outputs it may produce others as well; the
/// resolver merges everything it returns without overwriting known values.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short identifier used in logs and errors.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Parameters that must be known before `execute` runs.
    ///
    /// Optional inputs without a producer are skipped.
    fn inputs(&self) -> ParameterMap;

    /// Parameters this provider can produce.
    fn outputs(&self) -> ParameterMap;

    /// Compute `target` (and possibly other outputs) from `known`.
    async fn execute(
        &self,
        target: &Parameter,
        known: &KnownValues,
    ) -> Result<BTreeMap<String, FilledParameter>, ProviderError>;
}

/// Registry configuration errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("'{output}' is produced by both '{existing}' and '{duplicate}'")]
    DuplicateOutput {
        output: String,
        existing: String,
        duplicate: String,
    },
}

/// The set of providers available to a resolution.
///
/// Output names are unique across the registry, so every parameter has at
/// most one producer.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
    by_output: BTreeMap<String, usize>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider, rejecting it if it claims an output another provider
    /// already produces. The registry is unchanged on error.
    pub fn register(&mut self, provider: Arc<dyn Provider>) -> Result<(), RegistryError> {
        let outputs = provider.outputs();
        for output in outputs.keys() {
            if let Some(&index) = self.by_output.get(output) {
                return Err(RegistryError::DuplicateOutput {
                    output: output.clone(),
                    existing: self.providers[index].name().to_string(),
                    duplicate: provider.name().to_string(),
                });
            }
        }

        let index = self.providers.len();
        for output in outputs.into_keys() {
            self.by_output.insert(output, index);
        }
        self.providers.push(provider);
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, provider: impl Provider + 'static) -> Result<Self, RegistryError> {
        self.register(Arc::new(provider))?;
        Ok(self)
    }

    /// The sole producer of `name` and its registration index.
    pub fn producer(&self, name: &str) -> Option<(usize, &Arc<dyn Provider>)> {
        self.by_output
            .get(name)
            .map(|&index| (index, &self.providers[index]))
    }

    pub fn get(&self, index: usize) -> Option<&Arc<dyn Provider>> {
        self.providers.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Provider>> {
        self.providers.iter()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field(
                "providers",
                &self.providers.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field("outputs", &self.by_output.keys().collect::<Vec<_>>())
            .finish()
    }
}
