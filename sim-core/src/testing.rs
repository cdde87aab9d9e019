//! Test doubles for the engine's collaborators.
//!
//! - `ScriptedModel` replays canned language model replies
//! - `FixedEmbedder` returns preset vectors per text
//! - `ConcatSummarizer` returns the information unchanged and records calls
//! - `FnProvider` wraps a closure as a provider
//! - `RecordingAction` records the arguments it is called with

use crate::dispatch::{Action, ActionError};
use crate::embedding::{Embedder, EmbeddingError};
use crate::llm::{LanguageModel, LlmError};
use crate::parameter::{parameter_map, FilledParameter, KnownValues, Parameter, ParameterMap};
use crate::provider::{Provider, ProviderError};
use crate::summary::Summarizer;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A language model that returns scripted replies in order.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
    repeat_last: bool,
    last: Mutex<Option<String>>,
    delay: Option<Duration>,
}

impl ScriptedModel {
    pub fn new<S: Into<String>>(replies: impl IntoIterator<Item = S>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
            repeat_last: false,
            last: Mutex::new(None),
            delay: None,
        }
    }

    /// Keep returning the final reply once the script runs out.
    pub fn repeating(mut self) -> Self {
        self.repeat_last = true;
        self
    }

    /// Wait this long before every reply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every prompt received so far.
    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        lock(&self.prompts).push(prompt.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = lock(&self.replies).pop_front();
        match next {
            Some(reply) => {
                *lock(&self.last) = Some(reply.clone());
                Ok(reply)
            }
            None if self.repeat_last => lock(&self.last)
                .clone()
                .ok_or_else(|| LlmError::Config("script is empty".into())),
            None => Err(LlmError::Config("no scripted reply left".into())),
        }
    }
}

/// An embedder with preset vectors.
pub struct FixedEmbedder {
    dimension: usize,
    vectors: HashMap<String, Vec<f32>>,
    fallback: Option<Vec<f32>>,
}

impl FixedEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: HashMap::new(),
            fallback: None,
        }
    }

    pub fn with(mut self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        self.vectors.insert(text.into(), vector);
        self
    }

    /// Vector for any text without a preset one. Without a fallback such
    /// texts fail to embed.
    pub fn with_fallback(mut self, vector: Vec<f32>) -> Self {
        self.fallback = Some(vector);
        self
    }
}

#[async_trait]
impl Embedder for FixedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.vectors
            .get(text)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| EmbeddingError::Service(format!("no embedding for '{text}'")))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// A summarizer that returns the information unchanged.
#[derive(Default)]
pub struct ConcatSummarizer {
    calls: Mutex<Vec<(String, String)>>,
}

impl ConcatSummarizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(context, information)` of every call.
    pub fn calls(&self) -> Vec<(String, String)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl Summarizer for ConcatSummarizer {
    async fn summarize(&self, context: &str, information: &str) -> Result<String, LlmError> {
        lock(&self.calls).push((context.to_string(), information.to_string()));
        Ok(information.to_string())
    }
}

type ProviderFn =
    dyn Fn(&Parameter, &KnownValues) -> Result<BTreeMap<String, Value>, ProviderError> + Send + Sync;

/// A provider backed by a closure.
pub struct FnProvider {
    name: String,
    inputs: ParameterMap,
    outputs: ParameterMap,
    run: Box<ProviderFn>,
    calls: Arc<AtomicUsize>,
    delay: Option<Duration>,
}

impl FnProvider {
    pub fn new<F>(name: &str, outputs: &[&str], run: F) -> Self
    where
        F: Fn(&Parameter, &KnownValues) -> Result<BTreeMap<String, Value>, ProviderError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.to_string(),
            inputs: ParameterMap::new(),
            outputs: parameter_map(outputs.iter().map(|o| Parameter::required(*o, ""))),
            run: Box::new(run),
            calls: Arc::new(AtomicUsize::new(0)),
            delay: None,
        }
    }

    /// A provider that always produces `value` for `output`.
    pub fn constant(name: &str, output: &str, value: Value) -> Self {
        let key = output.to_string();
        Self::new(name, &[output], move |_, _| {
            Ok([(key.clone(), value.clone())].into_iter().collect())
        })
    }

    pub fn with_inputs(mut self, inputs: &[&str]) -> Self {
        for input in inputs {
            self.inputs
                .insert(input.to_string(), Parameter::required(*input, ""));
        }
        self
    }

    pub fn with_optional_inputs(mut self, inputs: &[&str]) -> Self {
        for input in inputs {
            self.inputs
                .insert(input.to_string(), Parameter::optional(*input, ""));
        }
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of times `execute` has started.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl Provider for FnProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "test provider"
    }

    fn inputs(&self) -> ParameterMap {
        self.inputs.clone()
    }

    fn outputs(&self) -> ParameterMap {
        self.outputs.clone()
    }

    async fn execute(
        &self,
        target: &Parameter,
        known: &KnownValues,
    ) -> Result<BTreeMap<String, FilledParameter>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let values = (self.run)(target, known)?;
        Ok(values
            .into_iter()
            .map(|(name, value)| {
                let parameter = self
                    .outputs
                    .get(&name)
                    .cloned()
                    .unwrap_or_else(|| Parameter::required(name.clone(), ""));
                (name, parameter.with_value(value))
            })
            .collect())
    }
}

/// An action that records its arguments.
pub struct RecordingAction {
    parameters: ParameterMap,
    calls: Arc<Mutex<Vec<KnownValues>>>,
    failure: Option<String>,
}

impl RecordingAction {
    pub fn new(parameters: Vec<Parameter>) -> Self {
        Self {
            parameters: parameter_map(parameters),
            calls: Arc::new(Mutex::new(Vec::new())),
            failure: None,
        }
    }

    /// Fail every call with this message after recording it.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    pub fn calls(&self) -> Arc<Mutex<Vec<KnownValues>>> {
        self.calls.clone()
    }
}

#[async_trait]
impl Action for RecordingAction {
    fn description(&self) -> &str {
        "records its arguments"
    }

    fn parameters(&self) -> ParameterMap {
        self.parameters.clone()
    }

    async fn execute(&self, args: KnownValues) -> Result<(), ActionError> {
        lock(&self.calls).push(args);
        match &self.failure {
            Some(message) => Err(ActionError::Failed(message.clone())),
            None => Ok(()),
        }
    }
}
