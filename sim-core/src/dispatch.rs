//! Action dispatch.
//!
//! The dispatcher looks up an action, resolves the parameters it declares
//! through the provider registry, and calls it with exactly its declared
//! parameters: optional ones that could not be resolved are left out,
//! required ones must be present.

use crate::config::EngineConfig;
use crate::extract::{closest_match, tags, with_parse_retries, ParseError, ParseFailure};
use crate::llm::{LanguageModel, LlmError};
use crate::memory::MemoryError;
use crate::parameter::{KnownValues, ParameterMap, ValueError};
use crate::provider::ProviderRegistry;
use crate::resolution::{CancelToken, ResolutionContext, ResolveError};
use crate::world::WorldError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// The actions a sim can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Speak,
    InvestigateObject,
    HarvestObject,
}

impl ActionType {
    pub const ALL: [ActionType; 3] = [
        ActionType::Speak,
        ActionType::InvestigateObject,
        ActionType::HarvestObject,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Speak => "speak",
            ActionType::InvestigateObject => "investigate_object",
            ActionType::HarvestObject => "harvest_object",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionType::ALL
            .into_iter()
            .find(|action| action.as_str() == s.trim())
            .ok_or_else(|| format!("unknown action '{s}'"))
    }
}

/// Correlates the log lines of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DispatchId(Uuid);

impl DispatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DispatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DispatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised by an action after its parameters were resolved.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Value(#[from] ValueError),

    #[error("could not parse model reply: {0}")]
    Parse(#[from] ParseError),

    #[error("language model error: {0}")]
    Llm(#[from] LlmError),

    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("world error: {0}")]
    World(#[from] WorldError),

    #[error("{0}")]
    Failed(String),
}

impl ParseFailure for ActionError {
    fn is_parse_failure(&self) -> bool {
        matches!(self, ActionError::Parse(_))
    }
}

/// Something a sim can do.
#[async_trait]
pub trait Action: Send + Sync {
    fn description(&self) -> &str;

    /// Every parameter the action accepts.
    fn parameters(&self) -> ParameterMap;

    /// Run with the declared parameters that could be resolved.
    async fn execute(&self, args: KnownValues) -> Result<(), ActionError>;
}

/// Errors from dispatching an action.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no action registered for '{0}'")]
    UnknownAction(ActionType),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("required parameter '{name}' of '{action}' could not be resolved")]
    MissingRequired { action: ActionType, name: String },

    #[error("action '{action}' failed: {source}")]
    Action {
        action: ActionType,
        #[source]
        source: ActionError,
    },
}

/// Runs actions, filling in their parameters first.
#[derive(Clone)]
pub struct ActionDispatcher {
    actions: HashMap<ActionType, Arc<dyn Action>>,
    registry: Arc<ProviderRegistry>,
    provider_timeout: Duration,
}

impl ActionDispatcher {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            actions: HashMap::new(),
            registry,
            provider_timeout: crate::config::DEFAULT_PROVIDER_TIMEOUT,
        }
    }

    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.provider_timeout = config.provider_timeout;
        self
    }

    /// Register an action, replacing any earlier one of the same type.
    pub fn register(&mut self, action_type: ActionType, action: Arc<dyn Action>) {
        self.actions.insert(action_type, action);
    }

    pub fn with_action(mut self, action_type: ActionType, action: impl Action + 'static) -> Self {
        self.register(action_type, Arc::new(action));
        self
    }

    pub fn action(&self, action_type: ActionType) -> Option<&Arc<dyn Action>> {
        self.actions.get(&action_type)
    }

    /// Registered actions with their descriptions, in [`ActionType::ALL`] order.
    pub fn available(&self) -> Vec<(ActionType, String)> {
        ActionType::ALL
            .into_iter()
            .filter_map(|t| self.actions.get(&t).map(|a| (t, a.description().to_string())))
            .collect()
    }

    pub async fn dispatch(
        &self,
        action_type: ActionType,
        seed: KnownValues,
    ) -> Result<(), DispatchError> {
        self.run(action_type, seed, None).await
    }

    /// Like [`dispatch`](Self::dispatch), aborting when `token` is cancelled.
    pub async fn dispatch_with_cancel(
        &self,
        action_type: ActionType,
        seed: KnownValues,
        token: CancelToken,
    ) -> Result<(), DispatchError> {
        self.run(action_type, seed, Some(token)).await
    }

    #[instrument(skip_all, fields(action = %action_type, dispatch_id = %DispatchId::new()))]
    async fn run(
        &self,
        action_type: ActionType,
        seed: KnownValues,
        token: Option<CancelToken>,
    ) -> Result<(), DispatchError> {
        let action = self
            .actions
            .get(&action_type)
            .cloned()
            .ok_or(DispatchError::UnknownAction(action_type))?;
        let parameters = action.parameters();
        let targets: Vec<_> = parameters.values().cloned().collect();

        let mut context = ResolutionContext::new(self.registry.clone())
            .with_known(seed)
            .with_provider_timeout(self.provider_timeout);
        if let Some(token) = token {
            context = context.with_cancel_token(token);
        }
        context.resolve(&targets).await?;

        let known = context.into_known();
        let mut args = KnownValues::new();
        for parameter in parameters.values() {
            match known.raw(&parameter.name) {
                Some(value) => args.insert(parameter.name.clone(), value.clone()),
                None if parameter.required => {
                    return Err(DispatchError::MissingRequired {
                        action: action_type,
                        name: parameter.name.clone(),
                    })
                }
                None => debug!(parameter = %parameter.name, "Optional parameter omitted"),
            }
        }

        info!(args = args.len(), "Executing action");
        action
            .execute(args)
            .await
            .map_err(|source| DispatchError::Action {
                action: action_type,
                source,
            })
    }
}

/// Errors from choosing an action.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("language model error: {0}")]
    Llm(#[from] LlmError),

    #[error("no actions to choose from")]
    NoActions,
}

impl ParseFailure for RouteError {
    fn is_parse_failure(&self) -> bool {
        matches!(self, RouteError::Parse(_))
    }
}

/// Asks a language model which action fits a sim's intent.
pub struct ActionRouter {
    model: Arc<dyn LanguageModel>,
    actions: Vec<(ActionType, String)>,
    parse_retries: usize,
}

impl ActionRouter {
    pub fn new(model: Arc<dyn LanguageModel>, actions: Vec<(ActionType, String)>) -> Self {
        Self {
            model,
            actions,
            parse_retries: crate::config::DEFAULT_PARSE_RETRIES,
        }
    }

    /// Offer every action registered with `dispatcher`.
    pub fn for_dispatcher(model: Arc<dyn LanguageModel>, dispatcher: &ActionDispatcher) -> Self {
        Self::new(model, dispatcher.available())
    }

    pub fn with_parse_retries(mut self, retries: usize) -> Self {
        self.parse_retries = retries;
        self
    }

    fn prompt(&self, intent: &str) -> String {
        let actions: Vec<String> = self
            .actions
            .iter()
            .map(|(action, description)| format!("{action}: {description}"))
            .collect();
        format!(
            "You pick the action a character takes next.\n\
             \n\
             Read the character's intent and the available actions, then choose \
             the single action that best serves the intent. Answer with the action \
             name exactly as listed, as <Action>name</Action>.\n\
             \n\
             Intent:\n{intent}\n\
             \n\
             Actions:\n{}\n",
            actions.join("\n")
        )
    }

    /// Choose an action for `intent`.
    ///
    /// The reply is matched against the offered action names, tolerating
    /// small spelling differences.
    #[instrument(skip_all)]
    pub async fn route(&self, intent: &str) -> Result<ActionType, RouteError> {
        if self.actions.is_empty() {
            return Err(RouteError::NoActions);
        }
        let names: Vec<&str> = self.actions.iter().map(|(a, _)| a.as_str()).collect();
        let prompt = self.prompt(intent);
        let (names, prompt) = (&names, &prompt);

        with_parse_retries(self.parse_retries, move || async move {
            let reply = self.model.complete(prompt).await?;
            let raw_name = tags::ACTION.find(&reply)?;
            let name = closest_match(&raw_name, names, crate::extract::DEFAULT_MATCH_CUTOFF)
                .ok_or_else(|| ParseError::NoMatch {
                    value: raw_name.clone(),
                    raw: reply.clone(),
                })?;
            let action = self
                .actions
                .iter()
                .map(|(a, _)| *a)
                .find(|a| a.as_str() == *name)
                .ok_or_else(|| ParseError::NoMatch {
                    value: raw_name.clone(),
                    raw: reply.clone(),
                })?;
            if raw_name != action.as_str() {
                warn!(raw = %raw_name, chosen = %action, "Action name matched approximately");
            }
            Ok(action)
        })
        .await
    }
}
