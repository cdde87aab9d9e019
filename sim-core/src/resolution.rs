//! Parameter resolution.
//!
//! Given target parameters, find the providers needed to produce the ones
//! that are not yet known, order them so that every provider runs after its
//! inputs are available, and execute them.
//!
//! Resolution happens in two phases:
//!
//! 1. [`ResolutionContext::plan`] walks the dependency graph from the targets.
//!    It fails on missing providers and cycles before anything runs, so a
//!    failed plan leaves the known values untouched.
//! 2. [`ResolutionContext::resolve`] executes the plan's layers deepest first,
//!    merging every produced value into the known set.
//!
//! Layer 0 holds the providers of the targets themselves; layer `n + 1` holds
//! the providers of layer `n`'s missing inputs. Each provider appears once, at
//! the deepest layer any of its requested outputs needs.
//!
//! A step is essential when one of its outputs is reachable from a required
//! target through required inputs only. A non-essential step that fails or
//! times out leaves its outputs unknown and resolution carries on; anything
//! that consumes those outputs sees them as absent.

use crate::config::DEFAULT_PROVIDER_TIMEOUT;
use crate::parameter::{KnownValues, Parameter};
use crate::provider::{Provider, ProviderError, ProviderRegistry};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

/// Errors from planning or executing a resolution.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no provider produces '{name}'{}", needed_by_suffix(.needed_by))]
    MissingProvider {
        name: String,
        needed_by: Option<String>,
    },

    #[error("circular dependency: {}", .cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    #[error("provider '{provider}' failed: {source}")]
    ProviderExecution {
        provider: String,
        #[source]
        source: ProviderError,
    },

    #[error("provider '{provider}' timed out after {after:?}")]
    Timeout { provider: String, after: Duration },

    #[error("resolution cancelled")]
    Cancelled,
}

fn needed_by_suffix(needed_by: &Option<String>) -> String {
    needed_by
        .as_ref()
        .map(|name| format!(" (needed by '{name}')"))
        .unwrap_or_default()
}

/// Cooperative cancellation for in-flight resolutions.
///
/// Clones share the same flag.
#[derive(Debug, Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Completes once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            // The sender lives as long as any clone, so this never wakes.
            std::future::pending::<()>().await;
        }
    }
}

/// One provider invocation in a plan.
#[derive(Debug, Clone)]
pub struct PlannedStep {
    /// Registration index of the provider.
    pub provider_index: usize,
    pub provider: String,
    /// The outputs this resolution needs from the provider, in name order,
    /// as described by whoever requested them.
    pub outputs: Vec<Parameter>,
    /// Whether a failure of this step fails the resolution.
    pub essential: bool,
}

/// Providers to run, grouped by depth. `layers[0]` is the outermost layer.
#[derive(Debug, Clone, Default)]
pub struct ResolutionPlan {
    pub layers: Vec<Vec<PlannedStep>>,
}

impl ResolutionPlan {
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn step_count(&self) -> usize {
        self.layers.iter().map(Vec::len).sum()
    }

    /// Steps in execution order, deepest layer first.
    pub fn execution_order(&self) -> impl Iterator<Item = &PlannedStep> {
        self.layers.iter().rev().flatten()
    }
}

/// Known values for one dispatch plus the providers that can extend them.
///
/// The known set only grows: resolution never overwrites or removes a value.
#[derive(Debug, Clone)]
pub struct ResolutionContext {
    known: KnownValues,
    registry: Arc<ProviderRegistry>,
    provider_timeout: Duration,
    cancel: Option<CancelToken>,
}

impl ResolutionContext {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            known: KnownValues::new(),
            registry,
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
            cancel: None,
        }
    }

    pub fn with_known(mut self, known: KnownValues) -> Self {
        self.known = known;
        self
    }

    pub fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Seed a value before resolution. An existing value is kept.
    pub fn seed(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if !self.known.contains(&name) {
            self.known.insert(name, value);
        }
    }

    pub fn known(&self) -> &KnownValues {
        &self.known
    }

    pub fn into_known(self) -> KnownValues {
        self.known
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Work out which providers must run, and in which layers, to produce
    /// every unknown target. Nothing is executed.
    pub fn plan(&self, targets: &[Parameter]) -> Result<ResolutionPlan, ResolveError> {
        let mut planner = Planner::new(&self.registry, &self.known);
        for target in targets {
            planner.visit(target, None)?;
        }
        let roots = targets
            .iter()
            .filter(|target| target.required)
            .map(|target| target.name.as_str());
        Ok(planner.into_plan(roots))
    }

    /// Produce every resolvable target, running providers deepest first.
    ///
    /// Optional targets without a producer, or whose producer fails, are left
    /// unresolved. On error the values produced by providers that already ran
    /// are kept.
    #[instrument(skip(self, targets), fields(targets = targets.len()))]
    pub async fn resolve(&mut self, targets: &[Parameter]) -> Result<(), ResolveError> {
        let plan = self.plan(targets)?;
        if plan.is_empty() {
            debug!("All targets already known");
            return Ok(());
        }
        debug!(
            layers = plan.layers.len(),
            steps = plan.step_count(),
            "Resolution planned"
        );

        for step in plan.execution_order() {
            match self.run_step(step).await {
                Ok(()) => {}
                Err(err @ (ResolveError::ProviderExecution { .. } | ResolveError::Timeout { .. }))
                    if !step.essential =>
                {
                    warn!(provider = %step.provider, error = %err, "Optional outputs left unresolved");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn run_step(&mut self, step: &PlannedStep) -> Result<(), ResolveError> {
        let Some(target) = step
            .outputs
            .iter()
            .find(|output| !self.known.contains(&output.name))
        else {
            debug!(provider = %step.provider, "Outputs already known, skipping");
            return Ok(());
        };

        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(ResolveError::Cancelled);
        }

        let provider = self.registry.get(step.provider_index).cloned().ok_or_else(|| {
            ResolveError::MissingProvider {
                name: target.name.clone(),
                needed_by: None,
            }
        })?;

        debug!(provider = %step.provider, target = %target.name, "Running provider");
        let produced = {
            let call = tokio::time::timeout(
                self.provider_timeout,
                provider.execute(target, &self.known),
            );
            let outcome = match &self.cancel {
                Some(token) => tokio::select! {
                    _ = token.cancelled() => return Err(ResolveError::Cancelled),
                    outcome = call => outcome,
                },
                None => call.await,
            };
            outcome
                .map_err(|_| ResolveError::Timeout {
                    provider: step.provider.clone(),
                    after: self.provider_timeout,
                })?
                .map_err(|source| ResolveError::ProviderExecution {
                    provider: step.provider.clone(),
                    source,
                })?
        };

        for (name, filled) in produced {
            if self.known.contains(&name) {
                debug!(provider = %step.provider, name = %name, "Keeping existing value");
                continue;
            }
            self.known.insert(name, filled.value);
        }

        if let Some(missing) = step
            .outputs
            .iter()
            .find(|output| !self.known.contains(&output.name))
        {
            warn!(provider = %step.provider, name = %missing.name, "Provider left output unset");
            return Err(ResolveError::ProviderExecution {
                provider: step.provider.clone(),
                source: ProviderError::MissingOutput {
                    name: missing.name.clone(),
                },
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    InProgress,
    Done,
    /// Optional and without a producer.
    Skipped,
}

struct Planner<'a> {
    registry: &'a ProviderRegistry,
    known: &'a KnownValues,
    state: HashMap<String, Visit>,
    /// Names on the current dependency chain, outermost first.
    path: Vec<String>,
    /// Produced names in DFS post-order: inputs before their consumers.
    order: Vec<String>,
    /// Name -> unknown inputs of its producer.
    edges: HashMap<String, Vec<String>>,
    /// Name -> unknown inputs its producer requires.
    required_edges: HashMap<String, Vec<String>>,
    /// The parameter as first requested, description included.
    requested: HashMap<String, Parameter>,
}

impl<'a> Planner<'a> {
    fn new(registry: &'a ProviderRegistry, known: &'a KnownValues) -> Self {
        Self {
            registry,
            known,
            state: HashMap::new(),
            path: Vec::new(),
            order: Vec::new(),
            edges: HashMap::new(),
            required_edges: HashMap::new(),
            requested: HashMap::new(),
        }
    }

    fn visit(&mut self, parameter: &Parameter, needed_by: Option<&str>) -> Result<(), ResolveError> {
        let name = parameter.name.as_str();
        let required = parameter.required;
        if self.known.contains(name) {
            return Ok(());
        }
        match self.state.get(name) {
            Some(Visit::Done) => return Ok(()),
            Some(Visit::InProgress) => {
                let start = self.path.iter().position(|n| n == name).unwrap_or(0);
                let mut cycle = self.path[start..].to_vec();
                cycle.push(name.to_string());
                return Err(ResolveError::CircularDependency { cycle });
            }
            Some(Visit::Skipped) if !required => return Ok(()),
            Some(Visit::Skipped) | None => {}
        }

        let registry = self.registry;
        let Some((_, provider)) = registry.producer(name) else {
            if required {
                return Err(ResolveError::MissingProvider {
                    name: name.to_string(),
                    needed_by: needed_by.map(str::to_string),
                });
            }
            debug!(name, "No provider for optional parameter, skipping");
            self.state.insert(name.to_string(), Visit::Skipped);
            return Ok(());
        };

        self.state.insert(name.to_string(), Visit::InProgress);
        self.path.push(name.to_string());
        self.requested
            .entry(name.to_string())
            .or_insert_with(|| parameter.clone());

        for input in provider.inputs().into_values() {
            if self.known.contains(&input.name) {
                continue;
            }
            self.visit(&input, Some(name))?;
            if self.state.get(&input.name) == Some(&Visit::Done) {
                if input.required {
                    self.required_edges
                        .entry(name.to_string())
                        .or_default()
                        .push(input.name.clone());
                }
                self.edges
                    .entry(name.to_string())
                    .or_default()
                    .push(input.name);
            }
        }

        self.path.pop();
        self.state.insert(name.to_string(), Visit::Done);
        self.order.push(name.to_string());
        Ok(())
    }

    fn into_plan<'r>(self, roots: impl IntoIterator<Item = &'r str>) -> ResolutionPlan {
        let mut essential: HashSet<&str> = HashSet::new();
        let mut pending: Vec<&str> = roots
            .into_iter()
            .filter(|name| self.state.get(*name) == Some(&Visit::Done))
            .collect();
        while let Some(name) = pending.pop() {
            if !essential.insert(name) {
                continue;
            }
            for input in self.required_edges.get(name).into_iter().flatten() {
                pending.push(input.as_str());
            }
        }

        // Longest distance from a target, relaxed in topological order.
        let mut depth: HashMap<&str, usize> =
            self.order.iter().map(|name| (name.as_str(), 0)).collect();
        for name in self.order.iter().rev() {
            let parent = depth.get(name.as_str()).copied().unwrap_or(0);
            for input in self.edges.get(name).into_iter().flatten() {
                let entry = depth.entry(input.as_str()).or_insert(0);
                *entry = (*entry).max(parent + 1);
            }
        }

        // provider index -> (depth, essential, requested outputs)
        let mut steps: BTreeMap<usize, (usize, bool, Vec<Parameter>)> = BTreeMap::new();
        for name in &self.order {
            let Some((index, provider)) = self.registry.producer(name) else {
                continue;
            };
            let name_depth = depth.get(name.as_str()).copied().unwrap_or(0);
            let output = match self.requested.get(name) {
                Some(parameter) => parameter.clone(),
                None => provider
                    .outputs()
                    .remove(name)
                    .unwrap_or_else(|| Parameter::required(name.clone(), "")),
            };
            let step = steps.entry(index).or_insert((name_depth, false, Vec::new()));
            step.0 = step.0.max(name_depth);
            step.1 |= essential.contains(name.as_str());
            step.2.push(output);
        }

        let layer_count = steps.values().map(|(d, _, _)| d + 1).max().unwrap_or(0);
        let mut layers: Vec<Vec<PlannedStep>> = vec![Vec::new(); layer_count];
        for (index, (step_depth, essential, mut outputs)) in steps {
            outputs.sort_by(|a, b| a.name.cmp(&b.name));
            let provider = self
                .registry
                .get(index)
                .map(|p| p.name().to_string())
                .unwrap_or_default();
            layers[step_depth].push(PlannedStep {
                provider_index: index,
                provider,
                outputs,
                essential,
            });
        }
        layers.retain(|layer| !layer.is_empty());

        ResolutionPlan { layers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FnProvider;
    use serde_json::json;

    fn registry(providers: Vec<FnProvider>) -> Arc<ProviderRegistry> {
        let mut registry = ProviderRegistry::new();
        for provider in providers {
            registry.register(Arc::new(provider)).unwrap();
        }
        Arc::new(registry)
    }

    fn required(name: &str) -> Parameter {
        Parameter::required(name, "")
    }

    #[test]
    fn test_plan_layers_chain() {
        // c <- b <- a
        let registry = registry(vec![
            FnProvider::constant("make_c", "c", json!(1)),
            FnProvider::constant("make_b", "b", json!(2)).with_inputs(&["c"]),
            FnProvider::constant("make_a", "a", json!(3)).with_inputs(&["b"]),
        ]);
        let ctx = ResolutionContext::new(registry);
        let plan = ctx.plan(&[required("a")]).unwrap();

        let names: Vec<Vec<&str>> = plan
            .layers
            .iter()
            .map(|layer| layer.iter().map(|s| s.provider.as_str()).collect())
            .collect();
        assert_eq!(names, vec![vec!["make_a"], vec!["make_b"], vec!["make_c"]]);
    }

    #[test]
    fn test_shared_dependency_runs_at_deepest_layer() {
        // a needs b and c, b needs c: c must sit below b.
        let registry = registry(vec![
            FnProvider::constant("make_a", "a", json!(1)).with_inputs(&["b", "c"]),
            FnProvider::constant("make_b", "b", json!(2)).with_inputs(&["c"]),
            FnProvider::constant("make_c", "c", json!(3)),
        ]);
        let ctx = ResolutionContext::new(registry);
        let plan = ctx.plan(&[required("a")]).unwrap();

        assert_eq!(plan.layers.len(), 3);
        assert_eq!(plan.layers[2][0].provider, "make_c");
        assert_eq!(plan.step_count(), 3);
    }

    #[test]
    fn test_known_targets_need_no_plan() {
        let registry = registry(vec![FnProvider::constant("make_a", "a", json!(1))]);
        let mut ctx = ResolutionContext::new(registry);
        ctx.seed("a", json!(0));
        assert!(ctx.plan(&[required("a")]).unwrap().is_empty());
    }

    #[test]
    fn test_cycle_is_named() {
        let registry = registry(vec![
            FnProvider::constant("make_a", "a", json!(1)).with_inputs(&["b"]),
            FnProvider::constant("make_b", "b", json!(2)).with_inputs(&["a"]),
        ]);
        let ctx = ResolutionContext::new(registry);
        let err = ctx.plan(&[required("a")]).unwrap_err();
        match &err {
            ResolveError::CircularDependency { cycle } => {
                assert_eq!(cycle, &vec!["a".to_string(), "b".into(), "a".into()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.to_string(), "circular dependency: a -> b -> a");
    }

    #[test]
    fn test_missing_provider_names_consumer() {
        let registry = registry(vec![
            FnProvider::constant("make_a", "a", json!(1)).with_inputs(&["b"]),
        ]);
        let ctx = ResolutionContext::new(registry);
        let err = ctx.plan(&[required("a")]).unwrap_err();
        assert!(matches!(
            err,
            ResolveError::MissingProvider { ref name, ref needed_by }
                if name == "b" && needed_by.as_deref() == Some("a")
        ));
    }

    #[test]
    fn test_optional_without_provider_is_skipped() {
        let registry = registry(vec![FnProvider::constant("make_a", "a", json!(1))
            .with_optional_inputs(&["hint"])]);
        let ctx = ResolutionContext::new(registry);

        let plan = ctx
            .plan(&[required("a"), Parameter::optional("tone", "")])
            .unwrap();
        assert_eq!(plan.step_count(), 1);
    }

    #[test]
    fn test_skipped_optional_later_required_fails() {
        let registry = registry(vec![
            FnProvider::constant("make_a", "a", json!(1)).with_inputs(&["x"]),
        ]);
        let ctx = ResolutionContext::new(registry);
        let err = ctx
            .plan(&[Parameter::optional("x", ""), required("a")])
            .unwrap_err();
        assert!(matches!(err, ResolveError::MissingProvider { ref name, .. } if name == "x"));
    }

    #[tokio::test]
    async fn test_resolve_runs_inputs_first() {
        let registry = registry(vec![
            FnProvider::new("double", &["b"], |_, known| {
                let c: i64 = known.require("c")?;
                Ok([("b".to_string(), json!(c * 2))].into_iter().collect())
            })
            .with_inputs(&["c"]),
            FnProvider::constant("make_c", "c", json!(21)),
        ]);
        let mut ctx = ResolutionContext::new(registry);
        ctx.resolve(&[required("b")]).await.unwrap();
        assert_eq!(ctx.known().get::<i64>("b").unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_side_outputs_skip_later_provider() {
        // make_a also yields b as a side output; make_a runs one layer below
        // make_b, so make_b finds b already known and is skipped.
        let make_a = FnProvider::new("make_a", &["a"], |_, _| {
            Ok([("a".to_string(), json!(1)), ("b".to_string(), json!(2))]
                .into_iter()
                .collect())
        });
        let make_b = FnProvider::constant("make_b", "b", json!(99));
        let make_c = FnProvider::constant("make_c", "c", json!(3)).with_inputs(&["a"]);
        let make_b_calls = make_b.calls();
        let make_a_calls = make_a.calls();

        let registry = registry(vec![make_a, make_b, make_c]);
        let mut ctx = ResolutionContext::new(registry);
        ctx.resolve(&[required("b"), required("c")]).await.unwrap();

        assert_eq!(make_a_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(make_b_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(ctx.known().get::<i64>("b").unwrap(), Some(2));
        assert_eq!(ctx.known().get::<i64>("c").unwrap(), Some(3));
    }

    fn failing(name: &str, output: &str) -> FnProvider {
        FnProvider::new(name, &[output], |_, _| {
            Err(ProviderError::Failed("nothing to offer".into()))
        })
    }

    #[tokio::test]
    async fn test_failed_optional_target_is_left_out() {
        let registry = registry(vec![
            FnProvider::constant("make_a", "a", json!(1)),
            failing("make_hint", "hint"),
        ]);
        let mut ctx = ResolutionContext::new(registry);
        ctx.resolve(&[required("a"), Parameter::optional("hint", "")])
            .await
            .unwrap();
        assert!(ctx.known().contains("a"));
        assert!(!ctx.known().contains("hint"));
    }

    #[tokio::test]
    async fn test_failed_optional_input_reaches_consumer_as_absent() {
        let seen = Arc::new(std::sync::Mutex::new(None));
        let consumer = {
            let seen = seen.clone();
            FnProvider::new("make_a", &["a"], move |_, known| {
                *seen.lock().unwrap() = Some(known.contains("hint"));
                Ok([("a".to_string(), json!(1))].into_iter().collect())
            })
            .with_optional_inputs(&["hint"])
        };
        let registry = registry(vec![consumer, failing("make_hint", "hint")]);
        let plan = ResolutionContext::new(registry.clone())
            .plan(&[required("a")])
            .unwrap();
        assert_eq!(plan.layers.len(), 2);
        assert!(plan.layers[0][0].essential);
        assert!(!plan.layers[1][0].essential);

        let mut ctx = ResolutionContext::new(registry);
        ctx.resolve(&[required("a")]).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(false));
    }

    #[tokio::test]
    async fn test_failure_needed_by_required_target_is_fatal() {
        // "hint" is optional for make_a but required by make_b.
        let registry = registry(vec![
            FnProvider::constant("make_a", "a", json!(1)).with_optional_inputs(&["hint"]),
            FnProvider::constant("make_b", "b", json!(2)).with_inputs(&["hint"]),
            failing("make_hint", "hint"),
        ]);
        let mut ctx = ResolutionContext::new(registry);
        let err = ctx
            .resolve(&[required("a"), required("b")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ResolveError::ProviderExecution { ref provider, .. } if provider == "make_hint"
        ));
    }

    #[tokio::test]
    async fn test_missing_output_fails() {
        let registry = registry(vec![FnProvider::new("lazy", &["a"], |_, _| {
            Ok(BTreeMap::new())
        })]);
        let mut ctx = ResolutionContext::new(registry);
        let err = ctx.resolve(&[required("a")]).await.unwrap_err();
        assert!(matches!(
            err,
            ResolveError::ProviderExecution {
                source: ProviderError::MissingOutput { .. },
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_timeout() {
        let registry = registry(vec![FnProvider::constant("slow", "a", json!(1))
            .with_delay(Duration::from_secs(120))]);
        let mut ctx =
            ResolutionContext::new(registry).with_provider_timeout(Duration::from_secs(5));
        let err = ctx.resolve(&[required("a")]).await.unwrap_err();
        assert!(matches!(err, ResolveError::Timeout { ref provider, .. } if provider == "slow"));
        assert!(!ctx.known().contains("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_in_flight_provider() {
        let registry = registry(vec![FnProvider::constant("slow", "a", json!(1))
            .with_delay(Duration::from_secs(30))]);
        let token = CancelToken::new();
        let mut ctx = ResolutionContext::new(registry).with_cancel_token(token.clone());

        let canceller = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        };
        let wanted = [required("a")];
        let (result, ()) = tokio::join!(ctx.resolve(&wanted), canceller);
        assert!(matches!(result, Err(ResolveError::Cancelled)));
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let registry = registry(vec![FnProvider::constant("make_a", "a", json!(1))]);
        let token = CancelToken::new();
        token.cancel();
        let mut ctx = ResolutionContext::new(registry).with_cancel_token(token);
        assert!(matches!(
            ctx.resolve(&[required("a")]).await,
            Err(ResolveError::Cancelled)
        ));
    }
}
