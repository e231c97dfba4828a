//! Scenario contracts.
//!
//! A scenario is one simulated session against the system under test. The
//! scheduler creates scenarios through a [`ScenarioProvider`] resolved from the
//! [`ScenarioRegistry`], tags them, and asks them for [`ScenarioAction`]s to
//! run. Scenario kinds implement these traits; the scheduler never looks inside.

use crate::config::{ActionDefinition, StressPlan};
use crate::error::ScenarioError;
use crate::executor::RequestExecutor;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Collaborators
// =============================================================================

/// Where scenarios report what they did.
pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, name: &str, by: u64);

    fn record_latency(&self, name: &str, latency: Duration);

    fn adjust_gauge(&self, name: &str, delta: i64);
}

/// Shared collaborators injected into every provider and scenario.
#[derive(Clone)]
pub struct ScenarioContext {
    pub metrics: Arc<dyn MetricsSink>,
    pub executor: Arc<RequestExecutor>,
    pub config: Arc<StressPlan>,
}

impl ScenarioContext {
    pub fn new(
        metrics: Arc<dyn MetricsSink>,
        executor: Arc<RequestExecutor>,
        config: Arc<StressPlan>,
    ) -> Self {
        Self {
            metrics,
            executor,
            config,
        }
    }
}

impl fmt::Debug for ScenarioContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScenarioContext")
            .field("executor", &self.executor)
            .field("stages", &self.config.stages.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Inline Action Bodies
// =============================================================================

type BoxedBodyFn =
    dyn Fn(ScenarioContext) -> BoxFuture<'static, Result<(), ScenarioError>> + Send + Sync;

/// An action defined inline as an async closure instead of by name.
#[derive(Clone)]
pub struct ActionBody(Arc<BoxedBodyFn>);

impl ActionBody {
    pub fn new<F, Fut>(body: F) -> Self
    where
        F: Fn(ScenarioContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ScenarioError>> + Send + 'static,
    {
        Self(Arc::new(move |ctx| Box::pin(body(ctx))))
    }

    pub async fn call(&self, ctx: ScenarioContext) -> Result<(), ScenarioError> {
        (self.0)(ctx).await
    }
}

impl fmt::Debug for ActionBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ActionBody(..)")
    }
}

impl PartialEq for ActionBody {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

// =============================================================================
// Scenario Traits
// =============================================================================

/// A unit of work produced by a scenario.
#[async_trait]
pub trait ScenarioAction: Send + Sync {
    async fn run(&self) -> Result<(), ScenarioError>;
}

/// One live simulated session.
///
/// The `with_*` setters are called by the scheduler before the scenario is
/// handed out; afterwards it is shared and only `&self` methods are used.
pub trait Scenario: Send + Sync {
    /// Called once before any action runs.
    fn start(&self, actions: &[ActionDefinition]);

    /// Called once after every action stream of the scenario has ended.
    fn stop(&self);

    fn with_arrival_interval(&mut self, interval_id: &str);

    fn with_parameters(&mut self, parameters: &HashMap<String, String>);

    fn create_action(
        &self,
        name: &str,
        parameters: &HashMap<String, String>,
        body: Option<&ActionBody>,
        interval_id: &str,
    ) -> Result<Box<dyn ScenarioAction>, ScenarioError>;

    fn with_action_distribution_id(&mut self, id: &str);

    fn action_distribution_id(&self) -> Option<&str>;

    /// Whether a distributor may currently hand this scenario a shared action.
    fn is_available_for_action_distribution(&self) -> bool;
}

/// Creates scenarios of one kind.
#[async_trait]
pub trait ScenarioProvider: Send + Sync {
    /// Brings up whatever the kind needs before its first scenario.
    /// Called once per stage, bounded by the scheduler's provider timeout.
    async fn init(&self, _ctx: &ScenarioContext) -> Result<(), ScenarioError> {
        Ok(())
    }

    fn create(&self, ctx: &ScenarioContext) -> Result<Box<dyn Scenario>, ScenarioError>;
}

// =============================================================================
// Registry
// =============================================================================

/// Builds a provider from a stage's provider parameters.
pub type ProviderFactory = Arc<
    dyn Fn(&HashMap<String, String>) -> Result<Arc<dyn ScenarioProvider>, ScenarioError>
        + Send
        + Sync,
>;

/// Scenario kinds known to this process, populated at startup.
#[derive(Default, Clone)]
pub struct ScenarioRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl ScenarioRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&HashMap<String, String>) -> Result<Arc<dyn ScenarioProvider>, ScenarioError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
        self
    }

    pub fn resolve(
        &self,
        kind: &str,
        parameters: &HashMap<String, String>,
    ) -> Result<Arc<dyn ScenarioProvider>, ScenarioError> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| ScenarioError::ProviderNotFound(kind.to_string()))?;
        factory(parameters)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl fmt::Debug for ScenarioRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.kinds()).finish()
    }
}
