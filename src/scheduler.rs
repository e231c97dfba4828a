//! Stress scheduler.
//!
//! Every stage of a plan becomes a stream of scenarios paced by the stage's
//! arrival process; the per-stage streams are merged into one. Each emitted
//! scenario gets its own stream of actions: actions without a distribution
//! mode are paced per scenario, shared actions come from the stage's
//! [`ActionDistributor`] for that action.
//!
//! Errors stay inside their stage: a provider that cannot be resolved or
//! initialized, or a scenario that cannot be created, ends that stage's
//! stream and is logged. Failed actions are logged and counted.

use crate::arrival::{ArrivalProcess, Tick};
use crate::config::{validate_stages, ActionDefinition, Stage};
use crate::distributor::{ActionDistributor, DistributionKey, DistributionPolicy};
use crate::error::{ConfigError, ScenarioError};
use crate::scenario::{
    MetricsSink, Scenario, ScenarioAction, ScenarioContext, ScenarioProvider, ScenarioRegistry,
};
use crate::shutdown::Shutdown;
use dashmap::DashMap;
use futures_util::future;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

/// A scenario together with the stage it was created for.
#[derive(Clone)]
pub struct ScenarioWithActions {
    pub scenario: Arc<dyn Scenario>,
    pub stage: Arc<Stage>,
}

impl ScenarioWithActions {
    pub fn actions(&self) -> &[ActionDefinition] {
        &self.stage.actions
    }
}

enum StageState {
    Pending(ArrivalProcess),
    Running {
        provider: Arc<dyn ScenarioProvider>,
        ticks: BoxStream<'static, Tick>,
    },
}

// =============================================================================
// Scheduler
// =============================================================================

pub struct StressScheduler {
    registry: Arc<ScenarioRegistry>,
    context: ScenarioContext,
    distributors: DashMap<DistributionKey, Arc<ActionDistributor>>,
    shutdown: Shutdown,
    provider_timeout: Duration,
}

impl StressScheduler {
    pub fn new(registry: Arc<ScenarioRegistry>, context: ScenarioContext) -> Self {
        Self {
            registry,
            context,
            distributors: DashMap::new(),
            shutdown: Shutdown::new(),
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
        }
    }

    /// How long a provider may take to initialize before its stage is abandoned.
    pub fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }

    pub fn context(&self) -> &ScenarioContext {
        &self.context
    }

    /// Scenarios of every stage in `stages`, interleaved as they are created.
    ///
    /// Fails before anything is scheduled when a stage's pacing is invalid.
    pub fn observe_scenarios(
        &self,
        stages: &[Stage],
    ) -> Result<BoxStream<'static, Arc<dyn Scenario>>, ConfigError> {
        Ok(self
            .observe_stages(stages)?
            .map(|created| created.scenario)
            .boxed())
    }

    /// Scenarios of the configured plan, each paired with its stage.
    pub fn observe_scenarios_with_actions(
        &self,
    ) -> Result<BoxStream<'static, ScenarioWithActions>, ConfigError> {
        let config = Arc::clone(&self.context.config);
        self.observe_stages(&config.stages)
    }

    /// Actions for one scenario, merged across its action definitions.
    pub fn observe_scenario_actions(
        &self,
        created: &ScenarioWithActions,
    ) -> BoxStream<'static, Box<dyn ScenarioAction>> {
        let streams: Vec<_> = created
            .actions()
            .iter()
            .enumerate()
            .filter_map(|(index, definition)| {
                match self.action_stream(created, index, definition) {
                    Ok(actions) => Some(actions),
                    Err(e) => {
                        error!(
                            stage = %created.stage.name,
                            action = %definition.name,
                            error = %e,
                            "Failed to schedule action"
                        );
                        None
                    }
                }
            })
            .collect();

        stream::select_all(streams)
            .take_until(self.shutdown.listener().wait())
            .boxed()
    }

    /// The distributor registered under `key`, if any scenario has used it.
    pub fn distributor(&self, key: &DistributionKey) -> Option<Arc<ActionDistributor>> {
        self.distributors.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Runs the configured plan to completion.
    ///
    /// Every scenario is started as it arrives, its actions run as independent
    /// tasks, and it is stopped once its action streams have ended.
    pub async fn run(&self) -> Result<(), ConfigError> {
        let mut scenarios = self.observe_scenarios_with_actions()?;
        let mut running = JoinSet::new();
        let mut started = 0usize;

        while let Some(created) = scenarios.next().await {
            created.scenario.start(created.actions());
            started += 1;
            self.context.metrics.increment_counter("scenarios_started", 1);
            self.context.metrics.adjust_gauge("active_scenarios", 1);

            let actions = self.observe_scenario_actions(&created);
            running.spawn(run_scenario(
                created,
                actions,
                Arc::clone(&self.context.metrics),
            ));
            while running.try_join_next().is_some() {}
        }

        info!(
            "All stages finished, waiting for {} of {} scenarios",
            running.len(),
            started
        );
        while running.join_next().await.is_some() {}
        info!("Stress run complete: {} scenarios", started);

        Ok(())
    }

    /// Cancels every arrival stream and empties every distributor pool.
    /// Actions already running are left to finish.
    pub fn stop(&self) {
        if self.shutdown.is_triggered() {
            return;
        }
        info!("Stopping stress scheduler");
        self.shutdown.trigger();
        for distributor in self.distributors.iter() {
            distributor.stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_triggered()
    }

    fn observe_stages(
        &self,
        stages: &[Stage],
    ) -> Result<BoxStream<'static, ScenarioWithActions>, ConfigError> {
        validate_stages(stages)?;
        let streams = stages
            .iter()
            .map(|stage| {
                let arrivals = ArrivalProcess::for_stage(stage)?;
                Ok(self.stage_stream(Arc::new(stage.clone()), arrivals))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(stream::select_all(streams).boxed())
    }

    fn stage_stream(
        &self,
        stage: Arc<Stage>,
        arrivals: ArrivalProcess,
    ) -> BoxStream<'static, ScenarioWithActions> {
        let registry = Arc::clone(&self.registry);
        let ctx = self.context.clone();
        let timeout = self.provider_timeout;

        stream::unfold(StageState::Pending(arrivals), move |state| {
            let registry = Arc::clone(&registry);
            let ctx = ctx.clone();
            let stage = Arc::clone(&stage);
            async move {
                let (provider, mut ticks) = match state {
                    StageState::Pending(arrivals) => {
                        match start_stage(&registry, &ctx, &stage, timeout).await {
                            Ok(provider) => (provider, arrivals.observe()),
                            Err(e) => {
                                error!(stage = %stage.name, error = %e, "Stage failed to start");
                                return None;
                            }
                        }
                    }
                    StageState::Running { provider, ticks } => (provider, ticks),
                };

                let tick = ticks.next().await?;
                match instantiate(provider.as_ref(), &ctx, &stage, &tick) {
                    Ok(scenario) => {
                        debug!(stage = %stage.name, interval = %tick.interval_id, "Scenario created");
                        let created = ScenarioWithActions { scenario, stage };
                        Some((created, StageState::Running { provider, ticks }))
                    }
                    Err(e) => {
                        error!(
                            stage = %stage.name,
                            error = %e,
                            "Scenario creation failed, stopping stage"
                        );
                        None
                    }
                }
            }
        })
        .take_until(self.shutdown.listener().wait())
        .boxed()
    }

    fn action_stream(
        &self,
        created: &ScenarioWithActions,
        index: usize,
        definition: &ActionDefinition,
    ) -> Result<BoxStream<'static, Box<dyn ScenarioAction>>, ConfigError> {
        let policy = definition.distribution_mode.policy();
        if let (Some(policy), Some(distribution_id)) =
            (policy, created.scenario.action_distribution_id())
        {
            let distributor = self.distributor_for(distribution_id, index, definition, policy)?;
            return Ok(distributor.register(Arc::clone(&created.scenario)).boxed());
        }

        let arrivals = ArrivalProcess::for_action(definition)?;
        let scenario = Arc::clone(&created.scenario);
        let stage = Arc::clone(&created.stage);
        let definition = definition.clone();

        Ok(arrivals
            .observe()
            .filter_map(move |tick| {
                let action = scenario.create_action(
                    &definition.name,
                    &definition.action_parameters,
                    definition.run.as_ref(),
                    &tick.interval_id,
                );
                future::ready(match action {
                    Ok(action) => Some(action),
                    Err(e) => {
                        error!(
                            stage = %stage.name,
                            action = %definition.name,
                            error = %e,
                            "Failed to create action"
                        );
                        None
                    }
                })
            })
            .boxed())
    }

    fn distributor_for(
        &self,
        distribution_id: &str,
        index: usize,
        definition: &ActionDefinition,
        policy: DistributionPolicy,
    ) -> Result<Arc<ActionDistributor>, ConfigError> {
        let key = DistributionKey::new(distribution_id, index, &definition.name);
        if let Some(existing) = self.distributor(&key) {
            return Ok(existing);
        }

        let entry = self
            .distributors
            .entry(key.clone())
            .or_try_insert_with(|| {
                ActionDistributor::new(
                    key,
                    policy,
                    Arc::new(definition.clone()),
                    self.shutdown.listener(),
                )
                .map(Arc::new)
            })?;
        Ok(Arc::clone(entry.value()))
    }
}

async fn start_stage(
    registry: &ScenarioRegistry,
    ctx: &ScenarioContext,
    stage: &Stage,
    timeout: Duration,
) -> Result<Arc<dyn ScenarioProvider>, ScenarioError> {
    let provider = registry.resolve(&stage.scenario_kind, &stage.provider_parameters)?;
    tokio::time::timeout(timeout, provider.init(ctx))
        .await
        .map_err(|_| ScenarioError::ProviderTimeout {
            kind: stage.scenario_kind.clone(),
            timeout,
        })??;

    info!("Stage {} started ({})", stage.name, stage.scenario_kind);
    Ok(provider)
}

fn instantiate(
    provider: &dyn ScenarioProvider,
    ctx: &ScenarioContext,
    stage: &Stage,
    tick: &Tick,
) -> Result<Arc<dyn Scenario>, ScenarioError> {
    let mut scenario = provider.create(ctx)?;
    scenario.with_parameters(&stage.scenario_parameters);
    if stage.has_distributed_actions() {
        scenario.with_action_distribution_id(&stage.name);
    }
    scenario.with_arrival_interval(&tick.interval_id);
    Ok(Arc::from(scenario))
}

async fn run_scenario(
    created: ScenarioWithActions,
    mut actions: BoxStream<'static, Box<dyn ScenarioAction>>,
    metrics: Arc<dyn MetricsSink>,
) {
    let mut in_flight = JoinSet::new();

    while let Some(action) = actions.next().await {
        let metrics = Arc::clone(&metrics);
        let stage = Arc::clone(&created.stage);
        in_flight.spawn(async move {
            match action.run().await {
                Ok(()) => metrics.increment_counter("actions_completed", 1),
                Err(e) => {
                    error!(stage = %stage.name, error = %e, "Action failed");
                    metrics.increment_counter("actions_failed", 1);
                }
            }
        });
        while in_flight.try_join_next().is_some() {}
    }

    while in_flight.join_next().await.is_some() {}
    created.scenario.stop();
    metrics.adjust_gauge("active_scenarios", -1);
}
