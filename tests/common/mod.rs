//! Common Test Utilities for Integration Tests
//!
//! A recording scenario kind whose behavior is scripted per test, plus
//! helpers to build a scheduler around it.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stress_scheduler::{
    ActionBody, ActionDefinition, Globals, HistogramMetrics, MetricsSink, RequestExecutor,
    Scenario, ScenarioAction, ScenarioContext, ScenarioError, ScenarioProvider, ScenarioRegistry,
    Stage, StressPlan, StressScheduler,
};

pub const RECORDING_KIND: &str = "recording";
pub const FAILING_ACTION: &str = "fail";

// =============================================================================
// Provider
// =============================================================================

/// What the recording provider observed, shared with the test body.
#[derive(Default)]
pub struct Recorder {
    pub created: AtomicUsize,
    pub started: AtomicUsize,
    pub stopped: AtomicUsize,
    pub intervals: Mutex<Vec<String>>,
    pub distribution_ids: Mutex<Vec<Option<String>>>,
}

impl Recorder {
    pub fn intervals(&self) -> Vec<String> {
        self.intervals.lock().unwrap().clone()
    }
}

pub struct RecordingProvider {
    pub recorder: Arc<Recorder>,
    init_delay: Option<Duration>,
    create_limit: Option<usize>,
    next_id: AtomicU64,
}

impl RecordingProvider {
    pub fn new() -> Arc<Self> {
        Self::build(None, None)
    }

    /// Provider whose init takes `delay`.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Self::build(Some(delay), None)
    }

    /// Provider that fails every creation after the first `limit`.
    pub fn failing_after(limit: usize) -> Arc<Self> {
        Self::build(None, Some(limit))
    }

    fn build(init_delay: Option<Duration>, create_limit: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            recorder: Arc::new(Recorder::default()),
            init_delay,
            create_limit,
            next_id: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl ScenarioProvider for RecordingProvider {
    async fn init(&self, _ctx: &ScenarioContext) -> Result<(), ScenarioError> {
        if let Some(delay) = self.init_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    fn create(&self, ctx: &ScenarioContext) -> Result<Box<dyn Scenario>, ScenarioError> {
        let created = self.recorder.created.fetch_add(1, Ordering::SeqCst);
        if self.create_limit.is_some_and(|limit| created >= limit) {
            return Err(ScenarioError::Init {
                kind: RECORDING_KIND.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        Ok(Box::new(RecordingScenario {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            metrics: Arc::clone(&ctx.metrics),
            ctx: ctx.clone(),
            recorder: Arc::clone(&self.recorder),
            eligible: AtomicBool::new(true),
            distribution_id: None,
        }))
    }
}

// =============================================================================
// Scenario
// =============================================================================

pub struct RecordingScenario {
    id: u64,
    metrics: Arc<dyn MetricsSink>,
    ctx: ScenarioContext,
    recorder: Arc<Recorder>,
    eligible: AtomicBool,
    distribution_id: Option<String>,
}

/// Counter bumped every time scenario `id` runs an action.
pub fn runs_of(id: u64) -> String {
    format!("runs/{}", id)
}

impl Scenario for RecordingScenario {
    fn start(&self, _actions: &[ActionDefinition]) {
        self.recorder.started.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.recorder.stopped.fetch_add(1, Ordering::SeqCst);
    }

    fn with_arrival_interval(&mut self, interval_id: &str) {
        self.recorder
            .intervals
            .lock()
            .unwrap()
            .push(interval_id.to_string());
    }

    fn with_parameters(&mut self, parameters: &HashMap<String, String>) {
        if parameters.get("eligible").map(String::as_str) == Some("false") {
            self.eligible.store(false, Ordering::SeqCst);
        }
    }

    fn create_action(
        &self,
        name: &str,
        _parameters: &HashMap<String, String>,
        body: Option<&ActionBody>,
        _interval_id: &str,
    ) -> Result<Box<dyn ScenarioAction>, ScenarioError> {
        Ok(Box::new(RecordingAction {
            counter: runs_of(self.id),
            fail: name == FAILING_ACTION,
            metrics: Arc::clone(&self.metrics),
            body: body.cloned().map(|body| (body, self.ctx.clone())),
        }))
    }

    fn with_action_distribution_id(&mut self, id: &str) {
        self.recorder
            .distribution_ids
            .lock()
            .unwrap()
            .push(Some(id.to_string()));
        self.distribution_id = Some(id.to_string());
    }

    fn action_distribution_id(&self) -> Option<&str> {
        self.distribution_id.as_deref()
    }

    fn is_available_for_action_distribution(&self) -> bool {
        self.eligible.load(Ordering::SeqCst)
    }
}

struct RecordingAction {
    counter: String,
    fail: bool,
    metrics: Arc<dyn MetricsSink>,
    body: Option<(ActionBody, ScenarioContext)>,
}

#[async_trait]
impl ScenarioAction for RecordingAction {
    async fn run(&self) -> Result<(), ScenarioError> {
        self.metrics.increment_counter(&self.counter, 1);
        if let Some((body, ctx)) = &self.body {
            return body.call(ctx.clone()).await;
        }
        if self.fail {
            return Err(ScenarioError::ActionRun {
                action: FAILING_ACTION.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Scheduler Helpers
// =============================================================================

pub fn registry_with(kind: &str, provider: Arc<RecordingProvider>) -> ScenarioRegistry {
    let mut registry = ScenarioRegistry::new();
    registry.register(kind, move |_params: &HashMap<String, String>| {
        Ok(Arc::clone(&provider) as Arc<dyn ScenarioProvider>)
    });
    registry
}

pub fn context(stages: Vec<Stage>) -> (ScenarioContext, Arc<HistogramMetrics>) {
    let globals = Globals::default();
    let metrics = Arc::new(HistogramMetrics::new());
    let executor = Arc::new(RequestExecutor::new(&globals).unwrap());
    let plan = Arc::new(StressPlan { globals, stages });
    (
        ScenarioContext::new(metrics.clone(), executor, plan),
        metrics,
    )
}

/// Scheduler over `stages` with a single recording kind registered.
pub fn scheduler(
    stages: Vec<Stage>,
    provider: Arc<RecordingProvider>,
) -> (StressScheduler, Arc<HistogramMetrics>) {
    let (ctx, metrics) = context(stages);
    let registry = Arc::new(registry_with(RECORDING_KIND, provider));
    (StressScheduler::new(registry, ctx), metrics)
}
