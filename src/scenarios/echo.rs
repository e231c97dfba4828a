//! `echo-websocket`: one WebSocket connection per scenario against an echo
//! endpoint. The `send` action writes a text frame; every echoed frame closes
//! the oldest outstanding send and records its round trip.

use crate::config::ActionDefinition;
use crate::error::ScenarioError;
use crate::scenario::{ActionBody, Scenario, ScenarioAction, ScenarioContext, ScenarioProvider};
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error};

pub const ECHO_KIND: &str = "echo-websocket";
pub const SEND_ACTION: &str = "send";

const DEFAULT_PATH: &str = "/";
const DEFAULT_MESSAGE: &str = "hello!";

static NEXT_SCENARIO_ID: AtomicU64 = AtomicU64::new(0);

// =============================================================================
// Provider
// =============================================================================

#[derive(Debug, Clone)]
pub struct EchoProvider {
    path: String,
}

impl EchoProvider {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// Reads `path` from the stage's provider parameters.
    pub fn from_parameters(params: &HashMap<String, String>) -> Self {
        Self::new(params.get("path").map(String::as_str).unwrap_or(DEFAULT_PATH))
    }
}

impl ScenarioProvider for EchoProvider {
    fn create(&self, ctx: &ScenarioContext) -> Result<Box<dyn Scenario>, ScenarioError> {
        Ok(Box::new(EchoScenario::new(ctx.clone(), self.path.clone())))
    }
}

// =============================================================================
// Scenario
// =============================================================================

struct Connection {
    id: u64,
    connected: AtomicBool,
    outbox: mpsc::UnboundedSender<String>,
    stop: Shutdown,
}

pub struct EchoScenario {
    ctx: ScenarioContext,
    path: String,
    interval_id: String,
    parameters: HashMap<String, String>,
    distribution_id: Option<String>,
    connection: Arc<Connection>,
    outgoing: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl EchoScenario {
    pub fn new(ctx: ScenarioContext, path: String) -> Self {
        let (outbox, outgoing) = mpsc::unbounded_channel();
        Self {
            ctx,
            path,
            interval_id: String::new(),
            parameters: HashMap::new(),
            distribution_id: None,
            connection: Arc::new(Connection {
                id: NEXT_SCENARIO_ID.fetch_add(1, Ordering::Relaxed),
                connected: AtomicBool::new(false),
                outbox,
                stop: Shutdown::new(),
            }),
            outgoing: Mutex::new(Some(outgoing)),
        }
    }

    pub fn id(&self) -> u64 {
        self.connection.id
    }

    pub fn is_connected(&self) -> bool {
        self.connection.connected.load(Ordering::Acquire)
    }

    pub fn interval_id(&self) -> &str {
        &self.interval_id
    }

    fn message_for(&self, params: &HashMap<String, String>) -> String {
        params
            .get("message")
            .or_else(|| self.parameters.get("message"))
            .cloned()
            .unwrap_or_else(|| DEFAULT_MESSAGE.to_string())
    }
}

impl Scenario for EchoScenario {
    fn start(&self, actions: &[ActionDefinition]) {
        let outgoing = self
            .outgoing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(outgoing) = outgoing else {
            return;
        };

        debug!(
            "Scenario {} starting with {} actions (interval {})",
            self.connection.id,
            actions.len(),
            self.interval_id
        );
        tokio::spawn(run_connection(
            Arc::clone(&self.connection),
            self.ctx.clone(),
            self.path.clone(),
            outgoing,
        ));
    }

    fn stop(&self) {
        self.connection.stop.trigger();
    }

    fn with_arrival_interval(&mut self, interval_id: &str) {
        self.interval_id = interval_id.to_string();
    }

    fn with_parameters(&mut self, parameters: &HashMap<String, String>) {
        self.parameters.extend(parameters.clone());
    }

    fn create_action(
        &self,
        name: &str,
        parameters: &HashMap<String, String>,
        body: Option<&ActionBody>,
        _interval_id: &str,
    ) -> Result<Box<dyn ScenarioAction>, ScenarioError> {
        if let Some(body) = body {
            return Ok(Box::new(InlineAction {
                body: body.clone(),
                ctx: self.ctx.clone(),
            }));
        }

        match name {
            SEND_ACTION => Ok(Box::new(SendAction {
                connection: Arc::clone(&self.connection),
                message: self.message_for(parameters),
            })),
            other => Err(ScenarioError::ActionCreation {
                action: other.to_string(),
                reason: format!("{} only supports '{}'", ECHO_KIND, SEND_ACTION),
            }),
        }
    }

    fn with_action_distribution_id(&mut self, id: &str) {
        self.distribution_id = Some(id.to_string());
    }

    fn action_distribution_id(&self) -> Option<&str> {
        self.distribution_id.as_deref()
    }

    fn is_available_for_action_distribution(&self) -> bool {
        self.is_connected()
    }
}

// =============================================================================
// WebSocket Client
// =============================================================================

async fn run_connection(
    connection: Arc<Connection>,
    ctx: ScenarioContext,
    path: String,
    mut outgoing: mpsc::UnboundedReceiver<String>,
) {
    let id = connection.id;
    let metrics = &ctx.metrics;

    let (ws_stream, connect_latency) = match ctx.executor.websocket(&path).await {
        Ok(result) => result,
        Err(e) => {
            error!("Scenario {} failed to connect: {}", id, e);
            metrics.increment_counter("connection_errors", 1);
            return;
        }
    };

    metrics.record_latency("connect_latency", connect_latency);
    metrics.adjust_gauge("active_connections", 1);
    connection.connected.store(true, Ordering::Release);
    debug!("Scenario {} connected", id);

    let (mut write, mut read) = ws_stream.split();
    let mut in_flight: VecDeque<Instant> = VecDeque::new();

    let stop = connection.stop.listener().wait();
    tokio::pin!(stop);

    loop {
        tokio::select! {
            _ = &mut stop => {
                debug!("Scenario {} received stop signal", id);
                write.send(Message::Close(None)).await.ok();
                break;
            }

            Some(text) = outgoing.recv() => {
                in_flight.push_back(Instant::now());
                if let Err(e) = write.send(Message::Text(text)).await {
                    error!("Scenario {} failed to send: {}", id, e);
                    metrics.increment_counter("connection_errors", 1);
                    break;
                }
                metrics.increment_counter("messages_sent", 1);
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(_))) | Some(Ok(Message::Binary(_))) => {
                        metrics.increment_counter("messages_received", 1);
                        if let Some(sent) = in_flight.pop_front() {
                            metrics.record_latency("echo_latency", sent.elapsed());
                        }
                    }

                    Some(Ok(Message::Close(_))) => {
                        debug!("Scenario {} received close frame", id);
                        break;
                    }

                    Some(Err(e)) => {
                        error!("Scenario {} WebSocket error: {}", id, e);
                        metrics.increment_counter("connection_errors", 1);
                        break;
                    }

                    None => {
                        debug!("Scenario {} stream ended", id);
                        break;
                    }

                    _ => {}
                }
            }
        }
    }

    connection.connected.store(false, Ordering::Release);
    metrics.adjust_gauge("active_connections", -1);
    debug!("Scenario {} disconnected", id);
}

// =============================================================================
// Actions
// =============================================================================

struct SendAction {
    connection: Arc<Connection>,
    message: String,
}

#[async_trait]
impl ScenarioAction for SendAction {
    async fn run(&self) -> Result<(), ScenarioError> {
        let failed = |reason: &str| ScenarioError::ActionRun {
            action: SEND_ACTION.to_string(),
            reason: format!("scenario {}: {}", self.connection.id, reason),
        };

        if !self.connection.connected.load(Ordering::Acquire) {
            return Err(failed("not connected"));
        }
        self.connection
            .outbox
            .send(self.message.clone())
            .map_err(|_| failed("connection closed"))
    }
}

struct InlineAction {
    body: ActionBody,
    ctx: ScenarioContext,
}

#[async_trait]
impl ScenarioAction for InlineAction {
    async fn run(&self) -> Result<(), ScenarioError> {
        self.body.call(self.ctx.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Globals, StressPlan};
    use crate::executor::RequestExecutor;
    use crate::metrics::HistogramMetrics;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn context(globals: Globals) -> (ScenarioContext, Arc<HistogramMetrics>) {
        let metrics = Arc::new(HistogramMetrics::new());
        let executor = Arc::new(RequestExecutor::new(&globals).unwrap());
        let plan = Arc::new(StressPlan {
            globals,
            stages: Vec::new(),
        });
        (ScenarioContext::new(metrics.clone(), executor, plan), metrics)
    }

    async fn echo_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
                        return;
                    };
                    while let Some(Ok(msg)) = ws.next().await {
                        if msg.is_text() && ws.send(msg).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        port
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn unknown_actions_are_rejected() {
        let (ctx, _) = context(Globals::default());
        let scenario = EchoScenario::new(ctx, "/".to_string());

        let err = scenario
            .create_action("subscribe", &HashMap::new(), None, "ConstantArrivalRate")
            .err()
            .unwrap();
        assert!(matches!(err, ScenarioError::ActionCreation { action, .. } if action == "subscribe"));
    }

    #[test]
    fn message_comes_from_action_then_scenario_parameters() {
        let (ctx, _) = context(Globals::default());
        let mut scenario = EchoScenario::new(ctx, "/".to_string());
        assert_eq!(scenario.message_for(&HashMap::new()), "hello!");

        scenario.with_parameters(&HashMap::from([("message".to_string(), "stage".to_string())]));
        assert_eq!(scenario.message_for(&HashMap::new()), "stage");

        let action_params = HashMap::from([("message".to_string(), "action".to_string())]);
        assert_eq!(scenario.message_for(&action_params), "action");
    }

    #[tokio::test]
    async fn inline_body_replaces_named_action() {
        let (ctx, metrics) = context(Globals::default());
        let scenario = EchoScenario::new(ctx, "/".to_string());
        let body = ActionBody::new(|ctx: ScenarioContext| async move {
            ctx.metrics.increment_counter("inline_runs", 1);
            Ok(())
        });

        let action = scenario
            .create_action("anything", &HashMap::new(), Some(&body), "ConstantArrivalRate")
            .unwrap();
        action.run().await.unwrap();

        assert_eq!(metrics.counter("inline_runs"), 1);
    }

    #[tokio::test]
    async fn send_fails_until_connected() {
        let (ctx, _) = context(Globals::default());
        let scenario = EchoScenario::new(ctx, "/".to_string());
        assert!(!scenario.is_available_for_action_distribution());

        let action = scenario
            .create_action(SEND_ACTION, &HashMap::new(), None, "ConstantArrivalRate")
            .unwrap();
        assert!(matches!(
            action.run().await,
            Err(ScenarioError::ActionRun { .. })
        ));
    }

    #[tokio::test]
    async fn round_trip_against_local_echo_server() {
        let port = echo_server().await;
        let (ctx, metrics) = context(Globals {
            host: "127.0.0.1".to_string(),
            port,
            use_ssl: false,
        });
        let scenario = EchoScenario::new(ctx, "/".to_string());

        scenario.start(&[]);
        eventually(|| scenario.is_available_for_action_distribution()).await;
        assert_eq!(metrics.gauge("active_connections"), 1);

        let action = scenario
            .create_action(SEND_ACTION, &HashMap::new(), None, "ConstantArrivalRate")
            .unwrap();
        action.run().await.unwrap();
        action.run().await.unwrap();

        eventually(|| metrics.counter("messages_received") == 2).await;
        assert_eq!(metrics.counter("messages_sent"), 2);
        assert_eq!(metrics.latency("echo_latency").unwrap().count, 2);

        scenario.stop();
        eventually(|| !scenario.is_connected()).await;
        assert_eq!(metrics.gauge("active_connections"), 0);
    }
}
