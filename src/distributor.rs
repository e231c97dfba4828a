//! Shared action distribution.
//!
//! An [`ActionDistributor`] owns the arrival process of one action definition
//! and, on every tick, hands a freshly created action to exactly one of the
//! scenarios currently registered with it. Registration, removal, selection
//! and clearing all happen under a single per-distributor lock.
//!
//! Lifecycle: the distributor is cold until the first registration, which
//! spawns the task driving its arrivals. When those arrivals end, or on
//! [`ActionDistributor::stop`], every registration is dropped (closing its
//! [`DistributedActions`] stream) and later registrations get an empty stream.

use crate::arrival::{ArrivalProcess, Tick};
use crate::config::ActionDefinition;
use crate::error::ConfigError;
use crate::scenario::{Scenario, ScenarioAction};
use crate::shutdown::ShutdownListener;
use futures_util::{Stream, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistributionPolicy {
    /// FIFO rotation over the pool, skipping ineligible scenarios.
    RoundRobin,
    /// Uniform draws over the pool, at most one draw per pooled scenario.
    Random,
}

/// Identifies one distributor: the distribution id of the stage plus the
/// action's position and name within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DistributionKey {
    pub stage: Arc<str>,
    pub action_index: usize,
    pub action_name: Arc<str>,
}

impl DistributionKey {
    pub fn new(stage: &str, action_index: usize, action_name: &str) -> Self {
        Self {
            stage: Arc::from(stage),
            action_index,
            action_name: Arc::from(action_name),
        }
    }
}

impl fmt::Display for DistributionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.stage, self.action_name, self.action_index)
    }
}

type ActionSender = mpsc::UnboundedSender<Box<dyn ScenarioAction>>;

struct Registration {
    id: u64,
    scenario: Arc<dyn Scenario>,
    tx: ActionSender,
}

struct Pool {
    entries: VecDeque<Registration>,
    stopped: bool,
    rng: StdRng,
}

impl Pool {
    fn choose(&mut self, policy: DistributionPolicy) -> Option<(Arc<dyn Scenario>, ActionSender)> {
        match policy {
            DistributionPolicy::RoundRobin => self.choose_round_robin(),
            DistributionPolicy::Random => self.choose_random(),
        }
    }

    // Every visited entry goes back to the tail, so a full rotation keeps
    // the relative order intact.
    fn choose_round_robin(&mut self) -> Option<(Arc<dyn Scenario>, ActionSender)> {
        for _ in 0..self.entries.len() {
            let entry = self.entries.pop_front()?;
            let picked = entry
                .scenario
                .is_available_for_action_distribution()
                .then(|| (Arc::clone(&entry.scenario), entry.tx.clone()));
            self.entries.push_back(entry);
            if picked.is_some() {
                return picked;
            }
        }
        None
    }

    fn choose_random(&mut self) -> Option<(Arc<dyn Scenario>, ActionSender)> {
        let size = self.entries.len();
        for _ in 0..size {
            let entry = &self.entries[self.rng.random_range(0..size)];
            if entry.scenario.is_available_for_action_distribution() {
                return Some((Arc::clone(&entry.scenario), entry.tx.clone()));
            }
        }
        None
    }
}

// =============================================================================
// Distributor
// =============================================================================

pub struct ActionDistributor {
    key: DistributionKey,
    policy: DistributionPolicy,
    definition: Arc<ActionDefinition>,
    arrivals: Mutex<Option<ArrivalProcess>>,
    started: AtomicBool,
    pool: Mutex<Pool>,
    next_id: AtomicU64,
    shutdown: ShutdownListener,
}

impl ActionDistributor {
    /// Fails fast when the action's pacing is invalid.
    pub fn new(
        key: DistributionKey,
        policy: DistributionPolicy,
        definition: Arc<ActionDefinition>,
        shutdown: ShutdownListener,
    ) -> Result<Self, ConfigError> {
        let arrivals = ArrivalProcess::for_action(&definition)?;
        Ok(Self {
            key,
            policy,
            definition,
            arrivals: Mutex::new(Some(arrivals)),
            started: AtomicBool::new(false),
            pool: Mutex::new(Pool {
                entries: VecDeque::new(),
                stopped: false,
                rng: StdRng::from_rng(&mut rand::rng()),
            }),
            next_id: AtomicU64::new(0),
            shutdown,
        })
    }

    /// Fixes the seed of both the arrival process and random selection.
    pub fn seeded(self, seed: u64) -> Self {
        {
            let mut arrivals = lock(&self.arrivals);
            *arrivals = arrivals.take().map(|process| process.seeded(seed));
            lock(&self.pool).rng = StdRng::seed_from_u64(seed);
        }
        self
    }

    pub fn key(&self) -> &DistributionKey {
        &self.key
    }

    pub fn policy(&self) -> DistributionPolicy {
        self.policy
    }

    /// Number of currently registered scenarios.
    pub fn registered(&self) -> usize {
        lock(&self.pool).entries.len()
    }

    pub fn is_stopped(&self) -> bool {
        lock(&self.pool).stopped
    }

    /// Adds `scenario` to the pool and returns the actions chosen for it.
    ///
    /// The stream ends when the distributor stops. Dropping it unregisters
    /// the scenario.
    pub fn register(self: &Arc<Self>, scenario: Arc<dyn Scenario>) -> DistributedActions {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut pool = lock(&self.pool);
            if pool.stopped || self.shutdown.is_triggered() {
                debug!(distribution = %self.key, "registration rejected, distributor stopped");
                return DistributedActions {
                    rx,
                    owner: Weak::new(),
                    id,
                };
            }
            pool.entries.push_back(Registration { id, scenario, tx });
        }

        self.ensure_started();
        DistributedActions {
            rx,
            owner: Arc::downgrade(self),
            id,
        }
    }

    pub fn remove(&self, id: u64) {
        let mut pool = lock(&self.pool);
        if let Some(idx) = pool.entries.iter().position(|entry| entry.id == id) {
            pool.entries.remove(idx);
            trace!(distribution = %self.key, id, "scenario unregistered");
        }
    }

    /// Drops every registration, which completes their streams.
    pub fn clear(&self) {
        lock(&self.pool).entries.clear();
    }

    /// Terminal: clears the pool and rejects any further registration.
    pub fn stop(&self) {
        let mut pool = lock(&self.pool);
        if !pool.stopped {
            pool.stopped = true;
            pool.entries.clear();
            debug!(distribution = %self.key, "action distribution stopped");
        }
    }

    fn ensure_started(self: &Arc<Self>) {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let Some(arrivals) = lock(&self.arrivals).take() else {
            return;
        };
        let this = Arc::clone(self);
        tokio::spawn(async move { this.drive(arrivals).await });
    }

    async fn drive(self: Arc<Self>, arrivals: ArrivalProcess) {
        debug!(distribution = %self.key, policy = ?self.policy, "action distribution started");

        let mut ticks = arrivals.observe();
        let shutdown = self.shutdown.clone().wait();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                tick = ticks.next() => match tick {
                    Some(tick) => self.dispatch(&tick),
                    None => break,
                },
            }
        }

        self.stop();
    }

    /// Hands one new action to an eligible scenario, if there is one.
    pub(crate) fn dispatch(&self, tick: &Tick) {
        let chosen = lock(&self.pool).choose(self.policy);
        let Some((scenario, tx)) = chosen else {
            trace!(distribution = %self.key, "no eligible scenario, tick dropped");
            return;
        };

        let action = scenario.create_action(
            &self.definition.name,
            &self.definition.action_parameters,
            self.definition.run.as_ref(),
            &tick.interval_id,
        );
        match action {
            Ok(action) => {
                if tx.send(action).is_err() {
                    trace!(distribution = %self.key, "receiver gone, action dropped");
                }
            }
            Err(e) => {
                error!(
                    stage = %self.key.stage,
                    action = %self.key.action_name,
                    error = %e,
                    "Failed to create distributed action"
                );
            }
        }
    }
}

impl fmt::Debug for ActionDistributor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDistributor")
            .field("key", &self.key)
            .field("policy", &self.policy)
            .field("registered", &self.registered())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// Distributed Actions
// =============================================================================

/// Actions chosen for one registered scenario.
pub struct DistributedActions {
    rx: mpsc::UnboundedReceiver<Box<dyn ScenarioAction>>,
    owner: Weak<ActionDistributor>,
    id: u64,
}

impl Stream for DistributedActions {
    type Item = Box<dyn ScenarioAction>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for DistributedActions {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.remove(self.id);
        }
    }
}
