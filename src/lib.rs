//! Scheduling core of a stress-testing engine.
//!
//! Stages create scenarios at a configured arrival rate; scenarios run
//! actions, either on their own schedule or handed out one at a time across
//! every live scenario of a stage.

pub mod arrival;
pub mod config;
pub mod distributor;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod scenario;
pub mod scenarios;
pub mod scheduler;
pub mod shutdown;

pub use arrival::{ArrivalProcess, ArrivalSchedule, Tick};
pub use config::{
    ActionDefinition, ArrivalIntervalSpec, DistributionMode, Globals, RateSpec, Stage, StressPlan,
};
pub use distributor::{ActionDistributor, DistributedActions, DistributionKey, DistributionPolicy};
pub use error::{ConfigError, ScenarioError};
pub use executor::RequestExecutor;
pub use metrics::HistogramMetrics;
pub use scenario::{
    ActionBody, MetricsSink, Scenario, ScenarioAction, ScenarioContext, ScenarioProvider,
    ScenarioRegistry,
};
pub use scheduler::{ScenarioWithActions, StressScheduler};
pub use shutdown::Shutdown;
