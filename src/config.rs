//! Stress plan configuration.
//!
//! Stages, actions and arrival intervals arrive as already-parsed structures;
//! the serde names follow the plan format used by existing test plans
//! (`arrivalRate`, `rampArrival`, `scenariosLimit`, ...). Durations are written
//! as human-readable strings such as `"500ms"`, `"5s"` or `"10min"`.

use crate::arrival::period_of;
use crate::distributor::DistributionPolicy;
use crate::error::ConfigError;
use crate::scenario::ActionBody;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_POISSON_FLOOR: f64 = 0.0001;

// =============================================================================
// Rate Specification
// =============================================================================

/// How often something arrives, and how that frequency evolves over time.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RateSpec {
    /// Events per second.
    #[serde(rename = "arrivalRate", default = "default_rate")]
    pub base_rate: f64,

    /// Rate reached at the end of the ramp window.
    #[serde(rename = "rampArrival", default)]
    pub ramp_target: Option<f64>,

    /// How often (per second) the rate is adjusted while ramping.
    #[serde(rename = "rampArrivalRate", default)]
    pub ramp_step_rate: Option<f64>,

    /// Same as `ramp_step_rate`, expressed as a period. The rate wins when both are set.
    #[serde(
        rename = "rampArrivalPeriod",
        default,
        deserialize_with = "de::optional_duration"
    )]
    pub ramp_step_period: Option<Duration>,

    #[serde(
        rename = "rampDuration",
        default,
        deserialize_with = "de::optional_duration"
    )]
    pub ramp_window: Option<Duration>,

    #[serde(rename = "poissonArrival", default)]
    pub poisson: bool,

    /// Lower bound of the uniform sample fed into the Poisson logarithm.
    #[serde(rename = "poissonMinRandom", default = "default_poisson_floor")]
    pub poisson_floor: f64,

    #[serde(rename = "randomizeArrival", default)]
    pub randomize: bool,
}

/// Resolved ramp parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ramp {
    pub target: f64,
    pub step: Duration,
    pub window: Duration,
    pub steps: u32,
}

fn default_rate() -> f64 {
    1.0
}

fn default_poisson_floor() -> f64 {
    DEFAULT_POISSON_FLOOR
}

impl Default for RateSpec {
    fn default() -> Self {
        Self::constant(default_rate())
    }
}

impl RateSpec {
    pub fn constant(rate: f64) -> Self {
        Self {
            base_rate: rate,
            ramp_target: None,
            ramp_step_rate: None,
            ramp_step_period: None,
            ramp_window: None,
            poisson: false,
            poisson_floor: DEFAULT_POISSON_FLOOR,
            randomize: false,
        }
    }

    pub fn with_ramp(mut self, target: f64, step_rate: f64, window: Duration) -> Self {
        self.ramp_target = Some(target);
        self.ramp_step_rate = Some(step_rate);
        self.ramp_window = Some(window);
        self
    }

    pub fn with_ramp_period(mut self, target: f64, step: Duration, window: Duration) -> Self {
        self.ramp_target = Some(target);
        self.ramp_step_period = Some(step);
        self.ramp_window = Some(window);
        self
    }

    pub fn with_poisson(mut self) -> Self {
        self.poisson = true;
        self
    }

    pub fn with_poisson_floor(mut self, floor: f64) -> Self {
        self.poisson = true;
        self.poisson_floor = floor;
        self
    }

    pub fn randomized(mut self) -> Self {
        self.randomize = true;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.base_rate > 0.0 && self.base_rate.is_finite()) {
            return Err(ConfigError::NonPositiveRate(self.base_rate));
        }
        if self.poisson && !(self.poisson_floor > 0.0 && self.poisson_floor < 1.0) {
            return Err(ConfigError::InvalidPoissonFloor(self.poisson_floor));
        }
        self.ramp().map(|_| ())
    }

    /// Resolves the ramp triple. All three parts must be present, or none.
    pub fn ramp(&self) -> Result<Option<Ramp>, ConfigError> {
        let step = match (self.ramp_step_rate, self.ramp_step_period) {
            (Some(rate), _) => {
                if !(rate > 0.0 && rate.is_finite()) {
                    return Err(ConfigError::NonPositiveRampStep(rate));
                }
                Some(period_of(rate))
            }
            (None, Some(period)) if period.is_zero() => {
                return Err(ConfigError::NonPositiveRampStep(0.0));
            }
            (None, period) => period,
        };

        match (self.ramp_target, step, self.ramp_window) {
            (None, None, None) => Ok(None),
            (Some(target), Some(step), Some(window)) => {
                if !(target > 0.0 && target.is_finite()) {
                    return Err(ConfigError::NonPositiveRampTarget(target));
                }
                let steps = window.as_nanos() / step.as_nanos().max(1);
                if steps == 0 {
                    return Err(ConfigError::RampTooShort { window, step });
                }
                Ok(Some(Ramp {
                    target,
                    step,
                    window,
                    steps: u32::try_from(steps).unwrap_or(u32::MAX),
                }))
            }
            _ => Err(ConfigError::IncompleteRamp),
        }
    }
}

// =============================================================================
// Arrival Intervals
// =============================================================================

/// A named sub-window with its own pacing. Its id is handed to every scenario
/// or action created from one of its ticks.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ArrivalIntervalSpec {
    pub id: String,

    #[serde(default, deserialize_with = "de::duration")]
    pub delay: Duration,

    #[serde(default = "default_interval_duration", deserialize_with = "de::duration")]
    pub duration: Duration,

    #[serde(flatten)]
    pub rate: RateSpec,
}

fn default_interval_duration() -> Duration {
    Duration::from_secs(60)
}

impl ArrivalIntervalSpec {
    pub fn new(id: impl Into<String>, delay: Duration, duration: Duration, rate: RateSpec) -> Self {
        Self {
            id: id.into(),
            delay,
            duration,
            rate,
        }
    }
}

// =============================================================================
// Actions
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DistributionMode {
    /// Every scenario runs its own copy of the action.
    #[default]
    None,
    RoundRobin,
    Random,
}

impl DistributionMode {
    /// The pooling policy, or `None` when the owning scenario runs the action itself.
    pub fn policy(self) -> Option<DistributionPolicy> {
        match self {
            DistributionMode::None => None,
            DistributionMode::RoundRobin => Some(DistributionPolicy::RoundRobin),
            DistributionMode::Random => Some(DistributionPolicy::Random),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDefinition {
    pub name: String,

    #[serde(default, deserialize_with = "de::duration")]
    pub delay: Duration,

    #[serde(deserialize_with = "de::duration")]
    pub duration: Duration,

    #[serde(flatten)]
    pub rate: RateSpec,

    #[serde(default)]
    pub action_parameters: HashMap<String, String>,

    #[serde(default)]
    pub distribution_mode: DistributionMode,

    #[serde(default)]
    pub arrival_intervals: Vec<ArrivalIntervalSpec>,

    #[serde(skip)]
    pub run: Option<ActionBody>,
}

impl ActionDefinition {
    pub fn new(name: impl Into<String>, rate: RateSpec, delay: Duration, duration: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
            duration,
            rate,
            action_parameters: HashMap::new(),
            distribution_mode: DistributionMode::None,
            arrival_intervals: Vec::new(),
            run: None,
        }
    }

    pub fn with_distribution(mut self, mode: DistributionMode) -> Self {
        self.distribution_mode = mode;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.action_parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_interval(mut self, interval: ArrivalIntervalSpec) -> Self {
        self.arrival_intervals.push(interval);
        self
    }

    pub fn with_body(mut self, body: ActionBody) -> Self {
        self.run = Some(body);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_pacing(&self.rate, &self.arrival_intervals).map_err(|e| e.in_action(&self.name))
    }
}

// =============================================================================
// Stages
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub name: String,

    #[serde(rename = "scenarioName")]
    pub scenario_kind: String,

    #[serde(rename = "delay", default, deserialize_with = "de::duration")]
    pub start_delay: Duration,

    /// Only read when the stage has no arrival intervals.
    #[serde(rename = "duration", default, deserialize_with = "de::duration")]
    pub active_window: Duration,

    #[serde(flatten)]
    pub rate: RateSpec,

    #[serde(default)]
    pub scenario_parameters: HashMap<String, String>,

    #[serde(rename = "scenarioProviderParameters", default)]
    pub provider_parameters: HashMap<String, String>,

    #[serde(rename = "scenariosLimit", default)]
    pub max_scenarios: Option<usize>,

    #[serde(default)]
    pub arrival_intervals: Vec<ArrivalIntervalSpec>,

    #[serde(default)]
    pub actions: Vec<ActionDefinition>,
}

impl Stage {
    pub fn new(
        name: impl Into<String>,
        scenario_kind: impl Into<String>,
        start_delay: Duration,
        active_window: Duration,
        rate: RateSpec,
    ) -> Self {
        Self {
            name: name.into(),
            scenario_kind: scenario_kind.into(),
            start_delay,
            active_window,
            rate,
            scenario_parameters: HashMap::new(),
            provider_parameters: HashMap::new(),
            max_scenarios: None,
            arrival_intervals: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn with_max_scenarios(mut self, limit: usize) -> Self {
        self.max_scenarios = Some(limit);
        self
    }

    pub fn with_action(mut self, action: ActionDefinition) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_interval(mut self, interval: ArrivalIntervalSpec) -> Self {
        self.arrival_intervals.push(interval);
        self
    }

    pub fn with_scenario_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.scenario_parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_provider_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.provider_parameters.insert(key.into(), value.into());
        self
    }

    /// True when at least one action is shared between the stage's scenarios.
    pub fn has_distributed_actions(&self) -> bool {
        self.actions
            .iter()
            .any(|action| action.distribution_mode.policy().is_some())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let window = if self.arrival_intervals.is_empty() && self.active_window.is_zero() {
            Err(ConfigError::MissingDuration)
        } else {
            Ok(())
        };
        window
            .and_then(|_| validate_pacing(&self.rate, &self.arrival_intervals))
            .and_then(|_| self.actions.iter().try_for_each(ActionDefinition::validate))
            .map_err(|e| e.in_stage(&self.name))
    }
}

/// Validates every stage and rejects reused stage names, which key shared action pools.
pub fn validate_stages(stages: &[Stage]) -> Result<(), ConfigError> {
    let mut seen = HashSet::with_capacity(stages.len());
    for stage in stages {
        if !seen.insert(stage.name.as_str()) {
            return Err(ConfigError::DuplicateStage(stage.name.clone()));
        }
        stage.validate()?;
    }
    Ok(())
}

// Intervals replace the top-level rate entirely, so only one of the two is checked.
fn validate_pacing(rate: &RateSpec, intervals: &[ArrivalIntervalSpec]) -> Result<(), ConfigError> {
    if intervals.is_empty() {
        rate.validate()
    } else {
        intervals.iter().try_for_each(|interval| interval.rate.validate())
    }
}

// =============================================================================
// Stress Plan
// =============================================================================

/// Where the system under test lives.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Globals {
    pub host: String,
    pub port: u16,
    pub use_ssl: bool,
}

impl Default for Globals {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
            use_ssl: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StressPlan {
    #[serde(default)]
    pub globals: Globals,
    #[serde(default)]
    pub stages: Vec<Stage>,
}

impl StressPlan {
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let plan: StressPlan = sonic_rs::from_str(content)?;
        validate_stages(&plan.stages)?;
        Ok(plan)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let plan = Self::from_json(&content)?;
        info!("Loaded {} stages from {:?}", plan.stages.len(), path);
        Ok(plan)
    }
}

// =============================================================================
// Durations
// =============================================================================

/// Parses `"<count><unit>"`, e.g. `"250ms"`, `"5 s"`, `"10min"`, `"1h"`.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(raw.to_string());
    let trimmed = raw.trim();
    let digits = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (count, unit) = trimmed.split_at(digits);
    let count: u64 = count.parse().map_err(|_| invalid())?;

    let secs = |multiplier: u64| {
        count
            .checked_mul(multiplier)
            .map(Duration::from_secs)
            .ok_or_else(invalid)
    };

    match unit.trim() {
        "ns" | "nanosecond" | "nanoseconds" => Ok(Duration::from_nanos(count)),
        "us" | "um" | "microsecond" | "microseconds" => Ok(Duration::from_micros(count)),
        "ms" | "millisecond" | "milliseconds" => Ok(Duration::from_millis(count)),
        "s" | "second" | "seconds" => secs(1),
        "m" | "min" | "mins" | "minute" | "minutes" => secs(60),
        "h" | "hour" | "hours" => secs(3_600),
        "d" | "day" | "days" => secs(86_400),
        _ => Err(invalid()),
    }
}

mod de {
    use super::parse_duration;
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }

    pub fn optional_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|raw| parse_duration(&raw))
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_supported_duration_units() {
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("5 seconds").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("1min").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7_200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("7us").unwrap(), Duration::from_micros(7));
    }

    #[test]
    fn rejects_malformed_durations() {
        for raw in ["", "ms", "10", "10 parsecs", "-5s", "1.5s"] {
            assert!(
                matches!(parse_duration(raw), Err(ConfigError::InvalidDuration(_))),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn non_positive_rate_is_rejected() {
        assert!(matches!(
            RateSpec::constant(0.0).validate(),
            Err(ConfigError::NonPositiveRate(_))
        ));
        assert!(matches!(
            RateSpec::constant(-1.0).validate(),
            Err(ConfigError::NonPositiveRate(_))
        ));
        assert!(matches!(
            RateSpec::constant(f64::NAN).validate(),
            Err(ConfigError::NonPositiveRate(_))
        ));
    }

    #[test]
    fn ramp_fields_are_all_or_nothing() {
        let mut rate = RateSpec::constant(1.0);
        rate.ramp_target = Some(2.0);
        assert!(matches!(rate.validate(), Err(ConfigError::IncompleteRamp)));

        rate.ramp_window = Some(Duration::from_secs(300));
        assert!(matches!(rate.validate(), Err(ConfigError::IncompleteRamp)));

        rate.ramp_step_rate = Some(0.2);
        assert!(rate.validate().is_ok());
    }

    #[test]
    fn ramp_step_rate_wins_over_period() {
        let mut rate = RateSpec::constant(1.0).with_ramp(2.0, 0.2, Duration::from_secs(300));
        rate.ramp_step_period = Some(Duration::from_secs(60));

        let ramp = rate.ramp().unwrap().unwrap();
        assert_eq!(ramp.step, Duration::from_secs(5));
        assert_eq!(ramp.steps, 60);
    }

    #[test]
    fn ramp_shorter_than_one_step_is_rejected() {
        let rate = RateSpec::constant(1.0).with_ramp_period(
            2.0,
            Duration::from_secs(10),
            Duration::from_secs(5),
        );
        assert!(matches!(rate.validate(), Err(ConfigError::RampTooShort { .. })));
    }

    #[test]
    fn sub_millisecond_ramp_steps_cover_the_whole_window() {
        let rate = RateSpec::constant(1.0).with_ramp_period(
            100.0,
            Duration::from_micros(500),
            Duration::from_secs(10),
        );

        let ramp = rate.ramp().unwrap().unwrap();
        assert_eq!(ramp.steps, 20_000);
        assert_eq!(ramp.step * (ramp.steps - 1), Duration::from_micros(9_999_500));
    }

    #[test]
    fn poisson_floor_must_stay_inside_unit_interval() {
        assert!(RateSpec::constant(1.0).with_poisson().validate().is_ok());
        assert!(matches!(
            RateSpec::constant(1.0).with_poisson_floor(0.0).validate(),
            Err(ConfigError::InvalidPoissonFloor(_))
        ));
        assert!(matches!(
            RateSpec::constant(1.0).with_poisson_floor(1.0).validate(),
            Err(ConfigError::InvalidPoissonFloor(_))
        ));
    }

    #[test]
    fn stage_errors_name_the_stage_and_action() {
        let stage = Stage::new(
            "checkout",
            "echo-websocket",
            Duration::ZERO,
            Duration::from_secs(60),
            RateSpec::constant(1.0),
        )
        .with_action(ActionDefinition::new(
            "send",
            RateSpec::constant(0.0),
            Duration::ZERO,
            Duration::from_secs(10),
        ));

        let err = stage.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "stage 'checkout': action 'send': arrival rate must be positive, got 0"
        );
    }

    #[test]
    fn loads_plan_from_json() {
        let plan = StressPlan::from_json(
            r#"{
                "globals": { "host": "echo.local", "port": 9001, "useSsl": true },
                "stages": [{
                    "name": "warmup",
                    "scenarioName": "echo-websocket",
                    "delay": "1min",
                    "duration": "10min",
                    "arrivalRate": 1.0,
                    "rampArrival": 2.0,
                    "rampArrivalRate": 0.2,
                    "rampDuration": "5min",
                    "scenariosLimit": 30,
                    "scenarioParameters": { "greeting": "hi" },
                    "actions": [{
                        "name": "send",
                        "duration": "3min",
                        "arrivalRate": 2,
                        "distributionMode": "ROUND_ROBIN",
                        "actionParameters": { "message": "ping" }
                    }]
                }]
            }"#,
        )
        .unwrap();

        assert_eq!(plan.globals.host, "echo.local");
        assert_eq!(plan.globals.port, 9001);
        assert!(plan.globals.use_ssl);

        let stage = &plan.stages[0];
        assert_eq!(stage.scenario_kind, "echo-websocket");
        assert_eq!(stage.start_delay, Duration::from_secs(60));
        assert_eq!(stage.active_window, Duration::from_secs(600));
        assert_eq!(stage.rate.ramp_target, Some(2.0));
        assert_eq!(stage.rate.ramp_window, Some(Duration::from_secs(300)));
        assert_eq!(stage.rate.poisson_floor, DEFAULT_POISSON_FLOOR);
        assert_eq!(stage.max_scenarios, Some(30));
        assert_eq!(stage.scenario_parameters["greeting"], "hi");

        let action = &stage.actions[0];
        assert_eq!(action.distribution_mode, DistributionMode::RoundRobin);
        assert_eq!(action.rate.base_rate, 2.0);
        assert_eq!(action.delay, Duration::ZERO);
        assert_eq!(action.action_parameters["message"], "ping");
        assert!(stage.has_distributed_actions());
    }

    #[test]
    fn interval_only_stage_needs_no_duration() {
        let plan = StressPlan::from_json(
            r#"{ "stages": [{
                "name": "shifts",
                "scenarioName": "echo-websocket",
                "arrivalIntervals": [
                    { "id": "morning", "duration": "1h", "arrivalRate": 2 },
                    { "id": "evening", "delay": "8h", "duration": "2h", "arrivalRate": 5 }
                ]
            }] }"#,
        )
        .unwrap();

        let stage = &plan.stages[0];
        assert_eq!(stage.active_window, Duration::ZERO);
        assert_eq!(stage.arrival_intervals.len(), 2);
        assert_eq!(stage.arrival_intervals[1].delay, Duration::from_secs(8 * 3_600));
    }

    #[test]
    fn stage_without_duration_or_intervals_is_rejected() {
        let err = StressPlan::from_json(
            r#"{ "stages": [{ "name": "idle", "scenarioName": "echo-websocket" }] }"#,
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "stage 'idle': duration is required when no arrival intervals are given"
        );
    }

    #[test]
    fn duplicate_stage_names_are_rejected() {
        let err = StressPlan::from_json(
            r#"{ "stages": [
                { "name": "checkout", "scenarioName": "echo-websocket", "duration": "1min" },
                { "name": "checkout", "scenarioName": "echo-websocket", "duration": "2min" }
            ] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateStage(ref name) if name == "checkout"));
    }

    #[test]
    fn plan_with_invalid_rate_fails_validation() {
        let result = StressPlan::from_json(
            r#"{ "stages": [{
                "name": "broken",
                "scenarioName": "echo-websocket",
                "duration": "1min",
                "arrivalRate": 0
            }] }"#,
        );
        assert!(matches!(result, Err(ConfigError::Stage { .. })));
    }
}
