use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Configuration Errors
// =============================================================================

/// Raised synchronously while a stage, action or arrival process is being set up.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("arrival rate must be positive, got {0}")]
    NonPositiveRate(f64),

    #[error("ramp target rate must be positive, got {0}")]
    NonPositiveRampTarget(f64),

    #[error("ramp step rate must be positive, got {0}")]
    NonPositiveRampStep(f64),

    #[error(
        "incomplete ramp: rampArrival, rampArrivalRate (or rampArrivalPeriod) and rampDuration must be set together"
    )]
    IncompleteRamp,

    #[error("ramp duration {window:?} is shorter than a single ramp step of {step:?}")]
    RampTooShort { window: Duration, step: Duration },

    #[error("poisson floor must be within (0, 1), got {0}")]
    InvalidPoissonFloor(f64),

    #[error("invalid duration '{0}'")]
    InvalidDuration(String),

    #[error("duration is required when no arrival intervals are given")]
    MissingDuration,

    #[error("stage name '{0}' is used more than once")]
    DuplicateStage(String),

    #[error("invalid target url: {0}")]
    InvalidTarget(#[from] url::ParseError),

    #[error("failed to read stress plan: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse stress plan: {0}")]
    Parse(#[from] sonic_rs::Error),

    #[error("stage '{stage}': {source}")]
    Stage {
        stage: String,
        #[source]
        source: Box<ConfigError>,
    },

    #[error("action '{action}': {source}")]
    Action {
        action: String,
        #[source]
        source: Box<ConfigError>,
    },
}

impl ConfigError {
    pub(crate) fn in_stage(self, stage: &str) -> Self {
        ConfigError::Stage {
            stage: stage.to_string(),
            source: Box::new(self),
        }
    }

    pub(crate) fn in_action(self, action: &str) -> Self {
        ConfigError::Action {
            action: action.to_string(),
            source: Box::new(self),
        }
    }
}

// =============================================================================
// Scenario Errors
// =============================================================================

/// Failures raised by scenario collaborators. None of these cross a stage or
/// action boundary: the scheduler logs them and carries on.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("no scenario provider registered for '{0}'")]
    ProviderNotFound(String),

    #[error("scenario provider '{kind}' was not available within {timeout:?}")]
    ProviderTimeout { kind: String, timeout: Duration },

    #[error("failed to initialize scenario '{kind}': {reason}")]
    Init { kind: String, reason: String },

    #[error("failed to create action '{action}': {reason}")]
    ActionCreation { action: String, reason: String },

    #[error("action '{action}' failed: {reason}")]
    ActionRun { action: String, reason: String },

    #[error("connection to {url} failed: {reason}")]
    Connection { url: String, reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
