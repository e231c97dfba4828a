//! Arrival processes.
//!
//! An [`ArrivalProcess`] turns a [`RateSpec`] plus a delay and an active window
//! into a finite sequence of [`Tick`]s. The timing is computed up front as a
//! pure schedule of offsets (see [`ArrivalProcess::schedule`]); [`ArrivalProcess::observe`]
//! replays that schedule against the tokio clock, anchored at the first poll.
//!
//! Ramping splits the ramp window into equal steps. Every step restarts the
//! pacer at the step's rate; the last step keeps its rate until the window
//! closes. The window end is exclusive.

use crate::config::{ActionDefinition, ArrivalIntervalSpec, RateSpec, Stage};
use crate::error::ConfigError;
use futures_util::stream::{self, BoxStream, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::iter::Peekable;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

const CONSTANT_RATE_ID: &str = "ConstantArrivalRate";
const CONSTANT_RANDOMIZED_ID: &str = "ConstantRandomizedArrival";
const CONSTANT_POISSON_ID: &str = "ConstantPoissonArrival";
const RAMPING_RATE_ID: &str = "RampingArrivalRate";
const RAMPING_RANDOMIZED_ID: &str = "RampingRandomizedArrival";
const RAMPING_POISSON_ID: &str = "RampingPoissonArrival";

/// Period between two events at `rate` events per second, truncated to whole
/// milliseconds and never shorter than one millisecond.
pub fn period_of(rate: f64) -> Duration {
    Duration::from_millis(((1000.0 / rate) as u64).max(1))
}

/// Exponentially distributed gap for a Poisson process with rate `rate`.
///
/// `floor` keeps the logarithm argument strictly positive.
pub fn poisson_gap<R: Rng + ?Sized>(rate: f64, floor: f64, rng: &mut R) -> Duration {
    let uniform: f64 = rng.random();
    let secs = (-1.0 / rate) * (floor + (1.0 - floor) * uniform).ln();
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

// =============================================================================
// Ticks
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tick {
    /// Time since the process was first observed.
    pub offset: Duration,
    /// Arrival interval the tick belongs to.
    pub interval_id: Arc<str>,
}

// =============================================================================
// Pacers
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Pacing {
    Fixed,
    Randomized,
    Poisson { floor: f64 },
}

impl Pacing {
    fn of(rate: &RateSpec) -> Self {
        if rate.poisson {
            Pacing::Poisson {
                floor: rate.poisson_floor,
            }
        } else if rate.randomize {
            Pacing::Randomized
        } else {
            Pacing::Fixed
        }
    }

    fn default_id(self, ramping: bool) -> &'static str {
        match (self, ramping) {
            (Pacing::Fixed, false) => CONSTANT_RATE_ID,
            (Pacing::Randomized, false) => CONSTANT_RANDOMIZED_ID,
            (Pacing::Poisson { .. }, false) => CONSTANT_POISSON_ID,
            (Pacing::Fixed, true) => RAMPING_RATE_ID,
            (Pacing::Randomized, true) => RAMPING_RANDOMIZED_ID,
            (Pacing::Poisson { .. }, true) => RAMPING_POISSON_ID,
        }
    }
}

/// A span of the schedule paced at a single rate.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Segment {
    start: Duration,
    end: Duration,
    rate: f64,
}

/// Segment layout of one pacer. A constant rate is a single step covering
/// the whole window; segments are computed on demand.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Segments {
    delay: Duration,
    end: Duration,
    base_rate: f64,
    step: Duration,
    steps: u32,
    increase: f64,
}

impl Segments {
    fn segment(&self, index: u32) -> Option<Segment> {
        if index >= self.steps {
            return None;
        }
        let start = self.delay.saturating_add(self.step.saturating_mul(index));
        let end = if index + 1 == self.steps {
            self.end
        } else {
            start.saturating_add(self.step).min(self.end)
        };
        Some(Segment {
            start,
            end,
            rate: self.base_rate + self.increase * f64::from(index),
        })
    }
}

#[derive(Debug, Clone)]
struct Pacer {
    id: Arc<str>,
    pacing: Pacing,
    segments: Segments,
}

impl Pacer {
    fn new(
        rate: &RateSpec,
        delay: Duration,
        window: Duration,
        id: Option<&str>,
    ) -> Result<Self, ConfigError> {
        rate.validate()?;
        let pacing = Pacing::of(rate);
        let end = delay.saturating_add(window);

        let segments = match rate.ramp()? {
            None => Segments {
                delay,
                end,
                base_rate: rate.base_rate,
                step: window,
                steps: 1,
                increase: 0.0,
            },
            Some(ramp) => Segments {
                delay,
                end,
                base_rate: rate.base_rate,
                step: ramp.step,
                steps: ramp.steps,
                increase: (ramp.target - rate.base_rate) / f64::from(ramp.steps),
            },
        };

        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| pacing.default_id(rate.ramp_target.is_some()).to_string());

        Ok(Self {
            id: Arc::from(id),
            pacing,
            segments,
        })
    }

    fn schedule(&self, rng: StdRng) -> PacerSchedule {
        PacerSchedule {
            id: Arc::clone(&self.id),
            pacing: self.pacing,
            segments: self.segments,
            next_segment: 0,
            current: None,
            cursor: None,
            rng,
        }
    }
}

/// Lazily walks one pacer's segments.
struct PacerSchedule {
    id: Arc<str>,
    pacing: Pacing,
    segments: Segments,
    next_segment: u32,
    current: Option<Segment>,
    // Next slot start for fixed/randomized pacing, last arrival for Poisson.
    cursor: Option<Duration>,
    rng: StdRng,
}

impl Iterator for PacerSchedule {
    type Item = Tick;

    fn next(&mut self) -> Option<Tick> {
        loop {
            let segment = match self.current {
                Some(segment) => segment,
                None => {
                    let segment = self.segments.segment(self.next_segment)?;
                    self.next_segment += 1;
                    if segment.start >= segment.end {
                        continue;
                    }
                    self.current = Some(segment);
                    self.cursor = None;
                    segment
                }
            };
            let cursor = self.cursor.unwrap_or(segment.start);

            let (at, next_cursor) = match self.pacing {
                Pacing::Fixed => (cursor, cursor.saturating_add(period_of(segment.rate))),
                Pacing::Randomized => {
                    let period = period_of(segment.rate);
                    let jitter = (period.as_millis() as f64 * self.rng.random::<f64>()) as u64;
                    (
                        cursor.saturating_add(Duration::from_millis(jitter)),
                        cursor.saturating_add(period),
                    )
                }
                Pacing::Poisson { floor } => {
                    let at = cursor.saturating_add(poisson_gap(segment.rate, floor, &mut self.rng));
                    (at, at)
                }
            };

            if at < segment.end {
                self.cursor = Some(next_cursor);
                return Some(Tick {
                    offset: at,
                    interval_id: Arc::clone(&self.id),
                });
            }
            self.current = None;
        }
    }
}

// =============================================================================
// Arrival Process
// =============================================================================

/// A finite, single-use arrival process.
#[derive(Debug)]
pub struct ArrivalProcess {
    pacers: Vec<Pacer>,
    limit: Option<usize>,
    rng: StdRng,
}

impl ArrivalProcess {
    /// Single pacer over `[delay, delay + window)`, capped at `limit` ticks.
    pub fn new(
        rate: &RateSpec,
        delay: Duration,
        window: Duration,
        limit: Option<usize>,
    ) -> Result<Self, ConfigError> {
        Ok(Self::from_pacers(
            vec![Pacer::new(rate, delay, window, None)?],
            limit,
        ))
    }

    /// Merges one pacer per interval; every tick carries its interval id.
    pub fn from_intervals(
        intervals: &[ArrivalIntervalSpec],
        limit: Option<usize>,
    ) -> Result<Self, ConfigError> {
        let pacers = intervals
            .iter()
            .map(|interval| {
                Pacer::new(
                    &interval.rate,
                    interval.delay,
                    interval.duration,
                    Some(&interval.id),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_pacers(pacers, limit))
    }

    /// Scenario arrivals of a stage, capped by its scenario limit.
    pub fn for_stage(stage: &Stage) -> Result<Self, ConfigError> {
        let process = if stage.arrival_intervals.is_empty() {
            Self::new(
                &stage.rate,
                stage.start_delay,
                stage.active_window,
                stage.max_scenarios,
            )
        } else {
            Self::from_intervals(&stage.arrival_intervals, stage.max_scenarios)
        };
        process.map_err(|e| e.in_stage(&stage.name))
    }

    /// Invocation arrivals of an action.
    pub fn for_action(action: &ActionDefinition) -> Result<Self, ConfigError> {
        let process = if action.arrival_intervals.is_empty() {
            Self::new(&action.rate, action.delay, action.duration, None)
        } else {
            Self::from_intervals(&action.arrival_intervals, None)
        };
        process.map_err(|e| e.in_action(&action.name))
    }

    fn from_pacers(pacers: Vec<Pacer>, limit: Option<usize>) -> Self {
        Self {
            pacers,
            limit,
            rng: StdRng::from_rng(&mut rand::rng()),
        }
    }

    /// Replaces the random source, making randomized and Poisson pacing reproducible.
    pub fn seeded(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// The tick offsets this process will emit, in time order.
    pub fn schedule(mut self) -> ArrivalSchedule {
        let pacers = self
            .pacers
            .iter()
            .map(|pacer| pacer.schedule(StdRng::from_rng(&mut self.rng)).peekable())
            .collect();
        ArrivalSchedule {
            pacers,
            remaining: self.limit,
        }
    }

    /// Emits each tick when its offset is reached. The clock starts on first poll.
    pub fn observe(self) -> BoxStream<'static, Tick> {
        let schedule = self.schedule();
        stream::unfold(
            (schedule, None::<Instant>),
            |(mut schedule, anchor)| async move {
                let anchor = anchor.unwrap_or_else(Instant::now);
                let tick = schedule.next()?;
                if let Some(deadline) = anchor.checked_add(tick.offset) {
                    sleep_until(deadline).await;
                }
                Some((tick, (schedule, Some(anchor))))
            },
        )
        .boxed()
    }
}

/// Time-ordered merge of every pacer of a process.
pub struct ArrivalSchedule {
    pacers: Vec<Peekable<PacerSchedule>>,
    remaining: Option<usize>,
}

impl Iterator for ArrivalSchedule {
    type Item = Tick;

    fn next(&mut self) -> Option<Tick> {
        if self.remaining == Some(0) {
            return None;
        }
        let earliest = self
            .pacers
            .iter_mut()
            .enumerate()
            .filter_map(|(idx, pacer)| pacer.peek().map(|tick| (idx, tick.offset)))
            .min_by_key(|(_, offset)| *offset)
            .map(|(idx, _)| idx)?;

        let tick = self.pacers[earliest].next()?;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(tick)
    }
}
