// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use many_cpus::SystemHardware;

use crate::sleeper::{DEFAULT_OVERSHOOT_CORRECTION, DEFAULT_SMOOTHING_FACTOR};
use crate::{Error, Result};

const DEFAULT_IDLE_MULTIPLIER: u32 = 3;
const DEFAULT_IDLE_FLOOR: Duration = Duration::from_millis(30);
const DEFAULT_IDLE_CEILING: Duration = Duration::from_secs(3);
const DEFAULT_SUPERVISOR_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_SHARD_IDLE_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_MAX_CALLBACK_THREADS: usize = 16;
const DEFAULT_CALLBACK_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_OVERSHOOT_CORRECTION: f64 = 4.0;

/// Decides which scheduling loop a new timer is registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum Routing {
    /// Timers go to the loop of the [`Granularity`][crate::Granularity] their period falls into.
    ///
    /// Each loop only ever sleeps for durations of a similar order of magnitude, which keeps
    /// the sleep correction of coarse and fine timers apart.
    #[default]
    Granularity,

    /// Timers are spread over [`Config::shard_count`] loops by their fire time.
    ///
    /// This spreads a high volume of short timers over the available processors.
    Sharded,
}

/// Tunes a [`LoopRegistry`][crate::LoopRegistry].
///
/// `Config` is a by-value builder. Every setter returns the updated configuration, and the
/// result is validated once it is handed to [`LoopRegistry::with_config`][crate::LoopRegistry::with_config].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use timerloop::{Config, LoopRegistry, Routing};
///
/// let registry = LoopRegistry::with_config(
///     Config::new()
///         .routing(Routing::Sharded)
///         .shard_count(2)
///         .idle_floor(Duration::from_millis(10)),
/// )?;
///
/// assert_eq!(registry.live_loops(), 0);
/// # Ok::<(), timerloop::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) smoothing_factor: f64,
    pub(crate) overshoot_correction: f64,
    pub(crate) idle_multiplier: u32,
    pub(crate) idle_floor: Duration,
    pub(crate) idle_ceiling: Duration,
    pub(crate) supervisor_interval: Duration,
    shard_count: Option<usize>,
    pub(crate) shard_idle_timeout: Duration,
    pub(crate) routing: Routing,
    pub(crate) max_callback_threads: usize,
    pub(crate) callback_idle_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            smoothing_factor: DEFAULT_SMOOTHING_FACTOR,
            overshoot_correction: DEFAULT_OVERSHOOT_CORRECTION,
            idle_multiplier: DEFAULT_IDLE_MULTIPLIER,
            idle_floor: DEFAULT_IDLE_FLOOR,
            idle_ceiling: DEFAULT_IDLE_CEILING,
            supervisor_interval: DEFAULT_SUPERVISOR_INTERVAL,
            shard_count: None,
            shard_idle_timeout: DEFAULT_SHARD_IDLE_TIMEOUT,
            routing: Routing::default(),
            max_callback_threads: DEFAULT_MAX_CALLBACK_THREADS,
            callback_idle_timeout: DEFAULT_CALLBACK_IDLE_TIMEOUT,
        }
    }
}

impl Config {
    /// Creates a configuration with the default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Weight of the history in the smoothed sleep error, in `[0, 1)`. Defaults to `0.118`.
    #[must_use]
    pub const fn smoothing_factor(mut self, value: f64) -> Self {
        self.smoothing_factor = value;
        self
    }

    /// Share of the smoothed oversleep subtracted from each sleep request, in `[0, 4]`.
    /// Defaults to `1.0`.
    #[must_use]
    pub const fn overshoot_correction(mut self, value: f64) -> Self {
        self.overshoot_correction = value;
        self
    }

    /// How many granularities an empty loop waits before it is torn down. Defaults to `3`.
    #[must_use]
    pub const fn idle_multiplier(mut self, value: u32) -> Self {
        self.idle_multiplier = value;
        self
    }

    /// Shortest idle period before an empty loop is torn down. Defaults to 30 milliseconds.
    #[must_use]
    pub const fn idle_floor(mut self, value: Duration) -> Self {
        self.idle_floor = value;
        self
    }

    /// Longest idle period before an empty loop is torn down. Defaults to 3 seconds.
    #[must_use]
    pub const fn idle_ceiling(mut self, value: Duration) -> Self {
        self.idle_ceiling = value;
        self
    }

    /// Upper bound for how often a loop supervisor checks for idleness. Defaults to 1 second.
    #[must_use]
    pub const fn supervisor_interval(mut self, value: Duration) -> Self {
        self.supervisor_interval = value;
        self
    }

    /// Number of shard loops used by [`Routing::Sharded`].
    ///
    /// Defaults to the number of processors available to the process.
    #[must_use]
    pub const fn shard_count(mut self, value: usize) -> Self {
        self.shard_count = Some(value);
        self
    }

    /// Idle period before an empty shard loop is torn down. Defaults to 1 second.
    #[must_use]
    pub const fn shard_idle_timeout(mut self, value: Duration) -> Self {
        self.shard_idle_timeout = value;
        self
    }

    /// Selects how timers are assigned to loops. Defaults to [`Routing::Granularity`].
    #[must_use]
    pub const fn routing(mut self, value: Routing) -> Self {
        self.routing = value;
        self
    }

    /// Maximum number of threads that run callbacks concurrently. Defaults to `16`.
    #[must_use]
    pub const fn max_callback_threads(mut self, value: usize) -> Self {
        self.max_callback_threads = value;
        self
    }

    /// How long a surplus callback thread stays around without work. Defaults to 10 seconds.
    #[must_use]
    pub const fn callback_idle_timeout(mut self, value: Duration) -> Self {
        self.callback_idle_timeout = value;
        self
    }

    pub(crate) fn resolved_shard_count(&self) -> usize {
        self.shard_count
            .unwrap_or_else(|| SystemHardware::current().processors().len())
            .max(1)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.smoothing_factor) {
            return Err(Error::invalid_config(format!(
                "smoothing factor must be in [0, 1), got {}",
                self.smoothing_factor
            )));
        }

        if !(0.0..=MAX_OVERSHOOT_CORRECTION).contains(&self.overshoot_correction) {
            return Err(Error::invalid_config(format!(
                "overshoot correction must be in [0, {MAX_OVERSHOOT_CORRECTION}], got {}",
                self.overshoot_correction
            )));
        }

        if self.idle_multiplier == 0 {
            return Err(Error::invalid_config("idle multiplier must be at least 1"));
        }

        if self.idle_floor.is_zero() || self.idle_floor > self.idle_ceiling {
            return Err(Error::invalid_config(format!(
                "idle floor {:?} must be non-zero and not exceed the idle ceiling {:?}",
                self.idle_floor, self.idle_ceiling
            )));
        }

        if self.supervisor_interval.is_zero() || self.shard_idle_timeout.is_zero() {
            return Err(Error::invalid_config("supervisor interval and shard idle timeout must be non-zero"));
        }

        if self.shard_count == Some(0) {
            return Err(Error::invalid_config("shard count must be at least 1"));
        }

        if self.max_callback_threads == 0 {
            return Err(Error::invalid_config("at least one callback thread is required"));
        }

        if self.callback_idle_timeout.is_zero() {
            return Err(Error::invalid_config("callback idle timeout must be non-zero"));
        }

        Ok(())
    }

    /// How long a loop of the given granularity may stay empty before it is torn down.
    pub(crate) fn idle_threshold(&self, granularity: Duration) -> Duration {
        granularity
            .saturating_mul(self.idle_multiplier)
            .clamp(self.idle_floor, self.idle_ceiling)
    }

    /// How often the supervisor of a loop with the given idle threshold checks the loop.
    pub(crate) fn supervisor_cadence(&self, idle_threshold: Duration) -> Duration {
        idle_threshold.min(self.supervisor_interval)
    }
}
