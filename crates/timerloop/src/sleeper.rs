// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::RefCell;
use std::thread;
use std::time::{Duration, Instant};

/// The shortest duration ever handed to the blocking sleep primitive.
pub const MIN_SLEEP: Duration = Duration::from_micros(1);

/// Default weight of the history in the smoothed sleep error.
pub(crate) const DEFAULT_SMOOTHING_FACTOR: f64 = 0.118;

/// Default share of the smoothed overshoot subtracted from the next request.
pub(crate) const DEFAULT_OVERSHOOT_CORRECTION: f64 = 1.0;

/// Sleeps for a target duration while compensating for the systematic oversleep of the
/// operating system scheduler.
///
/// Operating system sleep primitives routinely wake up late, and the lateness grows under
/// load. `AdaptiveSleeper` keeps an exponentially weighted moving average of the difference
/// between the actual and requested sleep time, and shortens each subsequent request by the
/// smoothed overshoot so that the observed sleep converges on the target.
///
/// Two factors tune the feedback:
///
/// - the smoothing factor is the weight given to history; the latest sample gets the
///   remainder. `0.0` reacts only to the last sleep.
/// - the overshoot correction scales how much of the smoothed overshoot is subtracted from
///   the next request.
///
/// A request is never shorter than [`MIN_SLEEP`] and never longer than the target.
///
/// # Examples
///
/// ```
/// use std::time::{Duration, Instant};
///
/// use timerloop::AdaptiveSleeper;
///
/// let mut sleeper = AdaptiveSleeper::default();
/// let started = Instant::now();
///
/// for _ in 0..3 {
///     sleeper.sleep(Duration::from_millis(1));
/// }
///
/// assert!(started.elapsed() >= Duration::from_micros(3));
/// ```
#[derive(Debug, Clone)]
pub struct AdaptiveSleeper {
    smoothing_factor: f64,
    overshoot_correction: f64,

    /// Smoothed `actual - requested`, in seconds. Negative when the system undersleeps.
    smoothed_delta: f64,
}

impl Default for AdaptiveSleeper {
    fn default() -> Self {
        Self::new(DEFAULT_SMOOTHING_FACTOR, DEFAULT_OVERSHOOT_CORRECTION)
    }
}

impl AdaptiveSleeper {
    /// Creates a sleeper with the given smoothing factor and overshoot correction.
    ///
    /// The smoothing factor is clamped into `[0, 1)` and the correction is clamped to be
    /// non-negative.
    #[must_use]
    pub fn new(smoothing_factor: f64, overshoot_correction: f64) -> Self {
        Self {
            smoothing_factor: smoothing_factor.clamp(0.0, 0.999),
            overshoot_correction: overshoot_correction.max(0.0),
            smoothed_delta: 0.0,
        }
    }

    /// The smoothed amount by which recent sleeps overshot their request.
    ///
    /// Returns zero when the system has been waking up on time or early.
    #[must_use]
    pub fn smoothed_overshoot(&self) -> Duration {
        Duration::try_from_secs_f64(self.smoothed_delta).unwrap_or(Duration::ZERO)
    }

    /// Computes the duration to hand to the blocking primitive in order to sleep for `target`.
    #[must_use]
    pub fn adjusted_request(&self, target: Duration) -> Duration {
        let correction = self.smoothed_delta.max(0.0) * self.overshoot_correction;
        let corrected = Duration::try_from_secs_f64(target.as_secs_f64() - correction).unwrap_or(Duration::ZERO);

        corrected.min(target).max(MIN_SLEEP)
    }

    /// Folds one observation of a sleep into the smoothed error.
    pub fn record(&mut self, requested: Duration, actual: Duration) {
        let sample = actual.as_secs_f64() - requested.as_secs_f64();
        self.smoothed_delta = self.smoothing_factor.mul_add(self.smoothed_delta, (1.0 - self.smoothing_factor) * sample);
    }

    /// Blocks the current thread for approximately `target`.
    ///
    /// Returns the time actually spent sleeping.
    #[cfg_attr(test, mutants::skip)] // Timing dependent.
    pub fn sleep(&mut self, target: Duration) -> Duration {
        self.sleep_with(target, thread::sleep)
    }

    /// Like [`AdaptiveSleeper::sleep`], but blocks through the provided primitive.
    ///
    /// The primitive receives the corrected request and must block for at least that long.
    pub fn sleep_with(&mut self, target: Duration, block: impl FnOnce(Duration)) -> Duration {
        let request = self.adjusted_request(target);
        let started = Instant::now();
        block(request);
        let actual = started.elapsed();
        self.record(request, actual);

        actual
    }

    /// The part of `period` that is left after `elapsed` time was already spent.
    ///
    /// A worker that fell behind its period sleeps only for what remains, and not at all
    /// once the period is exhausted.
    #[must_use]
    pub fn remaining(period: Duration, elapsed: Duration) -> Duration {
        period.saturating_sub(elapsed)
    }
}

thread_local! {
    static THREAD_SLEEPER: RefCell<AdaptiveSleeper> = RefCell::new(AdaptiveSleeper::default());
}

/// Blocks the current thread for at least `duration`.
///
/// The call bypasses the scheduling loops. Each thread keeps its own [`AdaptiveSleeper`] so
/// repeated calls converge on the requested duration, and a final top-up guarantees the call
/// never returns early. Durations below [`MIN_SLEEP`] are clamped up to it.
///
/// # Examples
///
/// ```
/// use std::time::{Duration, Instant};
///
/// let started = Instant::now();
/// timerloop::sleep(Duration::from_millis(2));
/// assert!(started.elapsed() >= Duration::from_millis(2));
/// ```
#[cfg_attr(test, mutants::skip)] // Timing dependent.
pub fn sleep(duration: Duration) {
    let duration = duration.max(MIN_SLEEP);
    let started = Instant::now();

    let Some(deadline) = started.checked_add(duration) else {
        thread::sleep(duration);
        return;
    };

    loop {
        let left = AdaptiveSleeper::remaining(duration, started.elapsed());
        if left.is_zero() {
            return;
        }

        THREAD_SLEEPER.with_borrow_mut(|sleeper| sleeper.sleep(left));

        if Instant::now() >= deadline {
            return;
        }
    }
}
