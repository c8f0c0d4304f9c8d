// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::{Arc, LazyLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::{Config, Routing};
use crate::dispatcher::Dispatcher;
use crate::event::ScheduledEvent;
use crate::scheduling_loop::{LoopState, LoopStopped, SchedulingLoop};
use crate::sleeper::AdaptiveSleeper;
use crate::stats::Counters;
use crate::{FuncTicker, FuncTimer, Result, Ticker, Timer, mono, ticker, timer};

/// Shard loops are keyed by the fire time expressed in microseconds.
const SHARD_KEY_UNIT_NANOS: i64 = 1_000;

/// Order-of-magnitude classes of timer periods.
///
/// With [`Routing::Granularity`] every class has its own scheduling loop, so a loop only
/// ever sleeps for durations of a similar magnitude.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use timerloop::Granularity;
///
/// assert_eq!(Granularity::for_period(Duration::from_millis(250)), Granularity::HundredMillis);
/// assert_eq!(Granularity::for_period(Duration::ZERO), Granularity::Second);
/// assert_eq!(Granularity::for_period(Duration::from_nanos(500)), Granularity::Microsecond);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Granularity {
    /// Periods of one second or longer, and zero.
    Second,
    /// Periods from 100 milliseconds up to one second.
    HundredMillis,
    /// Periods from 10 milliseconds up to 100 milliseconds.
    TenMillis,
    /// Periods from 1 millisecond up to 10 milliseconds.
    Millisecond,
    /// Periods from 100 microseconds up to 1 millisecond.
    HundredMicros,
    /// Periods from 10 microseconds up to 100 microseconds.
    TenMicros,
    /// Periods shorter than 10 microseconds.
    Microsecond,
}

impl Granularity {
    /// Every granularity, coarsest first.
    pub const ALL: [Self; 7] = [
        Self::Second,
        Self::HundredMillis,
        Self::TenMillis,
        Self::Millisecond,
        Self::HundredMicros,
        Self::TenMicros,
        Self::Microsecond,
    ];

    /// Classifies a period.
    #[must_use]
    pub fn for_period(period: Duration) -> Self {
        if period.is_zero() {
            return Self::Second;
        }

        Self::ALL
            .into_iter()
            .find(|granularity| period >= granularity.duration())
            .unwrap_or(Self::Microsecond)
    }

    /// The lower bound of the periods in this class.
    #[must_use]
    pub const fn duration(self) -> Duration {
        match self {
            Self::Second => Duration::from_secs(1),
            Self::HundredMillis => Duration::from_millis(100),
            Self::TenMillis => Duration::from_millis(10),
            Self::Millisecond => Duration::from_millis(1),
            Self::HundredMicros => Duration::from_micros(100),
            Self::TenMicros => Duration::from_micros(10),
            Self::Microsecond => Duration::from_micros(1),
        }
    }

    const fn index(self) -> usize {
        self as usize
    }

    const fn label(self) -> &'static str {
        match self {
            Self::Second => "1s",
            Self::HundredMillis => "100ms",
            Self::TenMillis => "10ms",
            Self::Millisecond => "1ms",
            Self::HundredMicros => "100us",
            Self::TenMicros => "10us",
            Self::Microsecond => "1us",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum SlotId {
    Bucket(usize),
    Shard(usize),
}

/// Holds the live loop of one granularity or shard, if any.
///
/// The slot lock is held while a loop is created, and while the supervisor decides to tear
/// the loop down, so a registration either reaches a loop that stays alive until the event
/// is queued or finds the slot empty and creates a fresh loop.
#[derive(Debug)]
struct LoopSlot {
    label: String,
    idle_threshold: Duration,
    cadence: Duration,
    current: Mutex<Option<Arc<SchedulingLoop>>>,
}

impl LoopSlot {
    fn new(label: String, idle_threshold: Duration, cadence: Duration) -> Self {
        Self {
            label,
            idle_threshold,
            cadence,
            current: Mutex::new(None),
        }
    }

    fn live(&self) -> Option<Arc<SchedulingLoop>> {
        self.current
            .lock()
            .as_ref()
            .filter(|looper| looper.state() != LoopState::Stopped)
            .map(Arc::clone)
    }
}

struct RegistryInner {
    routing: Routing,
    sleeper: AdaptiveSleeper,
    buckets: Vec<LoopSlot>,
    shards: Vec<LoopSlot>,
    dispatcher: Dispatcher,
    counters: Arc<Counters>,
}

impl RegistryInner {
    fn slot(&self, id: SlotId) -> &LoopSlot {
        match id {
            SlotId::Bucket(index) => &self.buckets[index],
            SlotId::Shard(index) => &self.shards[index],
        }
    }

    fn slots(&self) -> impl Iterator<Item = &LoopSlot> {
        self.buckets.iter().chain(&self.shards)
    }

    fn stop_all(&self) -> usize {
        let mut stopped = 0;
        for slot in self.slots() {
            let looper = slot.current.lock().take();
            if let Some(looper) = looper {
                looper.stop();
                stopped += 1;
            }
        }

        stopped
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        let _ = self.stop_all();
    }
}

/// Owns the scheduling loops timers are multiplexed onto.
///
/// A registry has one lazily created loop per [`Granularity`] and, for
/// [`Routing::Sharded`], a fixed number of lazily created shard loops selected by fire time.
/// Each live loop has a supervisor that stops it once its queue has been empty for
/// `clamp(granularity × idle multiplier, idle floor, idle ceiling)`, or the shard idle
/// timeout for shard loops. The next timer routed to a stopped loop transparently starts a
/// fresh one.
///
/// Callbacks run on an elastic thread pool shared by all loops of the registry. A panicking
/// callback is logged, counted in [`LoopRegistry::callback_faults`] and otherwise ignored.
///
/// `LoopRegistry` is cheap to clone; clones share the same loops. The free functions of
/// this crate use [`LoopRegistry::global`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use timerloop::LoopRegistry;
///
/// let registry = LoopRegistry::new();
/// let timer = registry.new_timer(Duration::from_millis(5))?;
///
/// timer.receiver().recv().unwrap();
/// assert_eq!(registry.live_loops(), 1);
/// # Ok::<(), timerloop::Error>(())
/// ```
#[derive(Clone)]
pub struct LoopRegistry {
    inner: Arc<RegistryInner>,
}

static GLOBAL: LazyLock<LoopRegistry> = LazyLock::new(LoopRegistry::new);

impl Default for LoopRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopRegistry {
    /// Creates a registry with the default [`Config`].
    #[must_use]
    pub fn new() -> Self {
        Self::build(&Config::default())
    }

    /// Creates a registry with a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidConfig`][crate::ErrorKind::InvalidConfig] if a setting
    /// is out of range.
    pub fn with_config(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(&config))
    }

    /// The process-wide registry behind the free functions of this crate.
    #[must_use]
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    fn build(config: &Config) -> Self {
        let counters = Arc::new(Counters::default());
        let dispatcher = Dispatcher::new(
            config.max_callback_threads,
            config.callback_idle_timeout,
            Arc::clone(&counters),
        );

        let buckets = Granularity::ALL
            .into_iter()
            .map(|granularity| {
                let idle = config.idle_threshold(granularity.duration());
                LoopSlot::new(granularity.label().to_owned(), idle, config.supervisor_cadence(idle))
            })
            .collect();

        let shards = (0..config.resolved_shard_count())
            .map(|index| {
                let idle = config.shard_idle_timeout;
                LoopSlot::new(format!("shard-{index}"), idle, config.supervisor_cadence(idle))
            })
            .collect();

        Self {
            inner: Arc::new(RegistryInner {
                routing: config.routing,
                sleeper: AdaptiveSleeper::new(config.smoothing_factor, config.overshoot_correction),
                buckets,
                shards,
                dispatcher,
                counters,
            }),
        }
    }

    /// Creates a one-shot [`Timer`] that signals its receiver after `delay`.
    ///
    /// # Errors
    ///
    /// Returns an error if `delay` is below [`MIN_RESOLUTION`][crate::MIN_RESOLUTION].
    pub fn new_timer(&self, delay: Duration) -> Result<Timer> {
        Timer::new(self, delay)
    }

    /// Creates a [`Ticker`] that signals its receiver every `period`.
    ///
    /// # Errors
    ///
    /// Returns an error if `period` is below [`MIN_RESOLUTION`][crate::MIN_RESOLUTION].
    pub fn new_ticker(&self, period: Duration) -> Result<Ticker> {
        Ticker::new(self, period)
    }

    /// Runs `callback` once after `delay`.
    ///
    /// # Errors
    ///
    /// Returns an error if `delay` is below [`MIN_RESOLUTION`][crate::MIN_RESOLUTION].
    pub fn after_func<F>(&self, delay: Duration, callback: F) -> Result<FuncTimer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        FuncTimer::new(self, delay, Arc::new(callback))
    }

    /// Runs `callback` every `period`.
    ///
    /// # Errors
    ///
    /// Returns an error if `period` is below [`MIN_RESOLUTION`][crate::MIN_RESOLUTION].
    pub fn new_func_ticker<F>(&self, period: Duration, callback: F) -> Result<FuncTicker>
    where
        F: Fn() + Send + Sync + 'static,
    {
        FuncTicker::new(self, period, Arc::new(callback))
    }

    /// Returns a receiver that gets one instant after `delay`.
    ///
    /// # Errors
    ///
    /// Returns an error if `delay` is below [`MIN_RESOLUTION`][crate::MIN_RESOLUTION].
    pub fn after(&self, delay: Duration) -> Result<flume::Receiver<Instant>> {
        timer::after(self, delay)
    }

    /// Returns a receiver that gets an instant every `period`, or `None` if `period` is
    /// below [`MIN_RESOLUTION`][crate::MIN_RESOLUTION].
    ///
    /// The ticker stops once the receiver is dropped.
    #[must_use]
    pub fn tick(&self, period: Duration) -> Option<flume::Receiver<Instant>> {
        ticker::tick(self, period)
    }

    /// Number of scheduling loops currently running.
    #[must_use]
    pub fn live_loops(&self) -> usize {
        self.inner.slots().filter(|slot| slot.live().is_some()).count()
    }

    /// Number of threads currently serving callbacks.
    #[must_use]
    pub fn callback_threads(&self) -> usize {
        self.inner.dispatcher.thread_count()
    }

    /// Number of events queued across all live loops.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.inner.slots().filter_map(LoopSlot::live).map(|looper| looper.len()).sum()
    }

    /// Number of callback invocations that panicked.
    #[must_use]
    pub fn callback_faults(&self) -> u64 {
        self.inner.counters.callback_faults()
    }

    /// Number of periodic callback invocations skipped because the previous one was still running.
    #[must_use]
    pub fn skipped_callbacks(&self) -> u64 {
        self.inner.counters.skipped_callbacks()
    }

    /// Number of signals dropped because the receiver had not consumed the previous one.
    #[must_use]
    pub fn dropped_signals(&self) -> u64 {
        self.inner.counters.dropped_signals()
    }

    /// Number of scheduling loops started so far.
    #[must_use]
    pub fn loops_created(&self) -> u64 {
        self.inner.counters.loops_created()
    }

    /// Number of scheduling loops torn down after idling.
    #[must_use]
    pub fn loops_retired(&self) -> u64 {
        self.inner.counters.loops_retired()
    }

    /// Stops every live loop. Timers still queued in them are dropped without firing.
    ///
    /// The registry stays usable; later registrations start fresh loops.
    pub fn shutdown(&self) {
        let stopped = self.inner.stop_all();
        tracing::debug!(stopped, "timer loop registry shut down");
    }

    /// Queues `event` to fire at `when` on the loop chosen by the routing policy.
    ///
    /// `period_hint` is the period of periodic events and the delay of one-shot events.
    pub(crate) fn register(&self, period_hint: Duration, when: i64, event: &Arc<ScheduledEvent>) {
        loop {
            let looper = match self.inner.routing {
                Routing::Sharded => self.select_shard(when),
                Routing::Granularity => self.select(period_hint),
            };

            match looper.register(when, event) {
                Ok(_) => return,
                // Torn down between selection and registration.
                Err(LoopStopped) => {}
            }
        }
    }

    /// Returns the live loop for the granularity of `period`, starting one if needed.
    pub(crate) fn select(&self, period: Duration) -> Arc<SchedulingLoop> {
        self.live_or_start(SlotId::Bucket(Granularity::for_period(period).index()))
    }

    /// Returns the live shard loop for a fire time, starting one if needed.
    pub(crate) fn select_shard(&self, when: i64) -> Arc<SchedulingLoop> {
        let shards = i64::try_from(self.inner.shards.len()).unwrap_or(i64::MAX);
        let index = (when / SHARD_KEY_UNIT_NANOS).rem_euclid(shards);
        self.live_or_start(SlotId::Shard(usize::try_from(index).unwrap_or_default()))
    }

    fn live_or_start(&self, id: SlotId) -> Arc<SchedulingLoop> {
        let slot = self.inner.slot(id);
        let mut current = slot.current.lock();

        if let Some(looper) = current.as_ref()
            && looper.state() != LoopState::Stopped
        {
            return Arc::clone(looper);
        }

        let looper = SchedulingLoop::new(
            slot.label.clone(),
            slot.idle_threshold,
            self.inner.sleeper.clone(),
            self.inner.dispatcher.clone(),
            Arc::clone(&self.inner.counters),
        );
        looper.start();
        self.spawn_supervisor(id, Arc::clone(&looper));

        *current = Some(Arc::clone(&looper));
        self.inner.counters.record_loop_created();

        looper
    }

    fn spawn_supervisor(&self, id: SlotId, looper: Arc<SchedulingLoop>) {
        let registry = Arc::downgrade(&self.inner);
        let cadence = self.inner.slot(id).cadence;

        let _ = thread::Builder::new()
            .name(format!("timerloop-{}-supervisor", looper.label()))
            .spawn(move || supervise(&registry, id, &looper, cadence))
            .expect("failed to spawn timer loop supervisor thread");
    }
}

/// Checks a loop every `cadence` and retires it once it has been idle long enough.
#[cfg_attr(test, mutants::skip)] // Timing dependent.
fn supervise(registry: &Weak<RegistryInner>, id: SlotId, looper: &Arc<SchedulingLoop>, cadence: Duration) {
    while !looper.wait_for_stop(cadence) {
        let Some(inner) = registry.upgrade() else {
            looper.stop();
            return;
        };

        let mut current = inner.slot(id).current.lock();
        if looper.stop_if_idle(mono::now()) {
            if current.as_ref().is_some_and(|live| Arc::ptr_eq(live, looper)) {
                *current = None;
            }
            inner.counters.record_loop_retired();
            return;
        }
    }
}

impl fmt::Debug for LoopRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopRegistry")
            .field("routing", &self.inner.routing)
            .field("live_loops", &self.live_loops())
            .field("shards", &self.inner.shards.len())
            .field("dispatcher", &self.inner.dispatcher)
            .finish_non_exhaustive()
    }
}
