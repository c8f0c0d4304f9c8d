// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::dispatcher::Dispatcher;
use crate::event::{FireOutcome, ScheduledEvent};
use crate::mono;
use crate::queue::{EntryKey, OrderedQueue};
use crate::sleeper::AdaptiveSleeper;
use crate::stats::Counters;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopState {
    Created,
    Running,
    Stopped,
}

/// The loop was stopped before the registration could land; the caller must pick a new loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LoopStopped;

struct LoopCore {
    queue: OrderedQueue<Arc<ScheduledEvent>>,
    state: LoopState,

    /// Set when a registration moved the nearest deadline forward; cleared by the worker
    /// before it goes to sleep.
    notified: bool,

    /// Set while due events are being delivered outside the lock.
    firing: bool,

    /// The later of the farthest deadline inserted and the last time the queue was in use.
    last_activity: i64,
}

/// Owns one ordered queue of pending events and the single worker that fires them.
///
/// The worker sleeps until the nearest deadline, correcting each sleep with an
/// [`AdaptiveSleeper`], and is woken early when a registration moves the nearest deadline
/// forward. Due events are extracted under the lock and delivered without it. Periodic
/// events are reinserted one period after their previous fire time, skipping any periods
/// the loop fell behind on.
///
/// A loop moves from `Created` to `Running` to `Stopped` and is never restarted.
pub(crate) struct SchedulingLoop {
    me: Weak<Self>,
    label: String,
    idle_threshold: Duration,
    sleeper: AdaptiveSleeper,
    core: Mutex<LoopCore>,
    wake: Condvar,
    stopped: Condvar,
    dispatcher: Dispatcher,
    counters: Arc<Counters>,
}

impl SchedulingLoop {
    pub(crate) fn new(
        label: String,
        idle_threshold: Duration,
        sleeper: AdaptiveSleeper,
        dispatcher: Dispatcher,
        counters: Arc<Counters>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            label,
            idle_threshold,
            sleeper,
            core: Mutex::new(LoopCore {
                queue: OrderedQueue::new(),
                state: LoopState::Created,
                notified: false,
                firing: false,
                last_activity: mono::now(),
            }),
            wake: Condvar::new(),
            stopped: Condvar::new(),
            dispatcher,
            counters,
        })
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    #[cfg(test)]
    pub(crate) fn idle_threshold(&self) -> Duration {
        self.idle_threshold
    }

    pub(crate) fn state(&self) -> LoopState {
        self.core.lock().state
    }

    /// Number of events waiting in the queue.
    pub(crate) fn len(&self) -> usize {
        self.core.lock().queue.len()
    }

    /// Spawns the worker thread. Has no effect unless the loop is freshly created.
    pub(crate) fn start(self: &Arc<Self>) {
        {
            let mut core = self.core.lock();
            if core.state != LoopState::Created {
                return;
            }
            core.state = LoopState::Running;
        }

        let this = Arc::clone(self);
        let _ = thread::Builder::new()
            .name(format!("timerloop-{}", self.label))
            .spawn(move || this.run())
            .expect("failed to spawn timer scheduling loop thread");
    }

    /// Queues `event` to fire at `when`.
    ///
    /// Fails if the loop has already stopped, in which case the event is untouched.
    pub(crate) fn register(&self, when: i64, event: &Arc<ScheduledEvent>) -> Result<EntryKey, LoopStopped> {
        let mut core = self.core.lock();
        if core.state == LoopState::Stopped {
            return Err(LoopStopped);
        }

        let nearest = core.queue.peek_min().is_none_or(|(key, _)| when < key.when());
        let key = core.queue.insert(when, Arc::clone(event));
        event.set_placement(self.me.clone(), key);
        if let Some((farthest, _)) = core.queue.last() {
            core.last_activity = core.last_activity.max(farthest.when()).max(mono::now());
        }

        if nearest && !core.notified {
            core.notified = true;
            self.wake.notify_one();
        }

        Ok(key)
    }

    /// Removes a queued entry. A missing entry is ignored.
    pub(crate) fn unregister(&self, key: EntryKey) {
        let mut core = self.core.lock();
        let removed = core.queue.remove(key);
        if removed.is_some() && core.queue.is_empty() {
            // A cancelled far deadline must not keep the loop alive.
            core.last_activity = mono::now();
        }

        // Events may own client handles; they must not be dropped under the lock.
        drop(core);
        drop(removed);
    }

    /// Stops the loop and drops every queued event.
    pub(crate) fn stop(&self) {
        let mut core = self.core.lock();
        if core.state == LoopState::Stopped {
            return;
        }

        core.state = LoopState::Stopped;
        let dropped = core.queue.drain();
        self.wake.notify_all();
        self.stopped.notify_all();
        drop(core);

        for (_, event) in dropped {
            event.clear_placement();
        }
    }

    /// Stops the loop if its queue has been empty for at least the idle threshold.
    ///
    /// Returns `true` if the loop is stopped when the call returns.
    pub(crate) fn stop_if_idle(&self, now: i64) -> bool {
        let mut core = self.core.lock();
        match core.state {
            LoopState::Stopped => return true,
            LoopState::Created => return false,
            LoopState::Running => {}
        }

        if core.firing || !core.queue.is_empty() {
            return false;
        }

        let idle = mono::to_duration(now.saturating_sub(core.last_activity));
        if idle < self.idle_threshold {
            return false;
        }

        core.state = LoopState::Stopped;
        self.wake.notify_all();
        self.stopped.notify_all();
        tracing::debug!(scheduling_loop = %self.label, ?idle, "scheduling loop stopped after idling");

        true
    }

    /// Blocks until the loop stops or `cadence` elapses. Returns `true` if the loop is stopped.
    pub(crate) fn wait_for_stop(&self, cadence: Duration) -> bool {
        let mut core = self.core.lock();
        if core.state != LoopState::Stopped {
            let _ = self.stopped.wait_for(&mut core, cadence);
        }

        core.state == LoopState::Stopped
    }

    #[cfg_attr(test, mutants::skip)] // Timing dependent.
    fn run(self: Arc<Self>) {
        tracing::debug!(scheduling_loop = %self.label, "scheduling loop started");

        let mut sleeper = self.sleeper.clone();
        let mut core = self.core.lock();

        while core.state != LoopState::Stopped {
            let Some((next, _)) = core.queue.peek_min() else {
                core.notified = false;
                self.wake.wait(&mut core);
                continue;
            };

            let now = mono::now();
            if next.when() > now {
                self.sleep_until_due(&mut core, &mut sleeper, mono::to_duration(next.when() - now));
                continue;
            }

            self.fire_due(&mut core, now);
        }

        drop(core);
        tracing::debug!(scheduling_loop = %self.label, "scheduling loop exited");
    }

    /// Sleeps up to `delta`, returning early if a nearer deadline was registered or the loop
    /// was stopped.
    fn sleep_until_due(&self, core: &mut MutexGuard<'_, LoopCore>, sleeper: &mut AdaptiveSleeper, delta: Duration) {
        let request = sleeper.adjusted_request(delta);
        let started = Instant::now();
        core.notified = false;

        let Some(deadline) = started.checked_add(request) else {
            self.wake.wait(core);
            return;
        };

        while !core.notified && core.state != LoopState::Stopped {
            if self.wake.wait_until(core, deadline).timed_out() {
                sleeper.record(request, started.elapsed());
                return;
            }
        }
    }

    fn fire_due(&self, core: &mut MutexGuard<'_, LoopCore>, now: i64) {
        let due = core.queue.extract_due(now);
        core.firing = true;

        let survivors = MutexGuard::unlocked(core, || {
            let fired_at = Instant::now();
            due.into_iter()
                .filter_map(|(key, event)| match event.fire(fired_at, &self.dispatcher, &self.counters) {
                    FireOutcome::Fired | FireOutcome::Skipped => event.is_periodic().then_some((key.when(), event)),
                    FireOutcome::Inactive | FireOutcome::Disconnected => None,
                })
                .collect::<Vec<_>>()
        });

        core.firing = false;
        let now = mono::now();
        core.last_activity = core.last_activity.max(now);

        let mut released = Vec::new();
        for (previous, event) in survivors {
            if core.state == LoopState::Stopped || !event.is_pending() {
                released.push(event);
                continue;
            }

            let key = core.queue.insert(next_fire(previous, event.period(), now), Arc::clone(&event));
            event.set_placement(self.me.clone(), key);

            // A cancellation that raced with the placement update could not see the new key.
            if !event.is_pending() {
                let _ = core.queue.remove(key);
                event.clear_placement();
                released.push(event);
            }
        }

        // Events may own client handles; they must not be dropped under the lock.
        if !released.is_empty() {
            MutexGuard::unlocked(core, || drop(released));
        }
    }
}

impl fmt::Debug for SchedulingLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulingLoop")
            .field("label", &self.label)
            .field("idle_threshold", &self.idle_threshold)
            .finish_non_exhaustive()
    }
}

/// The first fire time after `now` that is a whole number of periods after `previous`.
///
/// A loop that fell behind delivers one overdue fire and then resumes on the original phase
/// instead of firing once for every missed period.
pub(crate) fn next_fire(previous: i64, period: i64, now: i64) -> i64 {
    let next = previous.saturating_add(period);
    if next > now || period <= 0 {
        return next;
    }

    let missed = now.saturating_sub(previous) / period;
    previous.saturating_add(period.saturating_mul(missed.saturating_add(1)))
}
