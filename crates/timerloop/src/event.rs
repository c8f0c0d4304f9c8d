// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::dispatcher::Dispatcher;
use crate::queue::EntryKey;
use crate::scheduling_loop::SchedulingLoop;
use crate::stats::Counters;
use crate::{Error, Result};

/// The shortest interval accepted by the timer registration APIs.
pub const MIN_RESOLUTION: Duration = Duration::from_micros(1);

/// Rejects intervals below [`MIN_RESOLUTION`].
pub(crate) fn validate(operation: &'static str, duration: Duration) -> Result<Duration> {
    if duration < MIN_RESOLUTION {
        return Err(Error::invalid_argument(operation, duration));
    }

    Ok(duration)
}

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

pub(crate) type Callback = Arc<dyn Fn() + Send + Sync + 'static>;

enum Action {
    /// Drop-if-full send of the fire instant.
    Signal(flume::Sender<Instant>),
    Callback(Mutex<Callback>),
}

#[derive(Debug, Default)]
struct Gate {
    callback_running: bool,
}

/// Where a registered event currently sits.
#[derive(Debug)]
pub(crate) struct Placement {
    pub(crate) looper: Weak<SchedulingLoop>,
    pub(crate) key: EntryKey,
}

/// What happened when a loop tried to fire an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FireOutcome {
    Fired,

    /// The previous callback invocation was still running.
    Skipped,

    /// The event was cancelled or had already fired.
    Inactive,

    /// Nobody listens on the signal channel anymore; the event is now cancelled.
    Disconnected,
}

/// One pending one-shot or periodic timer.
///
/// The event is shared between its client handle and at most one scheduling loop. Its
/// lifecycle is a single atomic state: `Pending` may move to `Cancelled` (through
/// [`ScheduledEvent::cancel`]) or, for one-shot events, to `Fired`. Both transitions happen
/// under the firing gate, so once `cancel` returns nothing is delivered anymore.
pub(crate) struct ScheduledEvent {
    /// Nanoseconds between fires; zero for one-shot events.
    period: i64,
    state: AtomicU8,
    action: Action,
    gate: Mutex<Gate>,
    drained: Condvar,
    placement: Mutex<Option<Placement>>,
}

impl ScheduledEvent {
    pub(crate) fn with_signal(period: i64, sender: flume::Sender<Instant>) -> Arc<Self> {
        Arc::new(Self::new(period, Action::Signal(sender)))
    }

    pub(crate) fn with_callback(period: i64, callback: Callback) -> Arc<Self> {
        Arc::new(Self::new(period, Action::Callback(Mutex::new(callback))))
    }

    fn new(period: i64, action: Action) -> Self {
        Self {
            period: period.max(0),
            state: AtomicU8::new(PENDING),
            action,
            gate: Mutex::new(Gate::default()),
            drained: Condvar::new(),
            placement: Mutex::new(None),
        }
    }

    pub(crate) fn period(&self) -> i64 {
        self.period
    }

    pub(crate) fn is_periodic(&self) -> bool {
        self.period > 0
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }

    /// Moves a pending event to `Cancelled`.
    ///
    /// Returns `false` if the event had already fired or was already cancelled.
    pub(crate) fn cancel(&self) -> bool {
        let _gate = self.gate.lock();
        self.state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Records the queue entry that currently holds this event.
    pub(crate) fn set_placement(&self, looper: Weak<SchedulingLoop>, key: EntryKey) {
        *self.placement.lock() = Some(Placement { looper, key });
    }

    pub(crate) fn clear_placement(&self) {
        *self.placement.lock() = None;
    }

    /// Removes the event from the queue that holds it, if any.
    pub(crate) fn remove_from_loop(&self) {
        let placement = self.placement.lock().take();

        if let Some(placement) = placement
            && let Some(looper) = placement.looper.upgrade()
        {
            looper.unregister(placement.key);
        }
    }

    /// Replaces the callback used by future fires.
    ///
    /// Has no effect on signal events.
    pub(crate) fn replace_callback(&self, callback: Callback) {
        if let Action::Callback(current) = &self.action {
            *current.lock() = callback;
        }
    }

    /// Delivers the event.
    ///
    /// Signals are sent inline and never block. Callbacks are handed to the dispatcher, and
    /// skipped if the previous invocation of this event has not finished yet.
    pub(crate) fn fire(self: &Arc<Self>, fired_at: Instant, dispatcher: &Dispatcher, counters: &Counters) -> FireOutcome {
        let mut gate = self.gate.lock();

        let active = if self.is_periodic() {
            self.is_pending()
        } else {
            self.state
                .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        };

        if !active {
            return FireOutcome::Inactive;
        }

        match &self.action {
            Action::Signal(sender) => match sender.try_send(fired_at) {
                Ok(()) => FireOutcome::Fired,
                Err(flume::TrySendError::Full(_)) => {
                    counters.record_dropped_signal();
                    tracing::trace!("timer signal dropped, receiver has not consumed the previous one");
                    FireOutcome::Fired
                }
                Err(flume::TrySendError::Disconnected(_)) => {
                    self.state.store(CANCELLED, Ordering::Release);
                    FireOutcome::Disconnected
                }
            },
            Action::Callback(callback) => {
                if gate.callback_running {
                    counters.record_skipped_callback();
                    tracing::trace!("timer callback skipped, previous invocation still running");
                    return FireOutcome::Skipped;
                }

                gate.callback_running = true;
                drop(gate);

                let callback = Arc::clone(&callback.lock());
                let running = RunningGuard(Arc::clone(self));
                dispatcher.dispatch(move || {
                    // The job may wait behind other callbacks; a stop that landed meanwhile wins.
                    if running.0.may_start() {
                        callback();
                    }
                });

                FireOutcome::Fired
            }
        }
    }

    /// Blocks until no callback invocation of this event is in flight, for at most `timeout`.
    ///
    /// Returns `false` if an invocation was still running when the timeout elapsed.
    pub(crate) fn wait_drained(&self, timeout: Duration) -> bool {
        let mut gate = self.gate.lock();
        if !gate.callback_running {
            return true;
        }

        let Some(deadline) = Instant::now().checked_add(timeout) else {
            while gate.callback_running {
                self.drained.wait(&mut gate);
            }
            return true;
        };

        while gate.callback_running {
            if self.drained.wait_until(&mut gate, deadline).timed_out() {
                return !gate.callback_running;
            }
        }

        true
    }

    /// Whether a dispatched invocation may begin.
    ///
    /// Checked under the gate, so an invocation either starts before `cancel` returns or not at
    /// all. One-shot events are already `Fired` here and cannot be cancelled anymore.
    fn may_start(&self) -> bool {
        let _gate = self.gate.lock();
        self.state.load(Ordering::Acquire) != CANCELLED
    }

    fn finish_callback(&self) {
        self.gate.lock().callback_running = false;
        self.drained.notify_all();
    }
}

impl fmt::Debug for ScheduledEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(Ordering::Relaxed) {
            PENDING => "pending",
            FIRED => "fired",
            _ => "cancelled",
        };
        let kind = match self.action {
            Action::Signal(_) => "signal",
            Action::Callback(_) => "callback",
        };

        f.debug_struct("ScheduledEvent")
            .field("period", &self.period)
            .field("state", &state)
            .field("kind", &kind)
            .finish_non_exhaustive()
    }
}

/// Clears the running flag when a callback invocation ends, including by unwinding.
struct RunningGuard(Arc<ScheduledEvent>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.finish_callback();
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::thread;

    use super::*;

    fn pool() -> (Dispatcher, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        (Dispatcher::new(2, Duration::from_secs(1), Arc::clone(&counters)), counters)
    }

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(ScheduledEvent: Send, Sync, fmt::Debug);
    }

    #[test]
    fn validate_rejects_sub_resolution() {
        assert!(validate("test", Duration::ZERO).unwrap_err().is_invalid_argument());
        assert!(validate("test", Duration::from_nanos(999)).is_err());
        assert_eq!(validate("test", MIN_RESOLUTION).unwrap(), MIN_RESOLUTION);
    }

    #[test]
    fn one_shot_fires_once() {
        let (dispatcher, counters) = pool();
        let (sender, receiver) = flume::bounded(1);
        let event = ScheduledEvent::with_signal(0, sender);

        assert_eq!(event.fire(Instant::now(), &dispatcher, &counters), FireOutcome::Fired);
        assert_eq!(event.fire(Instant::now(), &dispatcher, &counters), FireOutcome::Inactive);
        assert_eq!(receiver.len(), 1);
        assert!(!event.cancel());
    }

    #[test]
    fn cancel_is_idempotent_and_prevents_fire() {
        let (dispatcher, counters) = pool();
        let (sender, receiver) = flume::bounded(1);
        let event = ScheduledEvent::with_signal(10, sender);

        assert!(event.cancel());
        assert!(!event.cancel());
        assert_eq!(event.fire(Instant::now(), &dispatcher, &counters), FireOutcome::Inactive);
        assert!(receiver.is_empty());
    }

    #[test]
    fn full_channel_drops_signal() {
        let (dispatcher, counters) = pool();
        let (sender, receiver) = flume::bounded(1);
        let event = ScheduledEvent::with_signal(10, sender);

        assert_eq!(event.fire(Instant::now(), &dispatcher, &counters), FireOutcome::Fired);
        assert_eq!(event.fire(Instant::now(), &dispatcher, &counters), FireOutcome::Fired);

        assert_eq!(receiver.len(), 1);
        assert_eq!(counters.dropped_signals(), 1);
        assert!(event.is_pending());
    }

    #[test]
    fn disconnected_receiver_cancels() {
        let (dispatcher, counters) = pool();
        let (sender, receiver) = flume::bounded(1);
        let event = ScheduledEvent::with_signal(10, sender);
        drop(receiver);

        assert_eq!(event.fire(Instant::now(), &dispatcher, &counters), FireOutcome::Disconnected);
        assert!(!event.is_pending());
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn overlapping_callback_is_skipped() {
        let (dispatcher, counters) = pool();
        let (release_tx, release_rx) = flume::bounded::<()>(0);
        let runs = Arc::new(AtomicU32::new(0));

        let callback_runs = Arc::clone(&runs);
        let event = ScheduledEvent::with_callback(
            10,
            Arc::new(move || {
                let _ = callback_runs.fetch_add(1, Ordering::Relaxed);
                let _ = release_rx.recv();
            }),
        );

        assert_eq!(event.fire(Instant::now(), &dispatcher, &counters), FireOutcome::Fired);
        assert_eq!(event.fire(Instant::now(), &dispatcher, &counters), FireOutcome::Skipped);
        assert!(!event.wait_drained(Duration::from_millis(10)));

        release_tx.send(()).unwrap();
        assert!(event.wait_drained(Duration::from_secs(5)));
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        assert_eq!(counters.skipped_callbacks(), 1);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn cancel_prevents_queued_invocation() {
        let counters = Arc::new(Counters::default());
        let dispatcher = Dispatcher::new(1, Duration::from_secs(1), Arc::clone(&counters));
        let (started_tx, started_rx) = flume::bounded(1);
        let (release_tx, release_rx) = flume::bounded::<()>(1);
        let runs = Arc::new(AtomicU32::new(0));

        // Occupy the only callback thread.
        dispatcher.dispatch(move || {
            let _ = started_tx.send(());
            let _ = release_rx.recv();
        });
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let callback_runs = Arc::clone(&runs);
        let event = ScheduledEvent::with_callback(
            10,
            Arc::new(move || {
                let _ = callback_runs.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert_eq!(event.fire(Instant::now(), &dispatcher, &counters), FireOutcome::Fired);
        assert!(event.cancel());

        release_tx.send(()).unwrap();
        assert!(event.wait_drained(Duration::from_secs(5)));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn panicking_callback_clears_running_flag() {
        let (dispatcher, counters) = pool();
        fn failing() {
            panic!("callback failure");
        }

        let event = ScheduledEvent::with_callback(10, Arc::new(failing));

        assert_eq!(event.fire(Instant::now(), &dispatcher, &counters), FireOutcome::Fired);
        assert!(event.wait_drained(Duration::from_secs(5)));

        // The fault is recorded right after the running flag is cleared.
        for _ in 0..500 {
            if counters.callback_faults() == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(counters.callback_faults(), 1);
        assert_eq!(event.fire(Instant::now(), &dispatcher, &counters), FireOutcome::Fired);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn replaced_callback_is_used_for_next_fire() {
        let (dispatcher, counters) = pool();
        let (sender, receiver) = flume::unbounded();

        let first = sender.clone();
        let event = ScheduledEvent::with_callback(
            10,
            Arc::new(move || {
                let _ = first.send("first");
            }),
        );
        event.replace_callback(Arc::new(move || {
            let _ = sender.send("second");
        }));

        assert_eq!(event.fire(Instant::now(), &dispatcher, &counters), FireOutcome::Fired);
        assert_eq!(receiver.recv_timeout(Duration::from_secs(5)).unwrap(), "second");
    }
}
