// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::event::{Callback, ScheduledEvent, validate};
use crate::timer::{Registration, schedule_detached};
use crate::{LoopRegistry, Result, mono};

/// A periodic timer that delivers the instant of each tick through a channel.
///
/// Ticks are scheduled one period after the previous one, not one period after the
/// previous delivery, so they do not drift. The channel holds a single tick; ticks the
/// receiver is too slow to consume are dropped, and a loop that fell behind delivers one
/// late tick instead of a burst. Dropping the ticker stops it.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// let ticker = timerloop::new_ticker(Duration::from_millis(2))?;
///
/// for _ in 0..3 {
///     ticker.receiver().recv().unwrap();
/// }
///
/// assert!(ticker.stop());
/// # Ok::<(), timerloop::Error>(())
/// ```
#[derive(Debug)]
pub struct Ticker {
    sender: flume::Sender<Instant>,
    receiver: flume::Receiver<Instant>,
    period: Duration,
    registration: Registration,
}

impl Ticker {
    pub(crate) fn new(registry: &LoopRegistry, period: Duration) -> Result<Self> {
        let period = validate("new_ticker", period)?;
        let (sender, receiver) = flume::bounded(1);
        let event = ScheduledEvent::with_signal(mono::from_duration(period), sender.clone());

        Ok(Self {
            sender,
            receiver,
            period,
            registration: Registration::schedule(registry, period, event),
        })
    }

    /// The channel the tick instants are delivered on.
    #[must_use]
    pub fn receiver(&self) -> &flume::Receiver<Instant> {
        &self.receiver
    }

    /// The interval between ticks.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Stops the ticker. Returns `true` if it was still running.
    ///
    /// Once this returns, no further tick is sent.
    pub fn stop(&self) -> bool {
        self.registration.cancel()
    }

    /// Restarts the ticker with a new period, the first tick arriving `period` from now.
    ///
    /// Ticks left in the channel are discarded. Returns `true` if the ticker was running.
    ///
    /// # Errors
    ///
    /// Returns an error if `period` is below [`MIN_RESOLUTION`][crate::MIN_RESOLUTION]; the
    /// ticker is left untouched.
    pub fn reset(&mut self, period: Duration) -> Result<bool> {
        let period = validate("Ticker::reset", period)?;
        let was_running = self.registration.cancel();
        self.receiver.drain().for_each(drop);

        let event = ScheduledEvent::with_signal(mono::from_duration(period), self.sender.clone());
        self.registration = Registration::schedule(self.registration.registry(), period, event);
        self.period = period;

        Ok(was_running)
    }
}

/// A periodic timer that runs a callback on the callback thread pool.
///
/// At most one invocation per ticker runs at a time: a tick that arrives while the previous
/// invocation is still running is skipped and counted in
/// [`LoopRegistry::skipped_callbacks`]. Dropping the handle stops the ticker; call
/// [`FuncTicker::detach`] to keep it running for the lifetime of the registry.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicU32, Ordering};
/// use std::time::Duration;
///
/// let ticks = Arc::new(AtomicU32::new(0));
/// let counter = Arc::clone(&ticks);
///
/// let ticker = timerloop::new_func_ticker(Duration::from_millis(1), move || {
///     counter.fetch_add(1, Ordering::Relaxed);
/// })?;
///
/// while ticks.load(Ordering::Relaxed) < 3 {
///     std::thread::sleep(Duration::from_millis(1));
/// }
///
/// assert!(ticker.stop_timeout(Duration::from_secs(1)));
/// # Ok::<(), timerloop::Error>(())
/// ```
#[derive(Debug)]
pub struct FuncTicker {
    period: Duration,
    registration: Registration,
}

impl FuncTicker {
    pub(crate) fn new(registry: &LoopRegistry, period: Duration, callback: Callback) -> Result<Self> {
        let period = validate("new_func_ticker", period)?;
        let event = ScheduledEvent::with_callback(mono::from_duration(period), callback);

        Ok(Self {
            period,
            registration: Registration::schedule(registry, period, event),
        })
    }

    /// The interval between ticks.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Stops the ticker. Returns `true` if it was still running.
    ///
    /// An invocation that already started keeps running; use [`FuncTicker::stop_timeout`]
    /// to wait for it.
    pub fn stop(&self) -> bool {
        self.registration.cancel()
    }

    /// Stops the ticker and waits up to `timeout` for a running invocation to finish.
    ///
    /// Returns `false` if the callback was still running when the timeout elapsed.
    pub fn stop_timeout(&self, timeout: Duration) -> bool {
        let _ = self.stop();
        self.registration.event().wait_drained(timeout)
    }

    /// Replaces the callback run by subsequent ticks.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.registration.event().replace_callback(Arc::new(callback));
    }

    /// Keeps the ticker running after the handle is dropped.
    pub fn detach(mut self) {
        self.registration.detach();
    }
}

/// Returns a receiver that gets an instant every `period`, or `None` for sub-resolution periods.
pub(crate) fn tick(registry: &LoopRegistry, period: Duration) -> Option<flume::Receiver<Instant>> {
    let period = validate("tick", period).ok()?;
    let (sender, receiver) = flume::bounded(1);
    let event = ScheduledEvent::with_signal(mono::from_duration(period), sender);
    schedule_detached(registry, period, &event);

    Some(receiver)
}
