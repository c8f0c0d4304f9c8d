// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::event::{Callback, ScheduledEvent, validate};
use crate::{LoopRegistry, Result, mono};

/// A scheduled event owned by a client handle.
///
/// Dropping the registration cancels the event unless it was detached.
#[derive(Debug)]
pub(crate) struct Registration {
    registry: LoopRegistry,
    event: Arc<ScheduledEvent>,
    detached: bool,
}

impl Registration {
    /// Registers `event` to fire `delay` from now.
    pub(crate) fn schedule(registry: &LoopRegistry, delay: Duration, event: Arc<ScheduledEvent>) -> Self {
        schedule_detached(registry, delay, &event);

        Self {
            registry: registry.clone(),
            event,
            detached: false,
        }
    }

    pub(crate) fn registry(&self) -> &LoopRegistry {
        &self.registry
    }

    pub(crate) fn event(&self) -> &Arc<ScheduledEvent> {
        &self.event
    }

    /// Cancels the event and takes it out of its loop. Returns `true` if it was still pending.
    pub(crate) fn cancel(&self) -> bool {
        let was_pending = self.event.cancel();
        self.event.remove_from_loop();
        was_pending
    }

    pub(crate) fn detach(&mut self) {
        self.detached = true;
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if !self.detached {
            let _ = self.cancel();
        }
    }
}

pub(crate) fn schedule_detached(registry: &LoopRegistry, delay: Duration, event: &Arc<ScheduledEvent>) {
    let when = mono::deadline_after(mono::now(), delay);
    registry.register(delay, when, event);
}

/// A one-shot timer that delivers the instant it fired at through a channel.
///
/// The timer fires no earlier than the requested delay after it was created or last reset.
/// Dropping the timer cancels it.
///
/// # Examples
///
/// ```
/// use std::time::{Duration, Instant};
///
/// let created = Instant::now();
/// let timer = timerloop::new_timer(Duration::from_millis(10))?;
///
/// let fired_at = timer.receiver().recv().unwrap();
/// assert!(fired_at >= created + Duration::from_millis(10));
///
/// // Stopping an expired timer reports that nothing was pending.
/// assert!(!timer.stop());
/// # Ok::<(), timerloop::Error>(())
/// ```
#[derive(Debug)]
pub struct Timer {
    sender: flume::Sender<Instant>,
    receiver: flume::Receiver<Instant>,
    registration: Registration,
}

impl Timer {
    pub(crate) fn new(registry: &LoopRegistry, delay: Duration) -> Result<Self> {
        let delay = validate("new_timer", delay)?;
        let (sender, receiver) = flume::bounded(1);
        let event = ScheduledEvent::with_signal(0, sender.clone());

        Ok(Self {
            sender,
            receiver,
            registration: Registration::schedule(registry, delay, event),
        })
    }

    /// The channel the fire instant is delivered on.
    #[must_use]
    pub fn receiver(&self) -> &flume::Receiver<Instant> {
        &self.receiver
    }

    /// Prevents the timer from firing.
    ///
    /// Returns `true` if the timer was still pending, and `false` if it had already fired or
    /// been stopped. Once this returns, no value is sent anymore; a value sent before the call
    /// remains in the channel.
    pub fn stop(&self) -> bool {
        self.registration.cancel()
    }

    /// Like [`Timer::stop`], returning whether no delivery is still in flight once `timeout`
    /// elapses.
    ///
    /// Channel deliveries complete before [`Timer::stop`] returns, so this always reports
    /// `true`.
    pub fn stop_timeout(&self, timeout: Duration) -> bool {
        let _ = self.stop();
        self.registration.event().wait_drained(timeout)
    }

    /// Stops the timer and schedules it again to fire `delay` from now.
    ///
    /// Any value left in the channel by the previous schedule is discarded. Returns `true`
    /// if the previous schedule was still pending.
    ///
    /// # Errors
    ///
    /// Returns an error if `delay` is below [`MIN_RESOLUTION`][crate::MIN_RESOLUTION]; the
    /// timer is left untouched.
    pub fn reset(&mut self, delay: Duration) -> Result<bool> {
        let delay = validate("Timer::reset", delay)?;
        let was_pending = self.registration.cancel();
        self.receiver.drain().for_each(drop);

        let event = ScheduledEvent::with_signal(0, self.sender.clone());
        self.registration = Registration::schedule(self.registration.registry(), delay, event);

        Ok(was_pending)
    }
}

/// A one-shot timer that runs a callback on the callback thread pool.
///
/// Dropping the handle cancels the callback; call [`FuncTimer::detach`] to let it run
/// without keeping the handle around.
#[derive(Debug)]
pub struct FuncTimer {
    callback: CallbackDebug,
    registration: Registration,
}

impl FuncTimer {
    pub(crate) fn new(registry: &LoopRegistry, delay: Duration, callback: Callback) -> Result<Self> {
        let delay = validate("after_func", delay)?;
        let event = ScheduledEvent::with_callback(0, Arc::clone(&callback));

        Ok(Self {
            callback: CallbackDebug(callback),
            registration: Registration::schedule(registry, delay, event),
        })
    }

    /// Prevents the callback from being started.
    ///
    /// Returns `true` if it was still pending. An invocation that already started keeps
    /// running; use [`FuncTimer::stop_timeout`] to wait for it.
    pub fn stop(&self) -> bool {
        self.registration.cancel()
    }

    /// Stops the timer and waits up to `timeout` for a running invocation to finish.
    ///
    /// Returns `false` if the callback was still running when the timeout elapsed.
    pub fn stop_timeout(&self, timeout: Duration) -> bool {
        let _ = self.stop();
        self.registration.event().wait_drained(timeout)
    }

    /// Stops the timer and schedules the callback again to run `delay` from now.
    ///
    /// Returns `true` if the previous schedule was still pending.
    ///
    /// # Errors
    ///
    /// Returns an error if `delay` is below [`MIN_RESOLUTION`][crate::MIN_RESOLUTION]; the
    /// timer is left untouched.
    pub fn reset(&mut self, delay: Duration) -> Result<bool> {
        let delay = validate("FuncTimer::reset", delay)?;
        let was_pending = self.registration.cancel();

        let event = ScheduledEvent::with_callback(0, Arc::clone(&self.callback.0));
        self.registration = Registration::schedule(self.registration.registry(), delay, event);

        Ok(was_pending)
    }

    /// Lets the callback run even though the handle is dropped.
    pub fn detach(mut self) {
        self.registration.detach();
    }
}

/// Returns a receiver that gets one instant after `delay`.
pub(crate) fn after(registry: &LoopRegistry, delay: Duration) -> Result<flume::Receiver<Instant>> {
    let delay = validate("after", delay)?;
    let (sender, receiver) = flume::bounded(1);
    let event = ScheduledEvent::with_signal(0, sender);
    schedule_detached(registry, delay, &event);

    Ok(receiver)
}

pub(crate) struct CallbackDebug(pub(crate) Callback);

impl std::fmt::Debug for CallbackDebug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Fn()")
    }
}
