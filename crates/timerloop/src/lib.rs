// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(
    test,
    allow(
        clippy::arithmetic_side_effects,
        clippy::unchecked_time_subtraction,
        reason = "allow these lints in tests to improve the readability of the tests"
    )
)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Multiplexes many one-shot and periodic timers onto a few shared scheduling loops.
//!
//! Spawning a sleeping thread per timer does not scale past a few hundred timers. This crate
//! instead keeps pending timers in ordered queues, each owned by one scheduling loop with a
//! single worker thread. The number of threads grows with the number of distinct timing
//! granularities in use, not with the number of timers.
//!
//! # Quick Start
//!
//! ```
//! use std::time::{Duration, Instant};
//!
//! let created = Instant::now();
//! let timer = timerloop::new_timer(Duration::from_millis(5))?;
//! let fired_at = timer.receiver().recv().unwrap();
//! assert!(fired_at >= created + Duration::from_millis(5));
//!
//! let ticker = timerloop::new_ticker(Duration::from_millis(1))?;
//! for _ in 0..3 {
//!     ticker.receiver().recv().unwrap();
//! }
//! ticker.stop();
//! # Ok::<(), timerloop::Error>(())
//! ```
//!
//! # Overview
//!
//! - [`Timer`] and [`Ticker`] deliver fire instants through a single-slot channel. A
//!   delivery that finds the channel full is dropped.
//! - [`FuncTimer`] and [`FuncTicker`] run a callback on an elastic thread pool. A periodic
//!   callback never overlaps with itself; ticks that arrive while it is still running are
//!   skipped.
//! - [`LoopRegistry`] owns the scheduling loops. Every operation is available on an explicit
//!   registry; the free functions of this crate use [`LoopRegistry::global`].
//! - [`Config`] tunes sleep correction, idle teardown, routing and the callback pool.
//! - [`AdaptiveSleeper`] and [`sleep`] are the feedback-corrected sleep the loops use.
//! - [`OrderedQueue`] is the stable, ordered container the loops keep pending events in.
//!
//! # Guarantees
//!
//! - Nothing fires earlier than requested. Late fires are delivered late; periodic timers
//!   that fell behind deliver one late tick and then resume on their original phase.
//! - Within one loop, earlier fire times fire first and equal fire times fire in
//!   registration order.
//! - Once `stop` returns, the timer does not deliver again. A callback invocation that had
//!   already started may still be running; `stop_timeout` waits for it.
//! - A panicking callback is caught, logged with `tracing` and counted in
//!   [`LoopRegistry::callback_faults`]. It never takes down a loop.
//! - Durations below [`MIN_RESOLUTION`] are rejected with [`ErrorKind::InvalidArgument`].
//!
//! # Lifecycle
//!
//! Loops are created when the first timer of their granularity arrives, and torn down once
//! their queue has been empty for a granularity-scaled idle period. A timer registered
//! while its loop is being torn down lands on a freshly started loop.
//!
//! Dropping a handle cancels its timer. [`FuncTimer::detach`] and [`FuncTicker::detach`]
//! keep a callback scheduled without the handle; [`after`] and [`tick`] return bare
//! receivers whose timers end once the receiver is dropped.

mod config;
mod dispatcher;
mod error;
mod event;
mod mono;
mod queue;
mod registry;
mod scheduling_loop;
mod sleeper;
mod stats;
mod ticker;
mod timer;

use std::time::{Duration, Instant};

pub use config::{Config, Routing};
pub use error::{Error, ErrorKind, Result};
pub use event::MIN_RESOLUTION;
pub use queue::{EntryKey, OrderedQueue};
pub use registry::{Granularity, LoopRegistry};
pub use sleeper::{AdaptiveSleeper, MIN_SLEEP, sleep};
pub use ticker::{FuncTicker, Ticker};
pub use timer::{FuncTimer, Timer};

/// Creates a one-shot [`Timer`] on the global registry.
///
/// # Errors
///
/// Returns an error if `delay` is below [`MIN_RESOLUTION`].
pub fn new_timer(delay: Duration) -> Result<Timer> {
    LoopRegistry::global().new_timer(delay)
}

/// Creates a [`Ticker`] on the global registry.
///
/// # Errors
///
/// Returns an error if `period` is below [`MIN_RESOLUTION`].
pub fn new_ticker(period: Duration) -> Result<Ticker> {
    LoopRegistry::global().new_ticker(period)
}

/// Runs `callback` once after `delay`, using the global registry.
///
/// # Errors
///
/// Returns an error if `delay` is below [`MIN_RESOLUTION`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// let (sender, receiver) = flume::bounded(1);
/// timerloop::after_func(Duration::from_millis(2), move || {
///     let _ = sender.try_send("done");
/// })?
/// .detach();
///
/// assert_eq!(receiver.recv().unwrap(), "done");
/// # Ok::<(), timerloop::Error>(())
/// ```
pub fn after_func<F>(delay: Duration, callback: F) -> Result<FuncTimer>
where
    F: Fn() + Send + Sync + 'static,
{
    LoopRegistry::global().after_func(delay, callback)
}

/// Runs `callback` every `period`, using the global registry.
///
/// # Errors
///
/// Returns an error if `period` is below [`MIN_RESOLUTION`].
pub fn new_func_ticker<F>(period: Duration, callback: F) -> Result<FuncTicker>
where
    F: Fn() + Send + Sync + 'static,
{
    LoopRegistry::global().new_func_ticker(period, callback)
}

/// Returns a receiver that gets one instant after `delay`.
///
/// # Errors
///
/// Returns an error if `delay` is below [`MIN_RESOLUTION`].
pub fn after(delay: Duration) -> Result<flume::Receiver<Instant>> {
    LoopRegistry::global().after(delay)
}

/// Returns a receiver that gets an instant every `period`, or `None` if `period` is below
/// [`MIN_RESOLUTION`].
///
/// The ticker keeps running until the receiver is dropped.
#[must_use]
pub fn tick(period: Duration) -> Option<flume::Receiver<Instant>> {
    LoopRegistry::global().tick(period)
}
