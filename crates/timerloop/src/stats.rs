// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};

/// Event counters shared by every loop of one registry.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    callback_faults: AtomicU64,
    skipped_callbacks: AtomicU64,
    dropped_signals: AtomicU64,
    loops_created: AtomicU64,
    loops_retired: AtomicU64,
}

impl Counters {
    /// Logs and counts a panic that escaped a user callback.
    pub(crate) fn record_fault(&self, payload: &(dyn Any + Send)) {
        let _ = self.callback_faults.fetch_add(1, Ordering::Relaxed);

        match panic_message(payload) {
            Some(message) => tracing::error!(panic = message, "timer callback panicked"),
            None => tracing::error!("timer callback panicked with a non-string payload"),
        }
    }

    pub(crate) fn record_skipped_callback(&self) {
        let _ = self.skipped_callbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped_signal(&self) {
        let _ = self.dropped_signals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_loop_created(&self) {
        let _ = self.loops_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_loop_retired(&self) {
        let _ = self.loops_retired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn callback_faults(&self) -> u64 {
        self.callback_faults.load(Ordering::Relaxed)
    }

    pub(crate) fn skipped_callbacks(&self) -> u64 {
        self.skipped_callbacks.load(Ordering::Relaxed)
    }

    pub(crate) fn dropped_signals(&self) -> u64 {
        self.dropped_signals.load(Ordering::Relaxed)
    }

    pub(crate) fn loops_created(&self) -> u64 {
        self.loops_created.load(Ordering::Relaxed)
    }

    pub(crate) fn loops_retired(&self) -> u64 {
        self.loops_retired.load(Ordering::Relaxed)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> Option<&str> {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
}
