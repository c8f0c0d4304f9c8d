// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crate::stats::Counters;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    receiver: flume::Receiver<Job>,
    counters: Arc<Counters>,
    max_threads: usize,
    idle_timeout: Duration,
    thread_count: AtomicUsize,
    pending_count: AtomicUsize,
    saturation_reported: AtomicBool,
}

/// An elastic thread pool that runs timer callbacks off the scheduling loop threads.
///
/// Starts without threads, spawns one whenever the pending-job count reaches the current
/// thread count (up to the configured ceiling) and lets surplus threads exit after the idle
/// timeout. The last thread stays alive until every `Dispatcher` handle is dropped.
///
/// Panics raised by a job are caught and recorded as callback faults.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    sender: flume::Sender<Job>,
    shared: Arc<Shared>,
}

impl Dispatcher {
    pub(crate) fn new(max_threads: usize, idle_timeout: Duration, counters: Arc<Counters>) -> Self {
        let (sender, receiver) = flume::unbounded();

        Self {
            sender,
            shared: Arc::new(Shared {
                receiver,
                counters,
                max_threads: max_threads.max(1),
                idle_timeout,
                thread_count: AtomicUsize::new(0),
                pending_count: AtomicUsize::new(0),
                saturation_reported: AtomicBool::new(false),
            }),
        }
    }

    /// Queues a job for execution on a dispatcher thread.
    pub(crate) fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        let prev_pending = self.shared.pending_count.fetch_add(1, Ordering::AcqRel);
        let threads = self.shared.thread_count.load(Ordering::Acquire);

        if prev_pending >= threads {
            if threads < self.shared.max_threads {
                if self
                    .shared
                    .thread_count
                    .compare_exchange(threads, threads + 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    Self::spawn_worker(&self.shared);
                }
            } else if !self.shared.saturation_reported.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    max_threads = self.shared.max_threads,
                    pending = prev_pending + 1,
                    "timer callback dispatcher is saturated, callbacks are queueing"
                );
            }
        }

        // The receiver lives in `shared`, which this handle keeps alive.
        let _ = self.sender.send(Box::new(job));
    }

    /// Number of threads currently serving the pool.
    pub(crate) fn thread_count(&self) -> usize {
        self.shared.thread_count.load(Ordering::Acquire)
    }

    /// Spawns a worker thread, assuming the caller already incremented the count.
    fn spawn_worker(shared: &Arc<Shared>) {
        let shared = Arc::clone(shared);
        let _ = thread::Builder::new()
            .name("timerloop-callback".into())
            .spawn(move || Self::worker_loop(&shared))
            .expect("failed to spawn timer callback thread");
    }

    fn worker_loop(shared: &Shared) {
        loop {
            match shared.receiver.recv_timeout(shared.idle_timeout) {
                Ok(job) => {
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
                        shared.counters.record_fault(payload.as_ref());
                    }

                    let _ = shared.pending_count.fetch_sub(1, Ordering::AcqRel);
                }
                Err(flume::RecvTimeoutError::Timeout) => {
                    let mut count = shared.thread_count.load(Ordering::Relaxed);
                    while count > 1 {
                        match shared
                            .thread_count
                            .compare_exchange_weak(count, count - 1, Ordering::AcqRel, Ordering::Relaxed)
                        {
                            Ok(_) => {
                                shared.saturation_reported.store(false, Ordering::Relaxed);
                                return;
                            }
                            Err(actual) => count = actual,
                        }
                    }
                }
                Err(flume::RecvTimeoutError::Disconnected) => {
                    let _ = shared.thread_count.fetch_sub(1, Ordering::AcqRel);
                    return;
                }
            }
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("threads", &self.shared.thread_count.load(Ordering::Relaxed))
            .field("pending", &self.shared.pending_count.load(Ordering::Relaxed))
            .field("max_threads", &self.shared.max_threads)
            .finish()
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    use super::*;

    fn dispatcher(max_threads: usize, idle_timeout: Duration) -> (Dispatcher, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        (Dispatcher::new(max_threads, idle_timeout, Arc::clone(&counters)), counters)
    }

    fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let started = Instant::now();
        while started.elapsed() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        condition()
    }

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(Dispatcher: Send, Sync, Clone, fmt::Debug);
    }

    #[test]
    fn starts_without_threads() {
        let (dispatcher, _) = dispatcher(4, Duration::from_secs(1));

        assert_eq!(dispatcher.thread_count(), 0);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn runs_every_job() {
        let (dispatcher, _) = dispatcher(4, Duration::from_secs(1));
        let runs = Arc::new(AtomicU32::new(0));

        for _ in 0..100 {
            let runs = Arc::clone(&runs);
            dispatcher.dispatch(move || {
                let _ = runs.fetch_add(1, Ordering::Relaxed);
            });
        }

        assert!(wait_until(Duration::from_secs(5), || runs.load(Ordering::Relaxed) == 100));
        assert!(dispatcher.thread_count() <= 4);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn panicking_job_is_recorded_and_pool_survives() {
        let (dispatcher, counters) = dispatcher(1, Duration::from_secs(1));
        let ran = Arc::new(AtomicBool::new(false));

        dispatcher.dispatch(|| panic!("callback failure"));
        let flag = Arc::clone(&ran);
        dispatcher.dispatch(move || flag.store(true, Ordering::Relaxed));

        assert!(wait_until(Duration::from_secs(5), || ran.load(Ordering::Relaxed)));
        assert_eq!(counters.callback_faults(), 1);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn surplus_threads_retire_after_idle_timeout() {
        let (dispatcher, _) = dispatcher(4, Duration::from_millis(20));
        let barrier = Arc::new(std::sync::Barrier::new(3));

        for _ in 0..3 {
            let barrier = Arc::clone(&barrier);
            dispatcher.dispatch(move || {
                let _ = barrier.wait();
            });
        }

        assert!(wait_until(Duration::from_secs(5), || dispatcher.thread_count() == 1));
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn workers_exit_when_handles_drop() {
        let (dispatcher, _) = dispatcher(2, Duration::from_secs(10));
        let shared = Arc::clone(&dispatcher.shared);
        dispatcher.dispatch(|| {});

        drop(dispatcher);

        assert!(wait_until(Duration::from_secs(5), || shared.thread_count.load(Ordering::Acquire) == 0));
    }
}
