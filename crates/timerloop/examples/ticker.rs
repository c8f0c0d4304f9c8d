// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Runs a few timers and tickers side by side and prints how closely they keep time.
//!
//! Run with `cargo run --example ticker` to also see the loop lifecycle logged at debug level.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use timerloop::{Config, LoopRegistry};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();

    // Tear idle loops down quickly so the lifecycle is visible in the log.
    let registry = LoopRegistry::with_config(Config::new().idle_ceiling(Duration::from_millis(200)))?;

    // A channel ticker: each receive returns the instant the tick fired at.
    let ticker = registry.new_ticker(Duration::from_millis(20))?;
    let started = Instant::now();
    for tick in 1..=10_u32 {
        let fired_at = ticker.receiver().recv()?;
        let expected = Duration::from_millis(20) * tick;
        println!(
            "tick {tick:>2}: {:>6.2}ms (expected {:>3}ms)",
            fired_at.duration_since(started).as_secs_f64() * 1000.0,
            expected.as_millis()
        );
    }
    ticker.stop();

    // A callback ticker that never overlaps with itself.
    let count = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&count);
    let func_ticker = registry.new_func_ticker(Duration::from_millis(5), move || {
        counter.fetch_add(1, Ordering::Relaxed);
    })?;

    // A one-shot timer used as a deadline for the callback ticker.
    let deadline = registry.new_timer(Duration::from_millis(100))?;
    deadline.receiver().recv()?;
    func_ticker.stop_timeout(Duration::from_secs(1));
    println!("callback ticker ran {} times in 100ms", count.load(Ordering::Relaxed));

    // The blocking sleep bypasses the loops entirely.
    let sleep_started = Instant::now();
    timerloop::sleep(Duration::from_millis(3));
    println!("slept {:?} for a 3ms request", sleep_started.elapsed());

    println!(
        "loops created: {}, live: {}, skipped callbacks: {}",
        registry.loops_created(),
        registry.live_loops(),
        registry.skipped_callbacks()
    );

    // Give the supervisors a chance to retire the idle loops.
    timerloop::sleep(Duration::from_millis(500));
    println!("live loops after idling: {}", registry.live_loops());

    Ok(())
}
