// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Monotonic fire times expressed as signed nanoseconds since a process-wide anchor.

use std::sync::LazyLock;
use std::time::{Duration, Instant};

static ANCHOR: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Returns the current monotonic time in nanoseconds.
pub(crate) fn now() -> i64 {
    from_instant(Instant::now())
}

/// Converts an instant into nanoseconds since the anchor.
///
/// Instants older than the anchor map to zero.
pub(crate) fn from_instant(instant: Instant) -> i64 {
    i64::try_from(instant.saturating_duration_since(*ANCHOR).as_nanos()).unwrap_or(i64::MAX)
}

/// Saturating conversion of a duration into signed nanoseconds.
pub(crate) fn from_duration(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

/// Conversion of signed nanoseconds into a duration; negative values become zero.
pub(crate) fn to_duration(nanos: i64) -> Duration {
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(0))
}

/// Computes the absolute fire time `delay` after `now`.
///
/// Saturates at `i64::MAX`, which is treated as "never".
pub(crate) fn deadline_after(now: i64, delay: Duration) -> i64 {
    now.saturating_add(from_duration(delay))
}
