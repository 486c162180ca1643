//! Monotonic nanosecond clock anchored at process start.
//!
//! Every timestamp in the data path (ring records, backpressure samples,
//! rate windows, report views) is a `u64` nanosecond count on the same
//! monotonic axis. Anchoring at first use keeps the values small enough that
//! wrap-around is a non-issue (2^64 ns ≈ 584 years) while staying immune to
//! wall-clock adjustments.
//!
//! Tests drive the state machines with explicit literal timestamps; only the
//! live threads (producer fast path, drain, reporter) call [`now_ns`].

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds elapsed since the first call in this process.
#[inline]
pub fn now_ns() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}
