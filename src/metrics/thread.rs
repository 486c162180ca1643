//! Per-thread counters and rate windows.
//!
//! Hot-path updates are single relaxed atomic adds; a dropped increment on a
//! shutdown race costs one count and is tolerable. Counters are monotonic
//! non-decreasing for the process lifetime (reset happens only on slot
//! reclaim, when the previous owner is gone).
//!
//! Rates are computed over a sliding window: [`sample_rate`] recomputes
//! events/bytes/swaps-per-second only when the window has elapsed and
//! otherwise returns the cached values, so the reporter can sample at any
//! cadence without skewing the rates.
//!
//! [`sample_rate`]: ThreadMetrics::sample_rate

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// Default rate window when nothing propagates one.
pub const DEFAULT_RATE_WINDOW_NS: u64 = 1_000_000_000;

/// Cached per-second rates for one thread.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ThreadRates {
    pub events_per_second: f64,
    pub bytes_per_second: f64,
    pub swaps_per_second: f64,
}

/// Opaque start-of-swap timestamp handed back to [`ThreadMetrics::swap_end`].
#[derive(Debug, Clone, Copy)]
pub struct SwapToken(u64);

/// Atomic counters for one registered thread.
///
/// The producer owns the increment side; the drain and reporter only read.
/// The rate-window fields are written solely from `sample_rate`, which the
/// collector calls from a single thread at a time.
pub struct ThreadMetrics {
    // Hot counters, padded away from the rate-window cold fields.
    events_written: CachePadded<AtomicU64>,
    bytes_written: CachePadded<AtomicU64>,
    events_dropped: AtomicU64,
    events_filtered: AtomicU64,

    swap_count: AtomicU64,
    swap_duration_total_ns: AtomicU64,

    // Sliding rate window.
    window_start_ns: AtomicU64,
    window_duration_ns: AtomicU64,
    prev_events: AtomicU64,
    prev_bytes: AtomicU64,
    prev_swaps: AtomicU64,
    // Cached rates as f64 bit patterns.
    eps_bits: AtomicU64,
    bps_bits: AtomicU64,
    sps_bits: AtomicU64,
}

impl ThreadMetrics {
    pub fn new() -> Self {
        Self {
            events_written: CachePadded::new(AtomicU64::new(0)),
            bytes_written: CachePadded::new(AtomicU64::new(0)),
            events_dropped: AtomicU64::new(0),
            events_filtered: AtomicU64::new(0),
            swap_count: AtomicU64::new(0),
            swap_duration_total_ns: AtomicU64::new(0),
            window_start_ns: AtomicU64::new(0),
            window_duration_ns: AtomicU64::new(DEFAULT_RATE_WINDOW_NS),
            prev_events: AtomicU64::new(0),
            prev_bytes: AtomicU64::new(0),
            prev_swaps: AtomicU64::new(0),
            eps_bits: AtomicU64::new(0),
            bps_bits: AtomicU64::new(0),
            sps_bits: AtomicU64::new(0),
        }
    }

    /// Clears every counter and the rate window. Only called on slot reclaim.
    pub fn reset(&self) {
        self.events_written.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
        self.events_dropped.store(0, Ordering::Relaxed);
        self.events_filtered.store(0, Ordering::Relaxed);
        self.swap_count.store(0, Ordering::Relaxed);
        self.swap_duration_total_ns.store(0, Ordering::Relaxed);
        self.window_start_ns.store(0, Ordering::Relaxed);
        self.prev_events.store(0, Ordering::Relaxed);
        self.prev_bytes.store(0, Ordering::Relaxed);
        self.prev_swaps.store(0, Ordering::Relaxed);
        self.eps_bits.store(0, Ordering::Relaxed);
        self.bps_bits.store(0, Ordering::Relaxed);
        self.sps_bits.store(0, Ordering::Relaxed);
    }

    /// Accounts one successfully written record.
    #[inline]
    pub fn record_write(&self, bytes: u64) {
        self.events_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Accounts one dropped record.
    #[inline]
    pub fn record_drop(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Accounts one record rejected by a filter before reaching a ring.
    #[inline]
    pub fn record_filtered(&self) {
        self.events_filtered.fetch_add(1, Ordering::Relaxed);
    }

    /// Captures the start of a ring swap.
    #[inline]
    pub fn swap_begin(&self, now_ns: u64) -> SwapToken {
        SwapToken(now_ns)
    }

    /// Completes a swap measurement: accumulates duration, bumps the count.
    #[inline]
    pub fn swap_end(&self, token: SwapToken, now_ns: u64) {
        self.swap_duration_total_ns
            .fetch_add(now_ns.saturating_sub(token.0), Ordering::Relaxed);
        self.swap_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_written(&self) -> u64 {
        self.events_written.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    pub fn events_filtered(&self) -> u64 {
        self.events_filtered.load(Ordering::Relaxed)
    }

    pub fn swap_count(&self) -> u64 {
        self.swap_count.load(Ordering::Relaxed)
    }

    /// Mean swap duration, zero before the first swap.
    pub fn avg_swap_duration_ns(&self) -> u64 {
        let count = self.swap_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0;
        }
        self.swap_duration_total_ns.load(Ordering::Relaxed) / count
    }

    /// Dropped share of all produced events, in percent.
    pub fn drop_rate_percent(&self) -> f64 {
        let written = self.events_written() as f64;
        let dropped = self.events_dropped() as f64;
        let produced = written + dropped;
        if produced == 0.0 {
            0.0
        } else {
            dropped / produced * 100.0
        }
    }

    /// Sets the sliding-window length for subsequent rate computations.
    pub fn set_window(&self, window_ns: u64) {
        if window_ns == 0 {
            return;
        }
        self.window_duration_ns.store(window_ns, Ordering::Relaxed);
    }

    /// Returns per-second rates, recomputing when the window has elapsed.
    ///
    /// The first call anchors the window and returns zeros; until the window
    /// elapses again the cached rates are returned unchanged. Must be called
    /// from one collector thread at a time (the global collector).
    pub fn sample_rate(&self, now_ns: u64) -> ThreadRates {
        let start = self.window_start_ns.load(Ordering::Relaxed);
        let window = self.window_duration_ns.load(Ordering::Relaxed);

        if start == 0 {
            self.window_start_ns.store(now_ns.max(1), Ordering::Relaxed);
            self.prev_events.store(self.events_written(), Ordering::Relaxed);
            self.prev_bytes.store(self.bytes_written(), Ordering::Relaxed);
            self.prev_swaps.store(self.swap_count(), Ordering::Relaxed);
            return self.cached_rates();
        }

        let elapsed = now_ns.saturating_sub(start);
        if elapsed < window {
            return self.cached_rates();
        }

        let secs = elapsed as f64 / 1e9;
        let events = self.events_written();
        let bytes = self.bytes_written();
        let swaps = self.swap_count();

        let eps = (events.saturating_sub(self.prev_events.load(Ordering::Relaxed))) as f64 / secs;
        let bps = (bytes.saturating_sub(self.prev_bytes.load(Ordering::Relaxed))) as f64 / secs;
        let sps = (swaps.saturating_sub(self.prev_swaps.load(Ordering::Relaxed))) as f64 / secs;

        self.eps_bits.store(eps.to_bits(), Ordering::Relaxed);
        self.bps_bits.store(bps.to_bits(), Ordering::Relaxed);
        self.sps_bits.store(sps.to_bits(), Ordering::Relaxed);
        self.prev_events.store(events, Ordering::Relaxed);
        self.prev_bytes.store(bytes, Ordering::Relaxed);
        self.prev_swaps.store(swaps, Ordering::Relaxed);
        self.window_start_ns.store(now_ns.max(1), Ordering::Relaxed);

        self.cached_rates()
    }

    fn cached_rates(&self) -> ThreadRates {
        ThreadRates {
            events_per_second: f64::from_bits(self.eps_bits.load(Ordering::Relaxed)),
            bytes_per_second: f64::from_bits(self.bps_bits.load(Ordering::Relaxed)),
            swaps_per_second: f64::from_bits(self.sps_bits.load(Ordering::Relaxed)),
        }
    }
}

impl Default for ThreadMetrics {
    fn default() -> Self {
        Self::new()
    }
}
