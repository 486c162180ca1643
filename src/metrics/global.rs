//! System-wide metrics collection over the thread registry.
//!
//! [`GlobalMetrics`] owns a fixed-capacity snapshot array and fills it in
//! slot order on every [`collect`](GlobalMetrics::collect): per-thread
//! counters, per-thread rates (computed through each thread's own sliding
//! window), queue depths, and aggregated totals plus system-wide rates.
//!
//! Collection is driven by the reporter thread; the producers never touch
//! this type. The snapshot values are eventually consistent with producer
//! updates; one report may mix counter values read at slightly different
//! instants across threads, which is acceptable for observability.

use crate::registry::ThreadRegistry;

use std::sync::atomic::{AtomicBool, Ordering};

/// One thread's counters and rates as of a collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ThreadMetricsSnapshot {
    pub thread_id: u32,
    pub slot_index: u32,
    pub events_written: u64,
    pub events_dropped: u64,
    pub events_filtered: u64,
    pub bytes_written: u64,
    pub events_per_second: f64,
    pub bytes_per_second: f64,
    pub drop_rate_percent: f64,
    pub swap_count: u64,
    pub swaps_per_second: f64,
    pub avg_swap_duration_ns: u64,
    /// Deepest submitted-queue backlog across the thread's two lanes.
    pub max_queue_depth: u32,
}

/// Aggregated totals across every registered thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalTotals {
    pub total_events_written: u64,
    pub total_events_dropped: u64,
    pub total_events_filtered: u64,
    pub total_bytes_written: u64,
    pub active_thread_count: u32,
}

/// System-wide rates over the collector's own sliding window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GlobalRates {
    pub system_events_per_second: f64,
    pub system_bytes_per_second: f64,
    /// Length of the window the current rates were computed over.
    pub last_window_ns: u64,
}

/// Fixed-capacity, reporter-owned collection state.
pub struct GlobalMetrics {
    snapshots: Vec<ThreadMetricsSnapshot>,
    snapshot_count: usize,
    totals: GlobalTotals,
    rates: GlobalRates,
    collection_enabled: AtomicBool,
    interval_ns: u64,
    window_start_ns: u64,
    prev_total_events: u64,
    prev_total_bytes: u64,
}

impl GlobalMetrics {
    /// Creates a collector able to snapshot up to `snapshot_capacity`
    /// threads per pass.
    pub fn new(snapshot_capacity: usize) -> Self {
        Self {
            snapshots: vec![ThreadMetricsSnapshot::default(); snapshot_capacity.max(1)],
            snapshot_count: 0,
            totals: GlobalTotals::default(),
            rates: GlobalRates::default(),
            collection_enabled: AtomicBool::new(true),
            interval_ns: crate::metrics::thread::DEFAULT_RATE_WINDOW_NS,
            window_start_ns: 0,
            prev_total_events: 0,
            prev_total_bytes: 0,
        }
    }

    /// Snapshot slots available per pass.
    pub fn snapshot_capacity(&self) -> usize {
        self.snapshots.len()
    }

    /// Snapshots filled by the last collection, in slot order.
    pub fn snapshots(&self) -> &[ThreadMetricsSnapshot] {
        &self.snapshots[..self.snapshot_count]
    }

    /// Totals from the last collection.
    pub fn totals(&self) -> GlobalTotals {
        self.totals
    }

    /// Rates from the last collection.
    pub fn rates(&self) -> GlobalRates {
        self.rates
    }

    /// Gates [`collect`](Self::collect); tests disable refresh through this.
    pub fn set_collection_enabled(&self, enabled: bool) {
        self.collection_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn collection_enabled(&self) -> bool {
        self.collection_enabled.load(Ordering::Relaxed)
    }

    /// Sets the rate window; propagated to each thread at collection time.
    /// Zero is ignored.
    pub fn set_interval(&mut self, interval_ns: u64) {
        if interval_ns == 0 {
            return;
        }
        self.interval_ns = interval_ns;
    }

    /// Forces the next collection to restart the system-rate window, so a
    /// forced or summary report is not charged a partial window.
    pub fn reset_collection_timer(&mut self) {
        self.window_start_ns = 0;
    }

    /// Walks every registry slot and refreshes snapshots, totals, and rates.
    ///
    /// Returns `false` (leaving the previous data intact) when collection is
    /// disabled. Threads beyond the snapshot capacity still count toward the
    /// totals; only their per-thread lines are elided.
    pub fn collect(&mut self, registry: &ThreadRegistry, now_ns: u64) -> bool {
        if !self.collection_enabled() {
            return false;
        }

        let mut totals = GlobalTotals::default();
        let mut count = 0usize;

        for slot in 0..registry.capacity() {
            let Some(metrics) = registry.metrics_at(slot) else {
                continue;
            };

            metrics.set_window(self.interval_ns);
            let rates = metrics.sample_rate(now_ns);

            let events_written = metrics.events_written();
            let bytes_written = metrics.bytes_written();
            totals.total_events_written += events_written;
            totals.total_events_dropped += metrics.events_dropped();
            totals.total_events_filtered += metrics.events_filtered();
            totals.total_bytes_written += bytes_written;
            totals.active_thread_count += 1;

            if count < self.snapshots.len() {
                let max_queue_depth = registry
                    .lanes_at(slot)
                    .map(|lanes| {
                        lanes
                            .index_lane()
                            .submitted_depth()
                            .max(lanes.detail_lane().submitted_depth())
                    })
                    .unwrap_or(0);

                self.snapshots[count] = ThreadMetricsSnapshot {
                    thread_id: registry.thread_id_at(slot).unwrap_or(0),
                    slot_index: slot,
                    events_written,
                    events_dropped: metrics.events_dropped(),
                    events_filtered: metrics.events_filtered(),
                    bytes_written,
                    events_per_second: rates.events_per_second,
                    bytes_per_second: rates.bytes_per_second,
                    drop_rate_percent: metrics.drop_rate_percent(),
                    swap_count: metrics.swap_count(),
                    swaps_per_second: rates.swaps_per_second,
                    avg_swap_duration_ns: metrics.avg_swap_duration_ns(),
                    max_queue_depth,
                };
                count += 1;
            }
        }

        self.snapshot_count = count;
        self.totals = totals;
        self.refresh_system_rates(now_ns);
        true
    }

    fn refresh_system_rates(&mut self, now_ns: u64) {
        if self.window_start_ns == 0 {
            self.window_start_ns = now_ns.max(1);
            self.prev_total_events = self.totals.total_events_written;
            self.prev_total_bytes = self.totals.total_bytes_written;
            return;
        }

        let elapsed = now_ns.saturating_sub(self.window_start_ns);
        if elapsed < self.interval_ns {
            return;
        }

        let secs = elapsed as f64 / 1e9;
        let event_delta = self
            .totals
            .total_events_written
            .saturating_sub(self.prev_total_events);
        let byte_delta = self
            .totals
            .total_bytes_written
            .saturating_sub(self.prev_total_bytes);

        self.rates = GlobalRates {
            system_events_per_second: event_delta as f64 / secs,
            system_bytes_per_second: byte_delta as f64 / secs,
            last_window_ns: elapsed,
        };
        self.prev_total_events = self.totals.total_events_written;
        self.prev_total_bytes = self.totals.total_bytes_written;
        self.window_start_ns = now_ns.max(1);
    }
}
