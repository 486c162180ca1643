//! Producer-side ring pool: the write fast path over one lane.
//!
//! # Design
//!
//! [`RingPool`] is a stateless view over a lane plus the owning thread's
//! counters; the only mutable producer state (the active ring index) lives in
//! the lane itself. The fast path is wait-free: a record either lands in the
//! active ring in bounded steps or the pool swaps rings once and retries
//! once, and failing that the record is dropped and counted.
//!
//! ```text
//! write_record ──► active.write ──ok──► done
//!                     │ full
//!                     ▼
//!               swap_active ──none──► drop current record
//!                     │ swapped
//!                     ▼
//!               active.write (retry once)
//! ```
//!
//! Exhaustion follows the drop-oldest policy: when the free queue is empty
//! the pool reclaims the *oldest submitted* ring, dropping its records one by
//! one through the backpressure accounting, so the newest data survives at
//! the cost of the oldest.
//!
//! # Concurrency
//!
//! All methods are producer-only; the lane queues carry the synchronization
//! with the drain. The clock is consulted only on the swap path, never per
//! record.

use crate::clock;
use crate::lane::Lane;
use crate::metrics::thread::ThreadMetrics;

/// Producer-side operations over one lane.
pub struct RingPool<'a> {
    lane: &'a Lane,
    metrics: &'a ThreadMetrics,
}

impl<'a> RingPool<'a> {
    pub fn new(lane: &'a Lane, metrics: &'a ThreadMetrics) -> Self {
        Self { lane, metrics }
    }

    /// Writes one record, swapping rings when the active one fills.
    ///
    /// Returns `false` when the record was dropped (pool exhausted beyond
    /// reclaim, or `payload` does not match the lane's record size); the drop
    /// is already counted against the thread and backpressure counters.
    pub fn write_record(&self, payload: &[u8]) -> bool {
        if payload.len() != self.lane.record_size() as usize {
            return false;
        }

        if self.lane.active_ring().write(payload) {
            self.metrics.record_write(payload.len() as u64);
            return true;
        }

        // Active ring full: publish it and take a fresh one.
        let now_ns = clock::now_ns();
        let token = self.metrics.swap_begin(now_ns);
        let swapped = self.swap_active();
        self.metrics.swap_end(token, clock::now_ns());

        if swapped.is_some() && self.lane.active_ring().write(payload) {
            self.metrics.record_write(payload.len() as u64);
            return true;
        }

        self.metrics.record_drop();
        self.lane
            .backpressure()
            .on_drop(payload.len() as u64, clock::now_ns());
        false
    }

    /// Publishes the active ring to the submitted queue and activates a free
    /// ring, returning the previous active index.
    ///
    /// On an exhausted pool this reclaims the oldest submitted ring and
    /// retries once; `None` means no ring could be obtained and the caller
    /// must drop. The free ring is acquired *before* the active ring is
    /// published so the lane always holds exactly one active ring.
    pub fn swap_active(&self) -> Option<u32> {
        let now_ns = clock::now_ns();

        let mut next = self.lane.get_free_ring();
        if next.is_none() {
            self.lane.backpressure().on_exhaustion(now_ns);
            if self.handle_exhaustion(now_ns) {
                next = self.lane.get_free_ring();
            }
        }

        let Some(next) = next else {
            self.lane.backpressure().sample(0, now_ns);
            return None;
        };

        debug_assert!(
            self.lane.ring(next).is_some_and(|r| r.is_empty()),
            "free ring must be empty on acquisition"
        );

        let prev = self.lane.active_ring_idx();
        self.lane.set_active_ring_idx(next);

        // The submitted queue holds every index in the pool, so a push can
        // only fail transiently under CAS contention.
        while !self.lane.submit_ring(prev) {
            std::hint::spin_loop();
        }

        self.lane.backpressure().sample(self.lane.free_len(), now_ns);
        Some(prev)
    }

    /// Reclaims the oldest submitted ring by dropping its records.
    ///
    /// Returns `true` when a ring made it back to the free queue. Each
    /// dropped record is accounted individually so the drop counters and the
    /// drop-rate log reflect events, not rings.
    pub fn handle_exhaustion(&self, now_ns: u64) -> bool {
        let Some(idx) = self.lane.take_ring() else {
            return false;
        };

        let ring = self
            .lane
            .ring(idx)
            .expect("submitted queue only holds valid indices");
        let record_size = ring.record_size() as u64;

        while ring.drop_oldest() {
            self.lane.backpressure().on_drop(record_size, now_ns);
            self.metrics.record_drop();
        }
        ring.reset();

        while !self.lane.return_ring(idx) {
            std::hint::spin_loop();
        }

        self.lane
            .backpressure()
            .on_recovery(self.lane.free_len(), now_ns);
        true
    }
}
