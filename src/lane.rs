//! A lane: one producer thread's pool of rings for one event class.
//!
//! # Design
//!
//! A lane bundles K rings with two index queues and an active slot:
//!
//! ```text
//!            get_free_ring()                     submit_ring()
//!   free ─────────────────────► active (1) ─────────────────────► submitted
//!    ▲                                                               │
//!    └────────────────── return_ring()  ◄──── drain ── take_ring() ──┘
//! ```
//!
//! # Correctness invariants
//!
//! - Every ring index in `[0, K)` is in exactly one of {free queue,
//!   submitted queue, active slot} at any quiescent point.
//! - `|free| + |submitted| + 1 == K` (the active slot always holds a ring).
//! - A ring is only written by the producer while active and only read by
//!   the drain while taken from the submitted queue, which is what makes the
//!   rings' SPSC protocol sound.
//! - `return_ring` must not lose a ring; the queue has capacity for all K
//!   indices so a push can only fail transiently under CAS contention, and
//!   the caller retries.
//!
//! Both queues are sized to the next power of two ≥ K so every index fits
//! even in the degenerate all-in-one-queue states around startup/teardown.

use crate::backpressure::{BackpressureConfig, BackpressureState};
use crate::stdx::{IndexQueue, RecordRing};

use std::sync::atomic::{AtomicU32, Ordering};

/// Which event class a lane carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LaneKind {
    /// Fixed 32-byte entry/exit/sample records.
    Index,
    /// Larger stack-snapshot records.
    Detail,
}

impl LaneKind {
    /// Stable name used in paths and logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Index => "index",
            Self::Detail => "detail",
        }
    }
}

/// Sizing for one lane.
#[derive(Debug, Clone, Copy)]
pub struct LaneConfig {
    /// Rings in the pool. Must be ≥ 2: one active, at least one in flight.
    pub rings: u32,
    /// Slots per ring, power of two ≥ 2 (one slot is reserved).
    pub ring_capacity: u32,
    /// Bytes per record, fixed for the lane's lifetime.
    pub record_size: u32,
}

impl LaneConfig {
    /// Validates the configuration.
    ///
    /// # Panics
    ///
    /// Panics on a configuration no lane can run with; these are
    /// construction-time errors, mirrored by the ring constructors.
    pub fn validate(&self) {
        assert!(self.rings >= 2, "lane needs at least 2 rings");
        assert!(self.rings <= 1 << 15, "lane ring count out of range");
        assert!(
            self.ring_capacity >= 2 && self.ring_capacity.is_power_of_two(),
            "ring capacity must be a power of two >= 2"
        );
        assert!(self.record_size > 0, "record size must be > 0");
    }
}

/// One producer thread's ring pool for one event class.
pub struct Lane {
    kind: LaneKind,
    rings: Box<[RecordRing]>,
    free: IndexQueue,
    submitted: IndexQueue,
    active: AtomicU32,
    backpressure: BackpressureState,
}

impl Lane {
    /// Builds a lane: ring 0 starts active, rings 1..K seed the free queue.
    pub fn new(kind: LaneKind, config: LaneConfig, bp_config: BackpressureConfig) -> Self {
        config.validate();

        let rings: Box<[RecordRing]> = (0..config.rings)
            .map(|_| RecordRing::new(config.ring_capacity, config.record_size))
            .collect();

        let queue_capacity = config.rings.next_power_of_two();
        let free = IndexQueue::new(queue_capacity);
        let submitted = IndexQueue::new(queue_capacity);

        for idx in 1..config.rings {
            let pushed = free.push(idx);
            debug_assert!(pushed, "seeding a fresh free queue cannot fail");
        }

        let backpressure = BackpressureState::new(bp_config);
        backpressure.set_total_rings(config.rings);

        Self {
            kind,
            rings,
            free,
            submitted,
            active: AtomicU32::new(0),
            backpressure,
        }
    }

    /// Event class of this lane.
    #[inline]
    pub fn kind(&self) -> LaneKind {
        self.kind
    }

    /// Number of rings in the pool.
    #[inline]
    pub fn ring_count(&self) -> u32 {
        self.rings.len() as u32
    }

    /// Bytes per record in this lane's rings.
    #[inline]
    pub fn record_size(&self) -> u32 {
        self.rings[0].record_size()
    }

    /// The ring at `idx`, if in range.
    #[inline]
    pub fn ring(&self, idx: u32) -> Option<&RecordRing> {
        self.rings.get(idx as usize)
    }

    /// Index of the ring the producer currently writes into.
    #[inline]
    pub fn active_ring_idx(&self) -> u32 {
        self.active.load(Ordering::Acquire)
    }

    /// The ring the producer currently writes into.
    #[inline]
    pub fn active_ring(&self) -> &RecordRing {
        &self.rings[self.active_ring_idx() as usize]
    }

    /// Publishes a new active ring index. Producer-only.
    #[inline]
    pub fn set_active_ring_idx(&self, idx: u32) {
        debug_assert!((idx as usize) < self.rings.len());
        self.active.store(idx, Ordering::Release);
    }

    /// This lane's backpressure state.
    #[inline]
    pub fn backpressure(&self) -> &BackpressureState {
        &self.backpressure
    }

    /// Pops a free ring index, or `None` when the pool is exhausted.
    #[inline]
    pub fn get_free_ring(&self) -> Option<u32> {
        self.free.pop()
    }

    /// Pushes `idx` back into the free queue.
    ///
    /// With correctly paired take/return calls the queue always has room, so
    /// `false` only signals transient CAS contention; callers that must not
    /// lose the ring retry (see the drain's bounded-yield-then-busy-wait).
    #[inline]
    pub fn return_ring(&self, idx: u32) -> bool {
        debug_assert!((idx as usize) < self.rings.len());
        self.free.push(idx)
    }

    /// Publishes `idx` to the drain.
    #[inline]
    pub fn submit_ring(&self, idx: u32) -> bool {
        debug_assert!((idx as usize) < self.rings.len());
        self.submitted.push(idx)
    }

    /// Pops the oldest submitted ring index, or `None` when none are pending.
    #[inline]
    pub fn take_ring(&self) -> Option<u32> {
        self.submitted.pop()
    }

    /// Snapshot of the free-queue depth.
    #[inline]
    pub fn free_len(&self) -> u32 {
        self.free.len()
    }

    /// Snapshot of the submitted-queue depth.
    #[inline]
    pub fn submitted_len(&self) -> u32 {
        self.submitted.len()
    }

    /// Submitted-queue depth from the raw monotonic counters, the value the
    /// metrics snapshot reports as queue depth. Clamped because the two
    /// counters are read at different instants.
    #[inline]
    pub fn submitted_depth(&self) -> u32 {
        self.submitted
            .tail()
            .wrapping_sub(self.submitted.head())
            .min(self.submitted.capacity())
    }
}
