//! Bounded lock-free queue of ring indices.
//!
//! # Design
//!
//! Array + monotonic head/tail counters with per-slot sequence numbers (the
//! Vyukov bounded-queue scheme, the same family as crossbeam's `ArrayQueue`).
//! Capacity is a power of two so index calculation is a bitwise AND. Values
//! are bare `u32` ring indices; the queue never owns heap data.
//!
//! Both lane queues are this type:
//!
//! - *free* queue: popped by the producer, pushed by the drain (and by the
//!   producer itself when it reclaims a ring under exhaustion), so the worst
//!   case has multiple pushers, hence CAS on both ends.
//! - *submitted* queue: pushed by the producer, popped by the drain.
//!
//! # Observability
//!
//! [`head`](IndexQueue::head) and [`tail`](IndexQueue::tail) expose the raw
//! monotonic counters so the metrics collector can compute queue depth as
//! `tail.wrapping_sub(head)` without touching the slots.
//!
//! # Ordering
//!
//! A slot's `seq` is the synchronization point: the pusher publishes the
//! value with a release store of `seq = pos + 1`; the popper acquires it,
//! reads the value, and releases the slot with `seq = pos + mask + 1`.
//! Head/tail themselves only need relaxed CAS: they hand out positions; the
//! sequence numbers carry the happens-before edges.
//!
//! # Safety
//!
//! `value` cells are plain `UnsafeCell<u32>`; the sequence protocol
//! guarantees exclusive access between the winning pusher and the winning
//! popper of each position.

#[cfg(not(loom))]
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(loom)]
use loom::sync::atomic::{AtomicU32, Ordering};

use std::cell::UnsafeCell;

use crossbeam_utils::CachePadded;

/// Returned by pop on an empty queue; never a valid ring index.
pub const INVALID_INDEX: u32 = u32::MAX;

struct Slot {
    seq: AtomicU32,
    value: UnsafeCell<u32>,
}

/// Bounded MPMC queue of `u32` indices with observable head/tail counters.
pub struct IndexQueue {
    slots: Box<[Slot]>,
    mask: u32,
    /// Pop side. Monotonic; wraps via `mask` in the slot accessor.
    head: CachePadded<AtomicU32>,
    /// Push side. Monotonic; wraps via `mask` in the slot accessor.
    tail: CachePadded<AtomicU32>,
}

// SAFETY: slot access is serialized by the per-slot sequence protocol; the
// atomics provide the required happens-before edges (see module docs).
unsafe impl Send for IndexQueue {}
unsafe impl Sync for IndexQueue {}

impl IndexQueue {
    /// Creates an empty queue able to hold `capacity` indices.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero, not a power of two, or above `1 << 16`
    /// (lane pools are small; a larger request indicates a config bug).
    pub fn new(capacity: u32) -> Self {
        assert!(capacity > 0, "IndexQueue capacity must be > 0");
        assert!(
            capacity.is_power_of_two(),
            "IndexQueue capacity must be a power of two"
        );
        assert!(capacity <= 1 << 16, "IndexQueue capacity out of range");

        let slots = (0..capacity)
            .map(|i| Slot {
                seq: AtomicU32::new(i),
                value: UnsafeCell::new(INVALID_INDEX),
            })
            .collect();

        Self {
            slots,
            mask: capacity - 1,
            head: CachePadded::new(AtomicU32::new(0)),
            tail: CachePadded::new(AtomicU32::new(0)),
        }
    }

    /// Number of slots.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.mask + 1
    }

    /// Attempts to enqueue `value`. Returns `false` when the queue is full.
    pub fn push(&self, value: u32) -> bool {
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[(tail & self.mask) as usize];
            let seq = slot.seq.load(Ordering::Acquire);
            let dif = seq.wrapping_sub(tail) as i32;

            if dif == 0 {
                match self.tail.compare_exchange_weak(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: winning the CAS for `tail` grants exclusive
                        // write access to this slot until the release store
                        // below publishes it.
                        unsafe { *slot.value.get() = value };
                        slot.seq.store(tail.wrapping_add(1), Ordering::Release);
                        return true;
                    }
                    Err(current) => tail = current,
                }
            } else if dif < 0 {
                // Slot still holds an unconsumed value from `mask + 1`
                // positions ago: the queue is full.
                return false;
            } else {
                tail = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Attempts to dequeue. Returns `None` when the queue is empty.
    pub fn pop(&self) -> Option<u32> {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[(head & self.mask) as usize];
            let seq = slot.seq.load(Ordering::Acquire);
            let dif = seq.wrapping_sub(head.wrapping_add(1)) as i32;

            if dif == 0 {
                match self.head.compare_exchange_weak(
                    head,
                    head.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: winning the CAS for `head` grants exclusive
                        // read access to this slot until the release store
                        // below recycles it.
                        let value = unsafe { *slot.value.get() };
                        slot.seq
                            .store(head.wrapping_add(self.mask).wrapping_add(1), Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => head = current,
                }
            } else if dif < 0 {
                return None;
            } else {
                head = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Snapshot of the number of queued indices.
    ///
    /// Racy by nature; suitable for metrics and backpressure sampling, not
    /// for correctness decisions.
    #[inline]
    pub fn len(&self) -> u32 {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head).min(self.capacity())
    }

    /// True when the snapshot length is zero.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw monotonic pop-side counter.
    #[inline]
    pub fn head(&self) -> u32 {
        self.head.load(Ordering::Relaxed)
    }

    /// Raw monotonic push-side counter.
    #[inline]
    pub fn tail(&self) -> u32 {
        self.tail.load(Ordering::Relaxed)
    }
}
