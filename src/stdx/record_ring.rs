//! SPSC byte ring holding fixed-size records.
//!
//! # Design
//!
//! One contiguous byte buffer carved into `capacity` slots of `record_size`
//! bytes. The header is two positions: `write_pos` (producer-owned) and
//! `read_pos` (consumer-owned), both slot indices wrapped with a power-of-two
//! mask. One slot is reserved so the positions disambiguate the boundary
//! states without a separate length field:
//!
//! - empty: `write_pos == read_pos`
//! - full:  `(write_pos + 1) & mask == read_pos`
//!
//! Usable slot count is therefore `capacity - 1`.
//!
//! # Concurrency
//!
//! Strictly single-producer/single-consumer: the owning application thread
//! calls [`write`](RecordRing::write), the drain thread calls
//! [`read_oldest`](RecordRing::read_oldest) / [`drop_oldest`](RecordRing::drop_oldest).
//! While a ring sits in a lane's free or submitted queue exactly one side
//! touches it, so the roles never overlap on the same slot.
//!
//! # Ordering rationale
//!
//! ```text
//! Producer fills slot, Release-stores write_pos  →  consumer Acquire-loads write_pos, reads slot
//! Consumer reads slot, Release-stores read_pos   →  producer Acquire-loads read_pos, reuses slot
//! ```
//!
//! Same protocol as the generic SPSC ring; positions here wrap at `capacity`
//! rather than running monotonically, which is what makes the one-slot
//! reserve necessary.
//!
//! # Safety
//!
//! Storage is an `UnsafeCell<Box<[u8]>>`; the position protocol above is the
//! entire justification for the unchecked shared access. `reset` is the one
//! exception: it touches both positions and is only sound on a quiescent
//! ring (one the caller holds exclusively, e.g. a ring the drain has taken
//! from the submitted queue).

#[cfg(not(loom))]
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(loom)]
use loom::sync::atomic::{AtomicU32, Ordering};

use std::cell::UnsafeCell;

use crossbeam_utils::CachePadded;

/// Point-in-time copy of a ring's header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingHeader {
    /// Slot count, power of two.
    pub capacity: u32,
    /// Bytes per record, fixed at construction.
    pub record_size: u32,
    pub write_pos: u32,
    pub read_pos: u32,
}

/// Fixed-capacity SPSC ring of fixed-size records.
pub struct RecordRing {
    storage: UnsafeCell<Box<[u8]>>,
    capacity: u32,
    record_size: u32,
    write_pos: CachePadded<AtomicU32>,
    read_pos: CachePadded<AtomicU32>,
}

// SAFETY: the SPSC position protocol (module docs) serializes access to every
// slot; only the producer advances write_pos and only the consumer advances
// read_pos.
unsafe impl Send for RecordRing {}
unsafe impl Sync for RecordRing {}

impl RecordRing {
    /// Creates a ring with `capacity` slots of `record_size` bytes each.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a power of two, is < 2, or if
    /// `record_size` is zero. These are construction-time configuration
    /// errors, not runtime conditions.
    pub fn new(capacity: u32, record_size: u32) -> Self {
        assert!(capacity >= 2, "RecordRing capacity must be >= 2");
        assert!(
            capacity.is_power_of_two(),
            "RecordRing capacity must be a power of two"
        );
        assert!(record_size > 0, "RecordRing record size must be > 0");

        let bytes = capacity as usize * record_size as usize;
        Self {
            storage: UnsafeCell::new(vec![0u8; bytes].into_boxed_slice()),
            capacity,
            record_size,
            write_pos: CachePadded::new(AtomicU32::new(0)),
            read_pos: CachePadded::new(AtomicU32::new(0)),
        }
    }

    #[inline]
    fn mask(&self) -> u32 {
        self.capacity - 1
    }

    /// Bytes per record.
    #[inline]
    pub fn record_size(&self) -> u32 {
        self.record_size
    }

    /// Slot count (one slot is reserved; see module docs).
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Records a producer could still write before the ring is full.
    #[inline]
    pub fn remaining(&self) -> u32 {
        self.capacity - 1 - self.len()
    }

    /// Records currently pending between the positions.
    #[inline]
    pub fn len(&self) -> u32 {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        write.wrapping_sub(read) & self.mask()
    }

    /// True when no records are pending.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when one more write would collide with the reserve slot.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity - 1
    }

    /// Snapshot of the header fields.
    pub fn header(&self) -> RingHeader {
        RingHeader {
            capacity: self.capacity,
            record_size: self.record_size,
            write_pos: self.write_pos.load(Ordering::Acquire),
            read_pos: self.read_pos.load(Ordering::Acquire),
        }
    }

    /// Copies one record into the ring. Producer-only.
    ///
    /// Returns `false` when the ring is full or `payload` is not exactly
    /// `record_size` bytes; the caller decides whether to swap rings or drop.
    pub fn write(&self, payload: &[u8]) -> bool {
        if payload.len() != self.record_size as usize {
            return false;
        }

        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);
        if write.wrapping_add(1) & self.mask() == read {
            return false;
        }

        let at = (write & self.mask()) as usize * self.record_size as usize;
        // SAFETY: the slot at `write` is outside [read, write), so the
        // consumer will not touch it until the release store below.
        unsafe {
            let storage = &mut *self.storage.get();
            storage[at..at + payload.len()].copy_from_slice(payload);
        }

        self.write_pos
            .store(write.wrapping_add(1) & self.mask(), Ordering::Release);
        true
    }

    /// Copies the oldest record into `out`. Consumer-only.
    ///
    /// Returns `false` when the ring is empty or `out` is shorter than one
    /// record. On success exactly `record_size` bytes of `out` are written.
    pub fn read_oldest(&self, out: &mut [u8]) -> bool {
        if out.len() < self.record_size as usize {
            return false;
        }

        let read = self.read_pos.load(Ordering::Relaxed);
        let write = self.write_pos.load(Ordering::Acquire);
        if read == write {
            return false;
        }

        let at = (read & self.mask()) as usize * self.record_size as usize;
        // SAFETY: the slot at `read` is inside [read, write); the producer
        // will not overwrite it until the release store below frees it.
        unsafe {
            let storage = &*self.storage.get();
            out[..self.record_size as usize]
                .copy_from_slice(&storage[at..at + self.record_size as usize]);
        }

        self.read_pos
            .store(read.wrapping_add(1) & self.mask(), Ordering::Release);
        true
    }

    /// Discards the oldest record without copying. Consumer-only.
    ///
    /// Returns `false` when the ring is empty.
    pub fn drop_oldest(&self) -> bool {
        let read = self.read_pos.load(Ordering::Relaxed);
        let write = self.write_pos.load(Ordering::Acquire);
        if read == write {
            return false;
        }
        self.read_pos
            .store(read.wrapping_add(1) & self.mask(), Ordering::Release);
        true
    }

    /// Restores both positions to zero.
    ///
    /// Only sound on a quiescent ring: the caller must hold it exclusively
    /// (neither producer nor consumer role active elsewhere).
    pub fn reset(&self) {
        self.write_pos.store(0, Ordering::Release);
        self.read_pos.store(0, Ordering::Release);
    }
}
