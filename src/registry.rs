//! Bounded registry of traced threads.
//!
//! # Design
//!
//! A fixed-capacity slot table owned by the registry in one allocation; every
//! slot carries its pair of lanes and its metrics for the registry's whole
//! lifetime, and threads claim/release slots by CAS on a per-slot `used`
//! flag. Slots are referenced by small indices that stay valid across reuse
//! because release is gated on lane quiescence: a new occupant always starts
//! with empty rings and zeroed counters.
//!
//! # Concurrency
//!
//! - `register`/`unregister` race freely between threads; the `used` CAS is
//!   the claim point (acquire/release so the new owner sees the cleaned slot).
//! - Slot contents are written by the owning thread, read by the drain and
//!   the reporter.
//! - The process-wide current registry is a mutex-protected `Arc`; the
//!   per-thread binding is a TLS handle whose `Drop` unregisters, so thread
//!   exit releases the slot without any external bookkeeping.

use crate::backpressure::BackpressureConfig;
use crate::event::{DetailEvent, IndexEvent, DETAIL_EVENT_SIZE, INDEX_EVENT_SIZE};
use crate::lane::{Lane, LaneConfig, LaneKind};
use crate::metrics::thread::ThreadMetrics;
use crate::pool::RingPool;
use crate::stdx::RingHeader;

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Compile-time upper bound on registry capacity.
pub const MAX_THREADS: usize = 64;

/// Sizing for a registry and the lanes of every slot.
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    /// Slot count; immutable after creation, at most [`MAX_THREADS`].
    pub capacity: u32,
    pub index_lane: LaneConfig,
    pub detail_lane: LaneConfig,
    pub backpressure: BackpressureConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capacity: 16,
            index_lane: LaneConfig {
                rings: 4,
                ring_capacity: 256,
                record_size: INDEX_EVENT_SIZE as u32,
            },
            detail_lane: LaneConfig {
                rings: 4,
                ring_capacity: 64,
                record_size: DETAIL_EVENT_SIZE as u32,
            },
            backpressure: BackpressureConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// Validates the configuration.
    ///
    /// # Panics
    ///
    /// Panics on a zero or over-bound capacity or invalid lane sizing.
    pub fn validate(&self) {
        assert!(self.capacity > 0, "registry capacity must be > 0");
        assert!(
            self.capacity as usize <= MAX_THREADS,
            "registry capacity exceeds MAX_THREADS"
        );
        self.index_lane.validate();
        self.detail_lane.validate();
    }
}

/// The two lanes of one registered thread.
pub struct ThreadLaneSet {
    index: Lane,
    detail: Lane,
}

impl ThreadLaneSet {
    fn new(config: &RegistryConfig) -> Self {
        Self {
            index: Lane::new(LaneKind::Index, config.index_lane, config.backpressure),
            detail: Lane::new(LaneKind::Detail, config.detail_lane, config.backpressure),
        }
    }

    #[inline]
    pub fn index_lane(&self) -> &Lane {
        &self.index
    }

    #[inline]
    pub fn detail_lane(&self) -> &Lane {
        &self.detail
    }

    #[inline]
    pub fn lane(&self, kind: LaneKind) -> &Lane {
        match kind {
            LaneKind::Index => &self.index,
            LaneKind::Detail => &self.detail,
        }
    }
}

struct ThreadSlot {
    used: AtomicBool,
    thread_id: AtomicU32,
    lanes: ThreadLaneSet,
    metrics: ThreadMetrics,
}

/// Fixed-capacity table mapping thread identity to lanes and metrics.
pub struct ThreadRegistry {
    slots: Box<[ThreadSlot]>,
    config: RegistryConfig,
}

impl ThreadRegistry {
    /// Allocates the registry and every slot's lanes up front.
    pub fn new(config: RegistryConfig) -> Self {
        config.validate();
        let slots = (0..config.capacity)
            .map(|_| ThreadSlot {
                used: AtomicBool::new(false),
                thread_id: AtomicU32::new(0),
                lanes: ThreadLaneSet::new(&config),
                metrics: ThreadMetrics::new(),
            })
            .collect();
        Self { slots, config }
    }

    /// Slot count fixed at creation.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    /// The configuration the registry was built with.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Claims the first empty slot for `thread_id`.
    ///
    /// Returns the slot index, or `None` when the table is full; the caller
    /// must then silently drop this thread's events.
    pub fn register(&self, thread_id: u32) -> Option<u32> {
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot
                .used
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                slot.thread_id.store(thread_id, Ordering::Relaxed);
                slot.metrics.reset();
                return Some(idx as u32);
            }
        }
        None
    }

    /// Releases a slot after quiescing its lanes.
    ///
    /// Must be called by (or on behalf of) the slot's owner after its last
    /// write. A partially filled active ring is submitted first so a running
    /// drain persists the tail, then the call waits (bounded) for the drain
    /// to bring every ring home; past the bound the caller reclaims the
    /// leftovers itself, so release cannot deadlock when no drain thread is
    /// running. Either way the next `register` sees empty rings.
    pub fn unregister(&self, slot_idx: u32) {
        let Some(slot) = self.slots.get(slot_idx as usize) else {
            return;
        };
        if !slot.used.load(Ordering::Acquire) {
            return;
        }

        for kind in [LaneKind::Index, LaneKind::Detail] {
            let lane = slot.lanes.lane(kind);

            // Hand the partial active ring to the drain. The owner is done
            // writing, so this is the producer side's final submit.
            if !lane.active_ring().is_empty() {
                let mut replaced = false;
                for _ in 0..1_000 {
                    if let Some(next) = lane.get_free_ring() {
                        let prev = lane.active_ring_idx();
                        lane.set_active_ring_idx(next);
                        while !lane.submit_ring(prev) {
                            std::thread::yield_now();
                        }
                        replaced = true;
                        break;
                    }
                    std::thread::yield_now();
                }
                if !replaced {
                    // No capacity to hand the tail over: drop and count.
                    while lane.active_ring().drop_oldest() {
                        slot.metrics.record_drop();
                    }
                }
            }

            // Give an active drain a chance to finish the in-flight rings.
            let home = lane.ring_count() - 1;
            for _ in 0..1_000 {
                if lane.submitted_len() == 0 && lane.free_len() == home {
                    break;
                }
                std::thread::yield_now();
            }

            // Self-reclaim whatever is still submitted.
            while let Some(idx) = lane.take_ring() {
                if let Some(ring) = lane.ring(idx) {
                    ring.reset();
                }
                while !lane.return_ring(idx) {
                    std::thread::yield_now();
                }
            }

            // Anything still in the active ring dies with the owner.
            lane.active_ring().reset();
        }

        slot.thread_id.store(0, Ordering::Relaxed);
        slot.used.store(false, Ordering::Release);
    }

    /// Whether slot `idx` is currently claimed.
    #[inline]
    pub fn is_used(&self, idx: u32) -> bool {
        self.slots
            .get(idx as usize)
            .map(|s| s.used.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Thread identity recorded in slot `idx`, if claimed.
    pub fn thread_id_at(&self, idx: u32) -> Option<u32> {
        let slot = self.slots.get(idx as usize)?;
        if !slot.used.load(Ordering::Acquire) {
            return None;
        }
        Some(slot.thread_id.load(Ordering::Relaxed))
    }

    /// Lane set of slot `idx`, if claimed.
    pub fn lanes_at(&self, idx: u32) -> Option<&ThreadLaneSet> {
        let slot = self.slots.get(idx as usize)?;
        if !slot.used.load(Ordering::Acquire) {
            return None;
        }
        Some(&slot.lanes)
    }

    /// Metrics of slot `idx`, if claimed.
    pub fn metrics_at(&self, idx: u32) -> Option<&ThreadMetrics> {
        let slot = self.slots.get(idx as usize)?;
        if !slot.used.load(Ordering::Acquire) {
            return None;
        }
        Some(&slot.metrics)
    }

    /// Header snapshot of one ring, addressed by slot, lane, and ring index.
    pub fn ring_header(&self, slot_idx: u32, kind: LaneKind, ring_idx: u32) -> Option<RingHeader> {
        let lanes = self.lanes_at(slot_idx)?;
        lanes.lane(kind).ring(ring_idx).map(|r| r.header())
    }

    /// Number of currently claimed slots.
    pub fn active_count(&self) -> u32 {
        self.slots
            .iter()
            .filter(|s| s.used.load(Ordering::Acquire))
            .count() as u32
    }
}

// ============================================================================
// Process-wide binding + TLS handles
// ============================================================================

static CURRENT: Mutex<Option<Arc<ThreadRegistry>>> = Mutex::new(None);
static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

/// Serializes tests that rebind the process-wide registry.
#[cfg(test)]
pub(crate) static BINDING_TEST_LOCK: Mutex<()> = Mutex::new(());

thread_local! {
    static TLS_HANDLE: RefCell<Option<ThreadHandle>> = const { RefCell::new(None) };
}

/// Binds `registry` as the process-wide registry used by the TLS accessors.
///
/// Replaces any previous binding; handles already bound to the old registry
/// keep it alive until their threads exit.
pub fn attach(registry: Arc<ThreadRegistry>) {
    *CURRENT.lock().expect("registry binding poisoned") = Some(registry);
}

/// Clears the process-wide binding.
pub fn detach() {
    *CURRENT.lock().expect("registry binding poisoned") = None;
}

/// The currently attached registry, if any.
pub fn current() -> Option<Arc<ThreadRegistry>> {
    CURRENT.lock().expect("registry binding poisoned").clone()
}

/// A thread's claim on a registry slot. Dropping it releases the slot.
pub struct ThreadHandle {
    registry: Arc<ThreadRegistry>,
    slot: u32,
    thread_id: u32,
    call_depth: std::cell::Cell<u32>,
    detail_seq: std::cell::Cell<u32>,
}

impl ThreadHandle {
    /// Registers the calling thread with `registry`.
    ///
    /// Returns `None` when the slot table is full.
    pub fn register_with(registry: Arc<ThreadRegistry>) -> Option<Self> {
        let thread_id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        let slot = registry.register(thread_id)?;
        Some(Self {
            registry,
            slot,
            thread_id,
            call_depth: std::cell::Cell::new(0),
            detail_seq: std::cell::Cell::new(0),
        })
    }

    #[inline]
    pub fn slot(&self) -> u32 {
        self.slot
    }

    #[inline]
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    #[inline]
    pub fn registry(&self) -> &Arc<ThreadRegistry> {
        &self.registry
    }

    fn lanes(&self) -> &ThreadLaneSet {
        // The handle holds the claim, so the slot stays valid and used.
        self.registry
            .lanes_at(self.slot)
            .expect("claimed slot must expose its lanes")
    }

    fn metrics(&self) -> &ThreadMetrics {
        self.registry
            .metrics_at(self.slot)
            .expect("claimed slot must expose its metrics")
    }

    /// Current nesting depth as maintained by enter/exit recording.
    #[inline]
    pub fn call_depth(&self) -> u32 {
        self.call_depth.get()
    }

    /// Writes one index-lane event.
    pub fn write_index_event(&self, event: &IndexEvent) -> bool {
        let lanes = self.lanes();
        let pool = RingPool::new(lanes.index_lane(), self.metrics());
        pool.write_record(&event.to_bytes())
    }

    /// Writes one detail-lane event; returns the sequence number an index
    /// event can link to, or `None` when the record was dropped.
    pub fn write_detail_event(&self, event: &DetailEvent) -> Option<u32> {
        let lanes = self.lanes();
        let pool = RingPool::new(lanes.detail_lane(), self.metrics());
        if !pool.write_record(&event.to_bytes()) {
            return None;
        }
        let seq = self.detail_seq.get();
        self.detail_seq.set(seq.wrapping_add(1));
        Some(seq)
    }

    /// Bumps the depth for a function entry; returns the depth to record.
    pub fn push_depth(&self) -> u32 {
        let depth = self.call_depth.get();
        self.call_depth.set(depth.saturating_add(1));
        depth
    }

    /// Drops the depth for a function exit; returns the depth to record.
    pub fn pop_depth(&self) -> u32 {
        let depth = self.call_depth.get().saturating_sub(1);
        self.call_depth.set(depth);
        depth
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        self.registry.unregister(self.slot);
    }
}

/// Runs `f` with the calling thread's handle on the attached registry,
/// registering lazily on first use.
///
/// Returns `None` when no registry is attached or the slot table is full;
/// callers treat that as "drop this event".
pub fn with_thread_handle<R>(f: impl FnOnce(&ThreadHandle) -> R) -> Option<R> {
    TLS_HANDLE.with(|cell| {
        let mut borrow = cell.borrow_mut();

        // Re-register when the process binding changed since last use.
        let registry = current()?;
        let stale = match borrow.as_ref() {
            Some(handle) => !Arc::ptr_eq(handle.registry(), &registry),
            None => true,
        };
        if stale {
            *borrow = ThreadHandle::register_with(registry);
        }

        borrow.as_ref().map(f)
    })
}

/// Drops the calling thread's TLS handle, releasing its slot immediately.
pub fn release_thread_handle() {
    TLS_HANDLE.with(|cell| {
        cell.borrow_mut().take();
    });
}
