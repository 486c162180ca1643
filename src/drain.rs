//! The single drain thread: moves submitted rings to the writer and back.
//!
//! # Architecture
//!
//! ```text
//!                ┌───────────────────────────────────────────────┐
//!                │                  DrainThread                  │
//!   registry ────┼─► round-robin cursor ──► slot ──► index lane  │
//!                │        ▲                   │      detail lane │
//!                │        │                   ▼                  │
//!                │   next cycle          take_ring ──► writer    │
//!                │   starts one               │                  │
//!                │   slot later          reset + return_ring     │
//!                └───────────────────────────────────────────────┘
//! ```
//!
//! One background worker polls every registered thread's lanes, hands each
//! submitted ring to the [`RingWriter`] collaborator, then resets and returns
//! it to the lane's free queue. Per-lane batches are capped by
//! `min(max_batch_size, fairness_quantum)` so one busy thread cannot starve
//! the rest; the round-robin start slot advances by one each cycle for the
//! same reason.
//!
//! # Lifecycle
//!
//! ```text
//! Initialized ──start──► Running ──stop──► Stopping ──final passes──► Stopped
//! ```
//!
//! State moves by CAS; a lifecycle mutex serializes external `start`/`stop`.
//! On `Stopping` the worker keeps cycling with an unbounded batch limit until
//! a full pass finds no work, which guarantees no submitted ring is left
//! unprocessed when `stop` returns.
//!
//! # Failure semantics
//!
//! `return_ring` is retried with yields up to a bound and then busy-waits:
//! losing the push would silently shrink the lane's pool, which is strictly
//! worse than burning a core on what is always a transient CAS race.

use crate::clock;
use crate::lane::{Lane, LaneKind};
use crate::registry::{ThreadRegistry, MAX_THREADS};
use crate::stdx::RecordRing;

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Consumes rings the drain takes from submitted queues.
///
/// Implementations run on the drain thread only. A writer is expected to
/// consume every pending record (via [`RecordRing::read_oldest`]); whatever
/// it leaves behind is discarded when the drain resets the ring.
pub trait RingWriter: Send + Sync + 'static {
    fn process_ring(&self, slot: u32, thread_id: u32, kind: LaneKind, ring: &RecordRing);
}

/// Writer that throws records away; used by tests and benchmarks.
pub struct DiscardWriter;

impl RingWriter for DiscardWriter {
    fn process_ring(&self, _slot: u32, _thread_id: u32, _kind: LaneKind, ring: &RecordRing) {
        while ring.drop_oldest() {}
    }
}

/// Drain worker configuration.
#[derive(Debug, Clone, Copy)]
pub struct DrainConfig {
    /// Idle sleep when `yield_on_idle` is false. Zero disables sleeping.
    pub poll_interval_us: u64,
    /// Max rings per lane per cycle. Zero falls back to the quantum.
    pub max_batch_size: u32,
    /// Fairness cap per lane per cycle. Zero means uncapped.
    pub fairness_quantum: u32,
    /// Yield instead of sleeping on idle cycles.
    pub yield_on_idle: bool,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            poll_interval_us: 1_000,
            max_batch_size: 8,
            fairness_quantum: 8,
            yield_on_idle: false,
        }
    }
}

/// Lifecycle states of the drain worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DrainState {
    Uninitialized = 0,
    Initialized = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
}

impl DrainState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Initialized,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Stopped,
            _ => Self::Uninitialized,
        }
    }
}

/// Errors from the drain lifecycle entry points.
#[derive(Debug)]
#[non_exhaustive]
pub enum DrainError {
    /// `start` after the worker already ran to completion.
    AlreadyStopped,
    /// The OS refused to spawn the worker thread.
    Spawn(io::Error),
}

impl fmt::Display for DrainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyStopped => write!(f, "drain thread already stopped"),
            Self::Spawn(err) => write!(f, "failed to spawn drain thread: {err}"),
        }
    }
}

impl std::error::Error for DrainError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn(err) => Some(err),
            _ => None,
        }
    }
}

/// Snapshot of the drain worker's counters.
#[derive(Debug, Clone, Default)]
pub struct DrainMetrics {
    pub cycles_total: u64,
    pub cycles_idle: u64,
    pub rings_total: u64,
    pub rings_index: u64,
    pub rings_detail: u64,
    pub fairness_switches: u64,
    pub sleeps: u64,
    pub yields: u64,
    pub final_drains: u64,
    pub total_sleep_us: u64,
    /// Rings drained per slot, `[slot][0]` index lane, `[slot][1]` detail.
    pub per_thread_rings: Vec<[u64; 2]>,
}

struct DrainMetricsAtomic {
    cycles_total: AtomicU64,
    cycles_idle: AtomicU64,
    rings_total: AtomicU64,
    rings_index: AtomicU64,
    rings_detail: AtomicU64,
    fairness_switches: AtomicU64,
    sleeps: AtomicU64,
    yields: AtomicU64,
    final_drains: AtomicU64,
    total_sleep_us: AtomicU64,
    per_thread_rings: Vec<[AtomicU64; 2]>,
}

impl DrainMetricsAtomic {
    fn new() -> Self {
        Self {
            cycles_total: AtomicU64::new(0),
            cycles_idle: AtomicU64::new(0),
            rings_total: AtomicU64::new(0),
            rings_index: AtomicU64::new(0),
            rings_detail: AtomicU64::new(0),
            fairness_switches: AtomicU64::new(0),
            sleeps: AtomicU64::new(0),
            yields: AtomicU64::new(0),
            final_drains: AtomicU64::new(0),
            total_sleep_us: AtomicU64::new(0),
            per_thread_rings: (0..MAX_THREADS)
                .map(|_| [AtomicU64::new(0), AtomicU64::new(0)])
                .collect(),
        }
    }

    fn snapshot(&self) -> DrainMetrics {
        DrainMetrics {
            cycles_total: self.cycles_total.load(Ordering::Relaxed),
            cycles_idle: self.cycles_idle.load(Ordering::Relaxed),
            rings_total: self.rings_total.load(Ordering::Relaxed),
            rings_index: self.rings_index.load(Ordering::Relaxed),
            rings_detail: self.rings_detail.load(Ordering::Relaxed),
            fairness_switches: self.fairness_switches.load(Ordering::Relaxed),
            sleeps: self.sleeps.load(Ordering::Relaxed),
            yields: self.yields.load(Ordering::Relaxed),
            final_drains: self.final_drains.load(Ordering::Relaxed),
            total_sleep_us: self.total_sleep_us.load(Ordering::Relaxed),
            per_thread_rings: self
                .per_thread_rings
                .iter()
                .map(|pair| [pair[0].load(Ordering::Relaxed), pair[1].load(Ordering::Relaxed)])
                .collect(),
        }
    }
}

struct DrainShared {
    registry: Arc<ThreadRegistry>,
    writer: Arc<dyn RingWriter>,
    config: DrainConfig,
    state: AtomicU32,
    rr_cursor: AtomicU32,
    last_cycle_ns: AtomicU64,
    metrics: DrainMetricsAtomic,
}

/// Handle to the single background drain worker.
pub struct DrainThread {
    shared: Arc<DrainShared>,
    lifecycle: Mutex<Option<JoinHandle<()>>>,
}

impl DrainThread {
    /// Creates a drain in the `Initialized` state; no thread runs yet.
    pub fn new(
        registry: Arc<ThreadRegistry>,
        writer: Arc<dyn RingWriter>,
        config: DrainConfig,
    ) -> Self {
        Self {
            shared: Arc::new(DrainShared {
                registry,
                writer,
                config,
                state: AtomicU32::new(DrainState::Initialized as u32),
                rr_cursor: AtomicU32::new(0),
                last_cycle_ns: AtomicU64::new(clock::now_ns()),
                metrics: DrainMetricsAtomic::new(),
            }),
            lifecycle: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DrainState {
        DrainState::from_raw(self.shared.state.load(Ordering::Acquire))
    }

    /// Snapshot of the worker's counters.
    pub fn metrics(&self) -> DrainMetrics {
        self.shared.metrics.snapshot()
    }

    /// Monotonic timestamp of the last completed cycle.
    pub fn last_cycle_ns(&self) -> u64 {
        self.shared.last_cycle_ns.load(Ordering::Relaxed)
    }

    /// Starts the worker. Idempotent while running; an exhausted drain
    /// (stopping or stopped) reports [`DrainError::AlreadyStopped`].
    pub fn start(&self) -> Result<(), DrainError> {
        let mut handle = self.lifecycle.lock().expect("drain lifecycle poisoned");

        let initialized = DrainState::Initialized as u32;
        match self.shared.state.compare_exchange(
            initialized,
            DrainState::Running as u32,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(observed) => {
                return match DrainState::from_raw(observed) {
                    DrainState::Running => Ok(()),
                    _ => Err(DrainError::AlreadyStopped),
                };
            }
        }

        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("trace-drain".into())
            .spawn(move || worker_main(shared));

        match spawned {
            Ok(join) => {
                *handle = Some(join);
                tracing::debug!("drain thread started");
                Ok(())
            }
            Err(err) => {
                self.shared
                    .state
                    .store(DrainState::Initialized as u32, Ordering::Release);
                Err(DrainError::Spawn(err))
            }
        }
    }

    /// Stops the worker and joins it.
    ///
    /// Blocks until the final passes have drained every submitted ring.
    /// Safe to call repeatedly and on a never-started drain.
    pub fn stop(&self) {
        let mut handle = self.lifecycle.lock().expect("drain lifecycle poisoned");

        match self.state() {
            DrainState::Initialized | DrainState::Uninitialized => return,
            DrainState::Running => {
                self.shared
                    .state
                    .store(DrainState::Stopping as u32, Ordering::Release);
            }
            DrainState::Stopping | DrainState::Stopped => {}
        }

        if let Some(join) = handle.take() {
            if join.join().is_err() {
                tracing::warn!("drain thread panicked before join");
            }
            tracing::debug!("drain thread stopped");
        }
    }
}

impl Drop for DrainThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_main(shared: Arc<DrainShared>) {
    while DrainState::from_raw(shared.state.load(Ordering::Acquire)) == DrainState::Running {
        let work = drain_cycle(&shared, false);
        shared.metrics.cycles_total.fetch_add(1, Ordering::Relaxed);
        if !work {
            shared.metrics.cycles_idle.fetch_add(1, Ordering::Relaxed);
            if shared.config.yield_on_idle {
                std::thread::yield_now();
                shared.metrics.yields.fetch_add(1, Ordering::Relaxed);
            } else if shared.config.poll_interval_us > 0 {
                std::thread::sleep(Duration::from_micros(shared.config.poll_interval_us));
                shared.metrics.sleeps.fetch_add(1, Ordering::Relaxed);
                shared
                    .metrics
                    .total_sleep_us
                    .fetch_add(shared.config.poll_interval_us, Ordering::Relaxed);
            }
        }
    }

    // Final passes: unbounded batches until a cycle finds nothing.
    shared.metrics.final_drains.fetch_add(1, Ordering::Relaxed);
    loop {
        let work = drain_cycle(&shared, true);
        shared.metrics.cycles_total.fetch_add(1, Ordering::Relaxed);
        if !work {
            break;
        }
    }

    shared
        .state
        .store(DrainState::Stopped as u32, Ordering::Release);
}

fn effective_limit(config: &DrainConfig, final_pass: bool) -> u32 {
    if final_pass {
        return u32::MAX;
    }
    let mut limit = config.max_batch_size;
    let quantum = config.fairness_quantum;
    if limit == 0 {
        limit = quantum;
    } else if quantum > 0 && quantum < limit {
        limit = quantum;
    }
    if limit == 0 {
        return u32::MAX;
    }
    limit
}

fn return_ring_to_producer(lane: &Lane, ring_idx: u32) {
    for _ in 0..1_000 {
        if lane.return_ring(ring_idx) {
            return;
        }
        std::thread::yield_now();
    }
    // Last resort: the ring must not be lost.
    tracing::warn!(ring_idx, "return_ring still contended; busy-waiting");
    while !lane.return_ring(ring_idx) {
        std::thread::yield_now();
    }
}

/// Drains one lane up to the effective limit. Returns (processed, hit_limit).
fn drain_lane(
    shared: &DrainShared,
    slot: u32,
    thread_id: u32,
    lane: &Lane,
    final_pass: bool,
) -> (u32, bool) {
    let limit = effective_limit(&shared.config, final_pass);
    let is_detail = lane.kind() == LaneKind::Detail;
    let mut processed = 0u32;

    while processed < limit {
        let Some(ring_idx) = lane.take_ring() else {
            break;
        };
        let ring = lane
            .ring(ring_idx)
            .expect("submitted queue only holds valid indices");

        shared.writer.process_ring(slot, thread_id, lane.kind(), ring);
        ring.reset();
        return_ring_to_producer(lane, ring_idx);
        processed += 1;
    }

    let hit_limit = limit != u32::MAX && processed == limit;

    if processed > 0 {
        let metrics = &shared.metrics;
        metrics
            .rings_total
            .fetch_add(processed as u64, Ordering::Relaxed);
        if is_detail {
            metrics
                .rings_detail
                .fetch_add(processed as u64, Ordering::Relaxed);
        } else {
            metrics
                .rings_index
                .fetch_add(processed as u64, Ordering::Relaxed);
        }
        if let Some(pair) = metrics.per_thread_rings.get(slot as usize) {
            pair[usize::from(is_detail)].fetch_add(processed as u64, Ordering::Relaxed);
        }
    }

    (processed, hit_limit)
}

/// One pass over every slot. Returns whether any ring was processed.
fn drain_cycle(shared: &DrainShared, final_pass: bool) -> bool {
    let capacity = shared.registry.capacity();
    if capacity == 0 {
        return false;
    }

    let mut start = shared.rr_cursor.load(Ordering::Relaxed);
    if start >= capacity {
        start = 0;
    }

    let mut work_done = false;

    for offset in 0..capacity {
        let slot = (start + offset) % capacity;
        let Some(lanes) = shared.registry.lanes_at(slot) else {
            continue;
        };
        let thread_id = shared.registry.thread_id_at(slot).unwrap_or(0);

        for lane in [lanes.index_lane(), lanes.detail_lane()] {
            let (processed, hit_limit) = drain_lane(shared, slot, thread_id, lane, final_pass);
            if processed > 0 {
                work_done = true;
            }
            if hit_limit {
                shared
                    .metrics
                    .fairness_switches
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    shared
        .rr_cursor
        .store((start + 1) % capacity, Ordering::Relaxed);
    shared
        .last_cycle_ns
        .store(clock::now_ns(), Ordering::Relaxed);

    work_done
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::BackpressureConfig;
    use crate::lane::LaneConfig;
    use crate::registry::RegistryConfig;

    fn test_registry(capacity: u32) -> Arc<ThreadRegistry> {
        Arc::new(ThreadRegistry::new(RegistryConfig {
            capacity,
            index_lane: LaneConfig {
                rings: 4,
                ring_capacity: 8,
                record_size: 8,
            },
            detail_lane: LaneConfig {
                rings: 4,
                ring_capacity: 4,
                record_size: 16,
            },
            backpressure: BackpressureConfig::default(),
        }))
    }

    fn submit_one(lane: &Lane) {
        let idx = loop {
            match lane.get_free_ring() {
                Some(idx) => break idx,
                None => std::thread::yield_now(),
            }
        };
        lane.ring(idx).unwrap().write(&[7u8; 8]);
        while !lane.submit_ring(idx) {
            std::thread::yield_now();
        }
    }

    #[test]
    fn effective_limit_math() {
        let mut config = DrainConfig::default();
        config.max_batch_size = 8;
        config.fairness_quantum = 2;
        assert_eq!(effective_limit(&config, false), 2);
        assert_eq!(effective_limit(&config, true), u32::MAX);

        config.max_batch_size = 0;
        config.fairness_quantum = 5;
        assert_eq!(effective_limit(&config, false), 5);

        config.max_batch_size = 0;
        config.fairness_quantum = 0;
        assert_eq!(effective_limit(&config, false), u32::MAX);

        config.max_batch_size = 3;
        config.fairness_quantum = 0;
        assert_eq!(effective_limit(&config, false), 3);
    }

    #[test]
    fn lifecycle_states() {
        let registry = test_registry(2);
        let drain = DrainThread::new(registry, Arc::new(DiscardWriter), DrainConfig::default());
        assert_eq!(drain.state(), DrainState::Initialized);

        drain.start().unwrap();
        assert_eq!(drain.state(), DrainState::Running);
        // Second start while running is a no-op.
        drain.start().unwrap();

        drain.stop();
        assert_eq!(drain.state(), DrainState::Stopped);

        // Restart after stop is refused; stop stays idempotent.
        assert!(matches!(drain.start(), Err(DrainError::AlreadyStopped)));
        drain.stop();
        assert_eq!(drain.state(), DrainState::Stopped);
    }

    #[test]
    fn stop_without_start_is_a_noop() {
        let registry = test_registry(2);
        let drain = DrainThread::new(registry, Arc::new(DiscardWriter), DrainConfig::default());
        drain.stop();
        assert_eq!(drain.state(), DrainState::Initialized);
    }

    #[test]
    fn single_cycle_processes_and_returns_rings() {
        let registry = test_registry(2);
        let slot = registry.register(1).unwrap();
        let lanes = registry.lanes_at(slot).unwrap();
        submit_one(lanes.index_lane());
        submit_one(lanes.index_lane());

        let drain = DrainThread::new(
            Arc::clone(&registry),
            Arc::new(DiscardWriter),
            DrainConfig::default(),
        );
        let work = drain_cycle(&drain.shared, false);
        assert!(work);

        let metrics = drain.metrics();
        assert_eq!(metrics.rings_total, 2);
        assert_eq!(metrics.rings_index, 2);
        assert_eq!(metrics.rings_detail, 0);
        assert_eq!(metrics.per_thread_rings[slot as usize][0], 2);

        // Rings are home again and empty.
        assert_eq!(lanes.index_lane().free_len(), 3);
        assert_eq!(lanes.index_lane().submitted_len(), 0);
    }

    #[test]
    fn batch_limit_counts_fairness_switch() {
        let registry = test_registry(2);
        let slot = registry.register(1).unwrap();
        let lanes = registry.lanes_at(slot).unwrap();
        for _ in 0..3 {
            submit_one(lanes.index_lane());
        }

        let config = DrainConfig {
            max_batch_size: 2,
            fairness_quantum: 2,
            ..Default::default()
        };
        let drain = DrainThread::new(Arc::clone(&registry), Arc::new(DiscardWriter), config);

        let work = drain_cycle(&drain.shared, false);
        assert!(work);
        let metrics = drain.metrics();
        assert_eq!(metrics.rings_total, 2, "limit caps the batch");
        assert_eq!(metrics.fairness_switches, 1);

        drain_cycle(&drain.shared, false);
        assert_eq!(drain.metrics().rings_total, 3);
    }

    #[test]
    fn final_pass_ignores_limits() {
        let registry = test_registry(2);
        let slot = registry.register(1).unwrap();
        let lanes = registry.lanes_at(slot).unwrap();
        for _ in 0..3 {
            submit_one(lanes.index_lane());
        }

        let config = DrainConfig {
            max_batch_size: 1,
            fairness_quantum: 1,
            ..Default::default()
        };
        let drain = DrainThread::new(Arc::clone(&registry), Arc::new(DiscardWriter), config);
        drain_cycle(&drain.shared, true);
        assert_eq!(drain.metrics().rings_total, 3);
    }

    #[test]
    fn cursor_advances_each_cycle() {
        let registry = test_registry(4);
        let drain = DrainThread::new(registry, Arc::new(DiscardWriter), DrainConfig::default());
        assert_eq!(drain.shared.rr_cursor.load(Ordering::Relaxed), 0);
        drain_cycle(&drain.shared, false);
        assert_eq!(drain.shared.rr_cursor.load(Ordering::Relaxed), 1);
        for _ in 0..4 {
            drain_cycle(&drain.shared, false);
        }
        assert_eq!(drain.shared.rr_cursor.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn writer_sees_slot_thread_and_kind() {
        use std::sync::Mutex as StdMutex;

        struct Recorder(StdMutex<Vec<(u32, u32, LaneKind, u32)>>);
        impl RingWriter for Recorder {
            fn process_ring(&self, slot: u32, thread_id: u32, kind: LaneKind, ring: &RecordRing) {
                let mut records = 0;
                while ring.drop_oldest() {
                    records += 1;
                }
                self.0.lock().unwrap().push((slot, thread_id, kind, records));
            }
        }

        let registry = test_registry(2);
        let slot = registry.register(77).unwrap();
        let lanes = registry.lanes_at(slot).unwrap();
        submit_one(lanes.index_lane());

        let recorder = Arc::new(Recorder(StdMutex::new(Vec::new())));
        let drain = DrainThread::new(
            Arc::clone(&registry),
            Arc::clone(&recorder) as Arc<dyn RingWriter>,
            DrainConfig::default(),
        );
        drain_cycle(&drain.shared, false);

        let seen = recorder.0.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], (slot, 77, LaneKind::Index, 1));
    }

    #[test]
    fn idle_accounting_with_yield() {
        let registry = test_registry(2);
        let config = DrainConfig {
            yield_on_idle: true,
            ..Default::default()
        };
        let drain = DrainThread::new(registry, Arc::new(DiscardWriter), config);
        drain.start().unwrap();
        std::thread::sleep(Duration::from_millis(10));
        drain.stop();

        let metrics = drain.metrics();
        assert!(metrics.cycles_total > 0);
        assert!(metrics.cycles_idle > 0);
        assert!(metrics.yields > 0);
        assert_eq!(metrics.sleeps, 0);
        assert!(metrics.final_drains >= 1);
    }
}
