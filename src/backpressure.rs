//! Backpressure state machine over ring-pool occupancy.
//!
//! # Design
//!
//! One atomic mode word advanced only by CAS, plus relaxed counters. The
//! machine watches the free-ring count of one lane and moves through four
//! modes with hysteresis:
//!
//! ```text
//! NORMAL ──(free < P%)──► PRESSURE ──(free = 0 / exhaustion)──► DROPPING
//!   ▲                        │  ▲                                  │
//!   │(free ≥ P%)◄────────────┘  │(free < P%)                       │(free ≥ R%)
//!   │                           │                                  ▼
//!   └──(stable ≥ W ns)────── RECOVERY ◄────────────────────────────┘
//! ```
//!
//! Recovery only completes after the pool has held at or above the recovery
//! threshold for a full stable window `W` without dipping below the pressure
//! threshold; a dip restarts the cycle through PRESSURE. The gap between the
//! pressure threshold `P` and recovery threshold `R` (P < R) prevents mode
//! flapping at a single boundary.
//!
//! # Concurrency
//!
//! Samples arrive from the producer fast path; accessors run on the drain and
//! reporter threads. Every counter is a relaxed atomic; the mode moves only
//! through [`BackpressureState::transition`], a CAS keyed on the expected
//! mode, so a lost race leaves the machine in whatever the winner chose.
//!
//! # Logging
//!
//! Mode changes log at `trace!`; every `drop_log_interval`-th dropped event
//! (measured against the `events_dropped` counter) logs a rate line at
//! `info!`.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Default pressure threshold, percent of total rings.
pub const DEFAULT_PRESSURE_THRESHOLD: u32 = 25;
/// Default recovery threshold, percent of total rings.
pub const DEFAULT_RECOVERY_THRESHOLD: u32 = 50;
/// Default stable window before RECOVERY completes.
pub const DEFAULT_RECOVERY_STABLE_NS: u64 = 1_000_000_000;
/// Default drop-log cadence, in dropped events.
pub const DEFAULT_DROP_LOG_INTERVAL: u32 = 64;

/// Operating mode of a lane's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Mode {
    Normal = 0,
    Pressure = 1,
    Dropping = 2,
    Recovery = 3,
}

impl Mode {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Pressure,
            2 => Self::Dropping,
            3 => Self::Recovery,
            _ => Self::Normal,
        }
    }

    /// Stable display name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Pressure => "PRESSURE",
            Self::Dropping => "DROPPING",
            Self::Recovery => "RECOVERY",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Thresholds and cadences, immutable once a state is initialized with them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressureConfig {
    /// Free-ring percentage below which the pool is under pressure. (0, 100).
    pub pressure_threshold_percent: u32,
    /// Free-ring percentage at which recovery may begin. (pressure, 100].
    pub recovery_threshold_percent: u32,
    /// How long the pool must stay recovered before returning to NORMAL.
    pub recovery_stable_ns: u64,
    /// Emit a drop-rate log line every this many dropped events.
    pub drop_log_interval: u32,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            pressure_threshold_percent: DEFAULT_PRESSURE_THRESHOLD,
            recovery_threshold_percent: DEFAULT_RECOVERY_THRESHOLD,
            recovery_stable_ns: DEFAULT_RECOVERY_STABLE_NS,
            drop_log_interval: DEFAULT_DROP_LOG_INTERVAL,
        }
    }
}

impl BackpressureConfig {
    /// Reads overrides from `BP_PRESSURE_THRESHOLD`, `BP_RECOVERY_THRESHOLD`
    /// and `BP_DROP_LOG_INTERVAL`, then repairs the result with
    /// [`validate`](Self::validate). Unparseable values are ignored; invalid
    /// parsed values fall back to defaults silently.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(value) = parse_env_u32("BP_PRESSURE_THRESHOLD") {
            cfg.pressure_threshold_percent = value;
        }
        if let Some(value) = parse_env_u32("BP_RECOVERY_THRESHOLD") {
            cfg.recovery_threshold_percent = value;
        }
        if let Some(value) = parse_env_u32("BP_DROP_LOG_INTERVAL") {
            cfg.drop_log_interval = value;
        }

        cfg.validate();
        cfg
    }

    /// Repairs invalid fields in place. Returns `false` when anything had to
    /// be repaired so callers may log; the config is always usable afterward.
    ///
    /// Repair rules:
    /// - pressure outside (0, 100) → default pressure
    /// - recovery outside (0, 100] → default recovery
    /// - recovery ≤ pressure → recovery = pressure + 5, or full defaults for
    ///   both when pressure ≥ 95
    /// - zero drop-log interval or stable window → defaults
    pub fn validate(&mut self) -> bool {
        let defaults = Self::default();
        let mut valid = true;

        if self.pressure_threshold_percent == 0 || self.pressure_threshold_percent >= 100 {
            self.pressure_threshold_percent = defaults.pressure_threshold_percent;
            valid = false;
        }

        if self.recovery_threshold_percent == 0 || self.recovery_threshold_percent > 100 {
            self.recovery_threshold_percent = defaults.recovery_threshold_percent;
            valid = false;
        }

        if self.pressure_threshold_percent >= self.recovery_threshold_percent {
            if self.pressure_threshold_percent < 95 {
                self.recovery_threshold_percent = self.pressure_threshold_percent + 5;
            } else {
                self.pressure_threshold_percent = defaults.pressure_threshold_percent;
                self.recovery_threshold_percent = defaults.recovery_threshold_percent;
            }
            valid = false;
        }

        if self.drop_log_interval == 0 {
            self.drop_log_interval = defaults.drop_log_interval;
            valid = false;
        }

        if self.recovery_stable_ns == 0 {
            self.recovery_stable_ns = defaults.recovery_stable_ns;
            valid = false;
        }

        valid
    }
}

fn parse_env_u32(name: &str) -> Option<u32> {
    let raw = std::env::var(name).ok()?;
    if raw.is_empty() {
        return None;
    }
    raw.parse::<u32>().ok()
}

/// Point-in-time export of every backpressure counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressureMetrics {
    pub mode: Mode,
    pub transitions: u64,
    pub events_dropped: u64,
    pub bytes_dropped: u64,
    pub drop_sequences: u64,
    pub free_rings: u32,
    pub total_rings: u32,
    pub low_watermark: u32,
    pub last_drop_ns: u64,
    pub last_recovery_ns: u64,
    pub pressure_start_ns: u64,
}

/// Per-lane backpressure state.
pub struct BackpressureState {
    mode: AtomicU32,
    transitions: AtomicU64,

    events_dropped: AtomicU64,
    bytes_dropped: AtomicU64,
    drop_sequences: AtomicU64,

    free_rings: AtomicU32,
    total_rings: AtomicU32,
    low_watermark: AtomicU32,

    last_drop_ns: AtomicU64,
    last_recovery_ns: AtomicU64,
    pressure_start_ns: AtomicU64,
    recovery_candidate_ns: AtomicU64,

    config: BackpressureConfig,
}

impl BackpressureState {
    /// Creates a state in NORMAL with a validated copy of `config`.
    pub fn new(config: BackpressureConfig) -> Self {
        let mut effective = config;
        effective.validate();
        Self {
            mode: AtomicU32::new(Mode::Normal as u32),
            transitions: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            bytes_dropped: AtomicU64::new(0),
            drop_sequences: AtomicU64::new(0),
            free_rings: AtomicU32::new(0),
            total_rings: AtomicU32::new(0),
            low_watermark: AtomicU32::new(u32::MAX),
            last_drop_ns: AtomicU64::new(0),
            last_recovery_ns: AtomicU64::new(0),
            pressure_start_ns: AtomicU64::new(0),
            recovery_candidate_ns: AtomicU64::new(0),
            config: effective,
        }
    }

    /// The validated configuration this state runs with.
    pub fn config(&self) -> &BackpressureConfig {
        &self.config
    }

    /// Restores every counter and the mode to their initial values,
    /// preserving the configuration.
    pub fn reset(&self) {
        self.mode.store(Mode::Normal as u32, Ordering::Relaxed);
        self.transitions.store(0, Ordering::Relaxed);
        self.events_dropped.store(0, Ordering::Relaxed);
        self.bytes_dropped.store(0, Ordering::Relaxed);
        self.drop_sequences.store(0, Ordering::Relaxed);
        self.free_rings.store(0, Ordering::Relaxed);
        self.total_rings.store(0, Ordering::Relaxed);
        self.low_watermark.store(u32::MAX, Ordering::Relaxed);
        self.last_drop_ns.store(0, Ordering::Relaxed);
        self.last_recovery_ns.store(0, Ordering::Relaxed);
        self.pressure_start_ns.store(0, Ordering::Relaxed);
        self.recovery_candidate_ns.store(0, Ordering::Relaxed);
    }

    /// Binds the pool size the thresholds are computed against.
    ///
    /// Zero is ignored; storing the current value again is a no-op.
    pub fn set_total_rings(&self, total_rings: u32) {
        if total_rings == 0 {
            return;
        }
        if self.total_rings.load(Ordering::Relaxed) == total_rings {
            return;
        }
        self.total_rings.store(total_rings, Ordering::Relaxed);
    }

    /// Current mode.
    pub fn mode(&self) -> Mode {
        Mode::from_raw(self.mode.load(Ordering::Acquire))
    }

    /// Total events dropped since init or the last reset.
    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    /// Lowest free-ring count ever sampled; 0 when nothing sampled yet.
    pub fn low_watermark(&self) -> u32 {
        let low = self.low_watermark.load(Ordering::Relaxed);
        if low == u32::MAX {
            0
        } else {
            low
        }
    }

    /// Exports all counters as one snapshot.
    pub fn metrics(&self) -> BackpressureMetrics {
        BackpressureMetrics {
            mode: self.mode(),
            transitions: self.transitions.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            bytes_dropped: self.bytes_dropped.load(Ordering::Relaxed),
            drop_sequences: self.drop_sequences.load(Ordering::Relaxed),
            free_rings: self.free_rings.load(Ordering::Relaxed),
            total_rings: self.total_rings.load(Ordering::Relaxed),
            low_watermark: self.low_watermark(),
            last_drop_ns: self.last_drop_ns.load(Ordering::Relaxed),
            last_recovery_ns: self.last_recovery_ns.load(Ordering::Relaxed),
            pressure_start_ns: self.pressure_start_ns.load(Ordering::Relaxed),
        }
    }

    fn update_low_watermark(&self, free_rings: u32) {
        let mut low = self.low_watermark.load(Ordering::Relaxed);
        while free_rings < low {
            match self.low_watermark.compare_exchange_weak(
                low,
                free_rings,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => low = current,
            }
        }
    }

    fn total_effective(&self) -> u32 {
        let total = self.total_rings.load(Ordering::Relaxed);
        if total == 0 {
            1
        } else {
            total
        }
    }

    /// The only mode mutator: CAS from `expected` to `desired`.
    ///
    /// On success bumps `transitions`, stamps the timing fields the target
    /// mode owns, and logs the change. A lost race is silent: the machine is
    /// already somewhere else and the caller's condition no longer applies.
    pub fn transition(&self, expected: Mode, desired: Mode, now_ns: u64) {
        let mut current = self.mode.load(Ordering::Acquire);
        while current == expected as u32 {
            match self.mode.compare_exchange_weak(
                current,
                desired as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.transitions.fetch_add(1, Ordering::Relaxed);
                    match desired {
                        Mode::Pressure => {
                            self.pressure_start_ns.store(now_ns, Ordering::Relaxed);
                        }
                        Mode::Recovery => {
                            self.recovery_candidate_ns.store(now_ns, Ordering::Relaxed);
                        }
                        Mode::Normal => {
                            self.pressure_start_ns.store(0, Ordering::Relaxed);
                            self.recovery_candidate_ns.store(0, Ordering::Relaxed);
                        }
                        Mode::Dropping => {}
                    }
                    if expected != desired {
                        tracing::trace!(
                            from = expected.name(),
                            to = desired.name(),
                            "backpressure state transition"
                        );
                    }
                    break;
                }
                Err(observed) => current = observed,
            }
        }
    }

    fn threshold_crossed(percent: u32, total: u32, free: u32) -> bool {
        if total == 0 {
            return false;
        }
        (free as u64) * 100 < (percent as u64) * (total as u64)
    }

    /// Records a pool-occupancy sample and advances the state machine.
    pub fn sample(&self, free_rings: u32, now_ns: u64) {
        self.free_rings.store(free_rings, Ordering::Relaxed);
        self.update_low_watermark(free_rings);

        let total = self.total_effective();
        let pressure = self.config.pressure_threshold_percent;
        let recovery = self.config.recovery_threshold_percent;

        match self.mode() {
            Mode::Normal => {
                if Self::threshold_crossed(pressure, total, free_rings) {
                    self.transition(Mode::Normal, Mode::Pressure, now_ns);
                }
            }
            Mode::Pressure => {
                if free_rings == 0 {
                    self.transition(Mode::Pressure, Mode::Dropping, now_ns);
                } else if !Self::threshold_crossed(pressure, total, free_rings) {
                    self.transition(Mode::Pressure, Mode::Normal, now_ns);
                }
            }
            Mode::Dropping => {
                if !Self::threshold_crossed(recovery, total, free_rings) {
                    self.transition(Mode::Dropping, Mode::Recovery, now_ns);
                }
            }
            Mode::Recovery => {
                if Self::threshold_crossed(pressure, total, free_rings) {
                    self.transition(Mode::Recovery, Mode::Pressure, now_ns);
                    return;
                }
                let candidate = self.recovery_candidate_ns.load(Ordering::Relaxed);
                if candidate == 0 {
                    self.recovery_candidate_ns.store(now_ns, Ordering::Relaxed);
                    return;
                }
                if now_ns.saturating_sub(candidate) >= self.config.recovery_stable_ns {
                    self.transition(Mode::Recovery, Mode::Normal, now_ns);
                    self.last_recovery_ns.store(now_ns, Ordering::Relaxed);
                }
            }
        }
    }

    /// Forces the machine toward DROPPING when the pool has no free ring.
    ///
    /// Four chained CAS attempts cover every predecessor; the contract is the
    /// post-condition only: after the call the mode is DROPPING if it was
    /// reachable from the observed state.
    pub fn on_exhaustion(&self, now_ns: u64) {
        self.transition(Mode::Normal, Mode::Pressure, now_ns);
        self.transition(Mode::Recovery, Mode::Dropping, now_ns);
        self.transition(Mode::Pressure, Mode::Dropping, now_ns);
        self.transition(Mode::Normal, Mode::Dropping, now_ns);
    }

    /// Accounts one dropped event of `dropped_bytes` and emits the rate log
    /// every `drop_log_interval` drops (counted against `events_dropped`).
    pub fn on_drop(&self, dropped_bytes: u64, now_ns: u64) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
        self.bytes_dropped.fetch_add(dropped_bytes, Ordering::Relaxed);
        self.last_drop_ns.store(now_ns, Ordering::Relaxed);
        self.drop_sequences.fetch_add(1, Ordering::Relaxed);

        let interval = self.config.drop_log_interval;
        if interval != 0 {
            let drops = self.events_dropped.load(Ordering::Relaxed);
            if drops % interval as u64 == 0 {
                tracing::info!(
                    drops,
                    bytes = self.bytes_dropped.load(Ordering::Relaxed),
                    sequences = self.drop_sequences.load(Ordering::Relaxed),
                    mode = self.mode().name(),
                    free = self.free_rings.load(Ordering::Relaxed),
                    total = self.total_rings.load(Ordering::Relaxed),
                    low_watermark = self.low_watermark(),
                    "event drop rate"
                );
            }
        }
    }

    /// Notifies that capacity came back while dropping.
    pub fn on_recovery(&self, free_rings: u32, now_ns: u64) {
        self.free_rings.store(free_rings, Ordering::Relaxed);
        self.last_recovery_ns.store(now_ns, Ordering::Relaxed);
        if self.mode() == Mode::Dropping {
            self.transition(Mode::Dropping, Mode::Recovery, now_ns);
        }
    }
}

impl Default for BackpressureState {
    fn default() -> Self {
        Self::new(BackpressureConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serializes tests that mutate process environment variables.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn state_with(pressure: u32, recovery: u32, stable_ns: u64, total: u32) -> BackpressureState {
        let state = BackpressureState::new(BackpressureConfig {
            pressure_threshold_percent: pressure,
            recovery_threshold_percent: recovery,
            recovery_stable_ns: stable_ns,
            drop_log_interval: DEFAULT_DROP_LOG_INTERVAL,
        });
        state.set_total_rings(total);
        state
    }

    #[test]
    fn hysteresis_full_cycle() {
        // P=25, R=50, W=1s, total=4, literal timeline.
        let state = state_with(25, 50, 1_000_000_000, 4);

        state.sample(3, 10);
        assert_eq!(state.mode(), Mode::Normal);

        state.sample(0, 20);
        assert_eq!(state.mode(), Mode::Pressure);

        state.sample(0, 30);
        assert_eq!(state.mode(), Mode::Dropping);

        state.on_drop(0, 35);
        assert_eq!(state.events_dropped(), 1);

        state.sample(3, 40);
        assert_eq!(state.mode(), Mode::Recovery);

        // Still inside the stable window.
        state.sample(3, 40 + 900_000_000);
        assert_eq!(state.mode(), Mode::Recovery);

        // Window elapsed: exactly one transition back to NORMAL.
        state.sample(3, 40 + 1_000_000_005);
        assert_eq!(state.mode(), Mode::Normal);
        let metrics = state.metrics();
        assert_eq!(metrics.last_recovery_ns, 40 + 1_000_000_005);
    }

    #[test]
    fn recovery_dip_restarts_through_pressure() {
        let state = state_with(25, 50, 1_000_000_000, 4);
        state.sample(0, 10);
        state.sample(0, 20);
        assert_eq!(state.mode(), Mode::Dropping);
        state.sample(3, 30);
        assert_eq!(state.mode(), Mode::Recovery);

        // Dip below the pressure threshold resets the candidate window.
        state.sample(0, 40);
        assert_eq!(state.mode(), Mode::Pressure);
        assert_eq!(state.metrics().pressure_start_ns, 40);
    }

    #[test]
    fn pressure_recovers_to_normal_without_dropping() {
        let state = state_with(25, 50, 1_000_000_000, 4);
        state.sample(0, 10);
        assert_eq!(state.mode(), Mode::Pressure);
        state.sample(3, 20);
        assert_eq!(state.mode(), Mode::Normal);
        assert_eq!(state.metrics().pressure_start_ns, 0);
    }

    #[test]
    fn exhaustion_reaches_dropping_from_any_mode() {
        for seed in [Mode::Normal, Mode::Pressure, Mode::Recovery, Mode::Dropping] {
            let state = state_with(25, 50, 1_000_000_000, 4);
            // Drive into the seed mode.
            match seed {
                Mode::Normal => {}
                Mode::Pressure => state.sample(0, 5),
                Mode::Dropping => {
                    state.sample(0, 5);
                    state.sample(0, 6);
                }
                Mode::Recovery => {
                    state.sample(0, 5);
                    state.sample(0, 6);
                    state.sample(3, 7);
                }
            }
            assert_eq!(state.mode(), seed);
            state.on_exhaustion(100);
            assert_eq!(state.mode(), Mode::Dropping, "seed mode {seed}");
        }
    }

    #[test]
    fn counters_are_monotonic() {
        let state = state_with(25, 50, 1_000_000_000, 4);
        let mut last = state.metrics();
        for step in 0..50u64 {
            match step % 4 {
                0 => state.sample((step % 5) as u32, step * 10),
                1 => state.on_drop(32, step * 10),
                2 => state.on_exhaustion(step * 10),
                _ => state.on_recovery(4, step * 10),
            }
            let now = state.metrics();
            assert!(now.events_dropped >= last.events_dropped);
            assert!(now.bytes_dropped >= last.bytes_dropped);
            assert!(now.drop_sequences >= last.drop_sequences);
            assert!(now.transitions >= last.transitions);
            last = now;
        }
    }

    #[test]
    fn low_watermark_tracks_minimum() {
        let state = state_with(25, 50, 1_000_000_000, 8);
        assert_eq!(state.low_watermark(), 0); // nothing sampled
        state.sample(6, 10);
        assert_eq!(state.low_watermark(), 6);
        state.sample(2, 20);
        assert_eq!(state.low_watermark(), 2);
        state.sample(7, 30);
        assert_eq!(state.low_watermark(), 2);
    }

    #[test]
    fn set_total_rings_same_value_is_noop_and_zero_ignored() {
        let state = BackpressureState::default();
        state.set_total_rings(4);
        assert_eq!(state.metrics().total_rings, 4);
        state.set_total_rings(4);
        assert_eq!(state.metrics().total_rings, 4);
        state.set_total_rings(0);
        assert_eq!(state.metrics().total_rings, 4);
    }

    #[test]
    fn reset_clears_counters_keeps_config() {
        let state = state_with(30, 60, 5, 4);
        state.sample(0, 10);
        state.on_drop(8, 20);
        state.reset();
        let metrics = state.metrics();
        assert_eq!(metrics.mode, Mode::Normal);
        assert_eq!(metrics.events_dropped, 0);
        assert_eq!(metrics.transitions, 0);
        assert_eq!(metrics.total_rings, 0);
        assert_eq!(state.config().pressure_threshold_percent, 30);
    }

    #[test]
    fn validate_repairs_out_of_range_thresholds() {
        for bad_pressure in [0u32, 100, 250] {
            let mut cfg = BackpressureConfig {
                pressure_threshold_percent: bad_pressure,
                ..Default::default()
            };
            assert!(!cfg.validate());
            assert_eq!(cfg.pressure_threshold_percent, DEFAULT_PRESSURE_THRESHOLD);
        }

        let mut cfg = BackpressureConfig {
            recovery_threshold_percent: 101,
            ..Default::default()
        };
        assert!(!cfg.validate());
        assert_eq!(cfg.recovery_threshold_percent, DEFAULT_RECOVERY_THRESHOLD);
    }

    #[test]
    fn validate_repairs_inverted_thresholds() {
        let mut cfg = BackpressureConfig {
            pressure_threshold_percent: 60,
            recovery_threshold_percent: 40,
            ..Default::default()
        };
        assert!(!cfg.validate());
        assert_eq!(cfg.recovery_threshold_percent, 65);

        // Pressure ≥ 95 cannot gain +5 headroom: full defaults.
        let mut cfg = BackpressureConfig {
            pressure_threshold_percent: 97,
            recovery_threshold_percent: 96,
            ..Default::default()
        };
        assert!(!cfg.validate());
        assert_eq!(cfg.pressure_threshold_percent, DEFAULT_PRESSURE_THRESHOLD);
        assert_eq!(cfg.recovery_threshold_percent, DEFAULT_RECOVERY_THRESHOLD);
    }

    #[test]
    fn validate_repairs_zero_cadences() {
        let mut cfg = BackpressureConfig {
            recovery_stable_ns: 0,
            drop_log_interval: 0,
            ..Default::default()
        };
        assert!(!cfg.validate());
        assert_eq!(cfg.recovery_stable_ns, DEFAULT_RECOVERY_STABLE_NS);
        assert_eq!(cfg.drop_log_interval, DEFAULT_DROP_LOG_INTERVAL);
    }

    #[test]
    fn from_env_applies_valid_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("BP_PRESSURE_THRESHOLD", "10");
        std::env::set_var("BP_RECOVERY_THRESHOLD", "80");
        std::env::set_var("BP_DROP_LOG_INTERVAL", "7");

        let cfg = BackpressureConfig::from_env();
        assert_eq!(cfg.pressure_threshold_percent, 10);
        assert_eq!(cfg.recovery_threshold_percent, 80);
        assert_eq!(cfg.drop_log_interval, 7);

        std::env::remove_var("BP_PRESSURE_THRESHOLD");
        std::env::remove_var("BP_RECOVERY_THRESHOLD");
        std::env::remove_var("BP_DROP_LOG_INTERVAL");
    }

    #[test]
    fn from_env_falls_back_on_invalid_values() {
        let _guard = ENV_LOCK.lock().unwrap();
        for bad in ["0", "100"] {
            std::env::set_var("BP_PRESSURE_THRESHOLD", bad);
            let cfg = BackpressureConfig::from_env();
            assert_eq!(cfg.pressure_threshold_percent, DEFAULT_PRESSURE_THRESHOLD);
        }
        std::env::set_var("BP_PRESSURE_THRESHOLD", "not-a-number");
        let cfg = BackpressureConfig::from_env();
        assert_eq!(cfg.pressure_threshold_percent, DEFAULT_PRESSURE_THRESHOLD);
        std::env::remove_var("BP_PRESSURE_THRESHOLD");
    }

    #[test]
    fn drop_accounting_and_sequences() {
        let state = state_with(25, 50, 1_000_000_000, 4);
        state.on_drop(16, 100);
        state.on_drop(16, 110);
        let metrics = state.metrics();
        assert_eq!(metrics.events_dropped, 2);
        assert_eq!(metrics.bytes_dropped, 32);
        assert_eq!(metrics.drop_sequences, 2);
        assert_eq!(metrics.last_drop_ns, 110);
    }

    #[test]
    fn on_recovery_only_moves_out_of_dropping() {
        let state = state_with(25, 50, 1_000_000_000, 4);
        state.on_recovery(4, 50);
        assert_eq!(state.mode(), Mode::Normal);
        assert_eq!(state.metrics().last_recovery_ns, 50);

        state.sample(0, 60);
        state.sample(0, 70);
        assert_eq!(state.mode(), Mode::Dropping);
        state.on_recovery(4, 80);
        assert_eq!(state.mode(), Mode::Recovery);
    }
}
