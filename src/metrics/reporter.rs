//! Interval-driven metrics reporting thread.
//!
//! # Design
//!
//! One background thread owns the emission schedule; every external control
//! (`pause`, `resume`, `force_report`, `set_interval`, `stop`) just flips
//! flags under the reporter's mutex and signals the condvar. The loop:
//!
//! ```text
//! wait until running
//!   wait while paused (unless a report was forced)
//!     forced?  → emit FORCED, loop
//!     otherwise wait_timeout until deadline
//!       woken by a control → re-check everything
//!       deadline hit       → emit PERIODIC
//! shutdown → emit exactly one SUMMARY
//! ```
//!
//! `resume` sets the force flag so a report appears immediately after a
//! pause ends. `stop` on a reporter whose thread never ran still emits the
//! summary (a lifetime guarantee, not a thread artifact), and a
//! `summary_emitted` flag keeps it single per started lifetime.
//!
//! # Failure semantics
//!
//! - Thread spawn failure: `start` returns `false`, state reverts.
//! - Collection disabled or failing: the emission is skipped for that cycle.
//! - JSON file open failure: JSON is skipped for that cycle; the text stream
//!   and sink still fire.

use crate::clock;
use crate::metrics::formatter;
use crate::metrics::{GlobalMetrics, ReportKind, ReportView};
use crate::registry::{ThreadRegistry, MAX_THREADS};

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Default report cadence.
pub const DEFAULT_REPORT_INTERVAL_MS: u64 = 5_000;

/// Receives every emitted report. Implementations must not block for long;
/// they run on the reporter thread.
pub trait ReportSink: Send + Sync + 'static {
    fn on_report(&self, view: &ReportView<'_>);
}

/// Reporter construction parameters.
#[derive(Debug, Clone)]
pub struct ReporterConfig {
    /// Interval between periodic reports; 0 falls back to the default.
    pub report_interval_ms: u64,
    /// Begin paused; reports start after the first `resume`.
    pub start_paused: bool,
    /// Optional JSON-lines file, appended to per emission.
    pub json_output_path: Option<PathBuf>,
    /// Per-report snapshot capacity; 0 falls back to [`MAX_THREADS`].
    pub snapshot_capacity: usize,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            report_interval_ms: DEFAULT_REPORT_INTERVAL_MS,
            start_paused: false,
            json_output_path: None,
            snapshot_capacity: MAX_THREADS,
        }
    }
}

struct Flags {
    running: bool,
    paused: bool,
    force_requested: bool,
    interval_ms: u64,
}

struct ReporterShared {
    registry: Arc<ThreadRegistry>,
    flags: Mutex<Flags>,
    cond: Condvar,
    shutdown: AtomicBool,
    global: Mutex<GlobalMetrics>,
    output: Mutex<Box<dyn Write + Send>>,
    json_path: Mutex<Option<PathBuf>>,
    sink: Mutex<Option<Arc<dyn ReportSink>>>,
    summary_emitted: AtomicBool,
}

/// Handle to the reporting thread.
pub struct MetricsReporter {
    shared: Arc<ReporterShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl MetricsReporter {
    /// Creates a reporter over `registry`, writing text reports to stderr
    /// until [`set_output`](Self::set_output) replaces the stream.
    pub fn new(registry: Arc<ThreadRegistry>, config: ReporterConfig) -> Self {
        let interval_ms = if config.report_interval_ms == 0 {
            DEFAULT_REPORT_INTERVAL_MS
        } else {
            config.report_interval_ms
        };
        let snapshot_capacity = if config.snapshot_capacity == 0 {
            MAX_THREADS
        } else {
            config.snapshot_capacity
        };

        let mut global = GlobalMetrics::new(snapshot_capacity);
        global.set_interval(interval_ms.saturating_mul(1_000_000));

        Self {
            shared: Arc::new(ReporterShared {
                registry,
                flags: Mutex::new(Flags {
                    running: false,
                    paused: config.start_paused,
                    force_requested: false,
                    interval_ms,
                }),
                cond: Condvar::new(),
                shutdown: AtomicBool::new(false),
                global: Mutex::new(global),
                output: Mutex::new(Box::new(io::stderr())),
                json_path: Mutex::new(config.json_output_path),
                sink: Mutex::new(None),
                summary_emitted: AtomicBool::new(false),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Replaces the text output stream. Call before `start`.
    pub fn set_output(&self, output: Box<dyn Write + Send>) {
        *self.shared.output.lock().expect("reporter output poisoned") = output;
    }

    /// Installs (or replaces) the report sink.
    pub fn set_sink(&self, sink: Arc<dyn ReportSink>) {
        *self.shared.sink.lock().expect("reporter sink poisoned") = Some(sink);
    }

    /// Starts the reporting thread, or wakes a started one back up.
    ///
    /// Returns `false` when the OS refuses to spawn the thread; the reporter
    /// reverts to its stopped state.
    pub fn start(&self) -> bool {
        let mut thread = self.thread.lock().expect("reporter lifecycle poisoned");

        if thread.is_none() {
            self.shared.shutdown.store(false, Ordering::Release);
            self.shared.summary_emitted.store(false, Ordering::Release);
            {
                let mut flags = self.shared.flags.lock().expect("reporter flags poisoned");
                flags.running = true;
            }

            let shared = Arc::clone(&self.shared);
            let spawned = std::thread::Builder::new()
                .name("trace-metrics".into())
                .spawn(move || reporter_main(shared));

            match spawned {
                Ok(handle) => {
                    *thread = Some(handle);
                    self.shared.cond.notify_all();
                    tracing::debug!("metrics reporter started");
                    true
                }
                Err(err) => {
                    let mut flags = self.shared.flags.lock().expect("reporter flags poisoned");
                    flags.running = false;
                    tracing::warn!(%err, "metrics reporter thread spawn failed");
                    false
                }
            }
        } else {
            let mut flags = self.shared.flags.lock().expect("reporter flags poisoned");
            flags.running = true;
            self.shared.summary_emitted.store(false, Ordering::Release);
            self.shared.cond.notify_all();
            true
        }
    }

    /// Stops the reporting thread and joins it.
    ///
    /// A reporter that never started still emits its one summary report.
    /// Safe to call repeatedly.
    pub fn stop(&self) {
        let mut thread = self.thread.lock().expect("reporter lifecycle poisoned");

        if let Some(handle) = thread.take() {
            self.shared.shutdown.store(true, Ordering::Release);
            self.shared.cond.notify_all();
            if handle.join().is_err() {
                tracing::warn!("metrics reporter thread panicked before join");
            }
        } else {
            emit_report(&self.shared, ReportKind::Summary);
        }

        let mut flags = self.shared.flags.lock().expect("reporter flags poisoned");
        flags.running = false;
    }

    /// Suspends periodic reports. Forced reports still go through.
    pub fn pause(&self) {
        let mut flags = self.shared.flags.lock().expect("reporter flags poisoned");
        flags.paused = true;
    }

    /// Resumes periodic reports and forces one immediately.
    pub fn resume(&self) {
        let mut flags = self.shared.flags.lock().expect("reporter flags poisoned");
        flags.paused = false;
        flags.force_requested = true;
        self.shared.cond.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.shared
            .flags
            .lock()
            .expect("reporter flags poisoned")
            .paused
    }

    /// Requests an immediate FORCED report.
    pub fn force_report(&self) -> bool {
        let mut flags = self.shared.flags.lock().expect("reporter flags poisoned");
        flags.force_requested = true;
        self.shared.cond.notify_all();
        true
    }

    /// Changes the periodic interval. Zero is ignored.
    pub fn set_interval(&self, interval_ms: u64) {
        if interval_ms == 0 {
            return;
        }
        {
            let mut flags = self.shared.flags.lock().expect("reporter flags poisoned");
            flags.interval_ms = interval_ms;
            self.shared.cond.notify_all();
        }
        self.shared
            .global
            .lock()
            .expect("reporter global poisoned")
            .set_interval(interval_ms.saturating_mul(1_000_000));
    }

    /// Enables (or redirects) the JSON-lines output file.
    pub fn enable_json_output(&self, path: impl Into<PathBuf>) {
        *self.shared.json_path.lock().expect("reporter json poisoned") = Some(path.into());
    }

    /// Gates collection; with collection disabled, emissions are skipped.
    pub fn set_collection_enabled(&self, enabled: bool) {
        self.shared
            .global
            .lock()
            .expect("reporter global poisoned")
            .set_collection_enabled(enabled);
    }
}

impl Drop for MetricsReporter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reporter_main(shared: Arc<ReporterShared>) {
    while !shared.shutdown.load(Ordering::Acquire) {
        let mut flags = shared.flags.lock().expect("reporter flags poisoned");

        while !shared.shutdown.load(Ordering::Acquire) && !flags.running {
            flags = shared.cond.wait(flags).expect("reporter flags poisoned");
        }
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        while !shared.shutdown.load(Ordering::Acquire) && flags.paused && !flags.force_requested {
            flags = shared.cond.wait(flags).expect("reporter flags poisoned");
        }
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        if flags.force_requested {
            flags.force_requested = false;
            drop(flags);
            emit_report(&shared, ReportKind::Forced);
            continue;
        }

        // Absolute deadline; re-armed only when this pass ends.
        let deadline = Instant::now() + Duration::from_millis(flags.interval_ms);
        let mut timed_out = false;
        while !shared.shutdown.load(Ordering::Acquire)
            && flags.running
            && !flags.paused
            && !flags.force_requested
        {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                timed_out = true;
                break;
            };
            let (guard, wait) = shared
                .cond
                .wait_timeout(flags, remaining)
                .expect("reporter flags poisoned");
            flags = guard;
            if wait.timed_out() {
                timed_out = true;
                break;
            }
        }

        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        if !flags.running {
            continue;
        }
        if flags.paused && !flags.force_requested {
            continue;
        }

        let forced = flags.force_requested;
        flags.force_requested = false;
        drop(flags);

        debug_assert!(timed_out || forced);
        emit_report(
            &shared,
            if forced {
                ReportKind::Forced
            } else {
                ReportKind::Periodic
            },
        );
    }

    emit_report(&shared, ReportKind::Summary);
}

/// Collects and emits one report. Returns whether anything was emitted.
fn emit_report(shared: &ReporterShared, kind: ReportKind) -> bool {
    if kind == ReportKind::Summary && shared.summary_emitted.load(Ordering::Acquire) {
        return true;
    }

    let now_ns = clock::now_ns();
    let mut global = shared.global.lock().expect("reporter global poisoned");

    if matches!(kind, ReportKind::Forced | ReportKind::Summary) {
        global.reset_collection_timer();
    }

    if !global.collect(&shared.registry, now_ns) {
        return false;
    }

    let view = ReportView {
        timestamp_ns: now_ns,
        kind,
        totals: global.totals(),
        rates: global.rates(),
        snapshots: global.snapshots(),
    };

    {
        let mut output = shared.output.lock().expect("reporter output poisoned");
        if let Err(err) = formatter::write_text(&view, &mut **output) {
            tracing::warn!(%err, "metrics text emission failed");
        }
    }

    let json_path = shared
        .json_path
        .lock()
        .expect("reporter json poisoned")
        .clone();
    if let Some(path) = json_path {
        // Open failure silently skips JSON for this cycle.
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&path) {
            if let Err(err) = formatter::write_json(&view, &mut file) {
                tracing::warn!(%err, "metrics json emission failed");
            }
        }
    }

    let sink = shared.sink.lock().expect("reporter sink poisoned").clone();
    if let Some(sink) = sink {
        sink.on_report(&view);
    }

    if kind == ReportKind::Summary {
        shared.summary_emitted.store(true, Ordering::Release);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::BackpressureConfig;
    use crate::lane::LaneConfig;
    use crate::registry::RegistryConfig;

    struct CollectingSink(Mutex<Vec<(ReportKind, u64)>>);

    impl CollectingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Vec::new())))
        }

        fn kinds(&self) -> Vec<ReportKind> {
            self.0.lock().unwrap().iter().map(|(k, _)| *k).collect()
        }
    }

    impl ReportSink for CollectingSink {
        fn on_report(&self, view: &ReportView<'_>) {
            self.0.lock().unwrap().push((view.kind, view.timestamp_ns));
        }
    }

    fn test_registry() -> Arc<ThreadRegistry> {
        Arc::new(ThreadRegistry::new(RegistryConfig {
            capacity: 4,
            index_lane: LaneConfig {
                rings: 2,
                ring_capacity: 8,
                record_size: 8,
            },
            detail_lane: LaneConfig {
                rings: 2,
                ring_capacity: 8,
                record_size: 16,
            },
            backpressure: BackpressureConfig::default(),
        }))
    }

    fn wait_for(sink: &CollectingSink, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.0.lock().unwrap().len() < count {
            assert!(Instant::now() < deadline, "timed out waiting for {count} reports");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn quiet_reporter(config: ReporterConfig) -> (MetricsReporter, Arc<CollectingSink>) {
        let reporter = MetricsReporter::new(test_registry(), config);
        reporter.set_output(Box::new(io::sink()));
        let sink = CollectingSink::new();
        reporter.set_sink(Arc::clone(&sink) as Arc<dyn ReportSink>);
        (reporter, sink)
    }

    #[test]
    fn stop_without_start_emits_exactly_one_summary() {
        let (reporter, sink) = quiet_reporter(ReporterConfig::default());
        reporter.stop();
        reporter.stop();
        assert_eq!(sink.kinds(), vec![ReportKind::Summary]);
    }

    #[test]
    fn forced_report_while_running() {
        let (reporter, sink) = quiet_reporter(ReporterConfig {
            report_interval_ms: 60_000,
            ..Default::default()
        });
        assert!(reporter.start());
        assert!(reporter.force_report());
        wait_for(&sink, 1);
        assert_eq!(sink.kinds()[0], ReportKind::Forced);
        reporter.stop();

        let kinds = sink.kinds();
        assert_eq!(kinds.len(), 2);
        assert_eq!(*kinds.last().unwrap(), ReportKind::Summary);
    }

    #[test]
    fn force_while_paused_emits_exactly_one_forced() {
        let (reporter, sink) = quiet_reporter(ReporterConfig {
            report_interval_ms: 60_000,
            start_paused: true,
            ..Default::default()
        });
        assert!(reporter.start());
        assert!(reporter.is_paused());

        reporter.force_report();
        wait_for(&sink, 1);
        assert_eq!(sink.kinds(), vec![ReportKind::Forced]);

        // Still paused afterward: no periodic reports sneak in.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(sink.kinds(), vec![ReportKind::Forced]);
        reporter.stop();
    }

    #[test]
    fn resume_forces_an_immediate_report() {
        let (reporter, sink) = quiet_reporter(ReporterConfig {
            report_interval_ms: 60_000,
            start_paused: true,
            ..Default::default()
        });
        assert!(reporter.start());
        reporter.resume();
        assert!(!reporter.is_paused());
        wait_for(&sink, 1);
        assert_eq!(sink.kinds()[0], ReportKind::Forced);
        reporter.stop();
    }

    #[test]
    fn periodic_reports_fire_on_interval() {
        let (reporter, sink) = quiet_reporter(ReporterConfig {
            report_interval_ms: 25,
            ..Default::default()
        });
        assert!(reporter.start());
        wait_for(&sink, 2);
        reporter.stop();

        let kinds = sink.kinds();
        assert!(kinds.iter().filter(|k| **k == ReportKind::Periodic).count() >= 2);
        assert_eq!(*kinds.last().unwrap(), ReportKind::Summary);
        assert_eq!(
            kinds.iter().filter(|k| **k == ReportKind::Summary).count(),
            1
        );
    }

    #[test]
    fn stop_twice_after_start_keeps_one_summary() {
        let (reporter, sink) = quiet_reporter(ReporterConfig {
            report_interval_ms: 60_000,
            ..Default::default()
        });
        assert!(reporter.start());
        reporter.stop();
        reporter.stop();
        assert_eq!(sink.kinds(), vec![ReportKind::Summary]);
    }

    #[test]
    fn set_interval_zero_is_ignored() {
        let (reporter, _sink) = quiet_reporter(ReporterConfig::default());
        reporter.set_interval(0);
        let flags = reporter.shared.flags.lock().unwrap();
        assert_eq!(flags.interval_ms, DEFAULT_REPORT_INTERVAL_MS);
    }

    #[test]
    fn zero_config_values_fall_back_to_defaults() {
        let reporter = MetricsReporter::new(
            test_registry(),
            ReporterConfig {
                report_interval_ms: 0,
                snapshot_capacity: 0,
                ..Default::default()
            },
        );
        assert_eq!(
            reporter.shared.flags.lock().unwrap().interval_ms,
            DEFAULT_REPORT_INTERVAL_MS
        );
        assert_eq!(
            reporter.shared.global.lock().unwrap().snapshot_capacity(),
            MAX_THREADS
        );
    }

    #[test]
    fn disabled_collection_skips_emission() {
        let (reporter, sink) = quiet_reporter(ReporterConfig {
            report_interval_ms: 60_000,
            ..Default::default()
        });
        reporter.set_collection_enabled(false);
        assert!(reporter.start());
        reporter.force_report();
        std::thread::sleep(Duration::from_millis(50));
        assert!(sink.kinds().is_empty(), "no emission while disabled");

        reporter.set_collection_enabled(true);
        reporter.stop();
        assert_eq!(sink.kinds(), vec![ReportKind::Summary]);
    }

    #[test]
    fn json_output_appends_one_line_per_report() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("reports.jsonl");

        let (reporter, sink) = quiet_reporter(ReporterConfig {
            report_interval_ms: 60_000,
            json_output_path: Some(path.clone()),
            ..Default::default()
        });
        assert!(reporter.start());
        reporter.force_report();
        wait_for(&sink, 1);
        reporter.stop();

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2, "forced + summary");
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["kind"], "forced");
        let last: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(last["kind"], "summary");
    }

    #[test]
    fn missing_json_directory_skips_json_silently() {
        let (reporter, sink) = quiet_reporter(ReporterConfig {
            report_interval_ms: 60_000,
            json_output_path: Some(PathBuf::from("/nonexistent-dir-for-sure/reports.jsonl")),
            ..Default::default()
        });
        assert!(reporter.start());
        reporter.force_report();
        wait_for(&sink, 1);
        reporter.stop();
        // Sink still fired even though JSON could not be opened.
        assert!(sink.kinds().contains(&ReportKind::Forced));
    }
}
