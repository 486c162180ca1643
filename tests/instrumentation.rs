//! Asserts the data path's log instrumentation actually emits: backpressure
//! state transitions and drop-rate lines, and drain lifecycle messages.
//!
//! A scoped subscriber captures everything the current thread logs into a
//! buffer; all the instrumentation under test fires on the calling thread
//! (the backpressure machine is driven directly, and the drain logs its
//! lifecycle from `start`/`stop`, not from the worker).

use tracer_rs::backpressure::{BackpressureConfig, BackpressureState, Mode};
use tracer_rs::drain::{DiscardWriter, DrainConfig, DrainThread};
use tracer_rs::lane::LaneConfig;
use tracer_rs::registry::{RegistryConfig, ThreadRegistry};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use std::io;
use std::sync::{Arc, Mutex};

/// `MakeWriter` that appends every formatted event to a shared buffer.
#[derive(Clone)]
struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl io::Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CaptureWriter {
    type Writer = CaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Runs `f` with a capturing subscriber installed and returns the log text.
fn capture_logs(f: impl FnOnce()) -> String {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("tracer_rs=trace"))
        .with_writer(CaptureWriter(Arc::clone(&buffer)))
        .with_ansi(false)
        .finish();

    tracing::subscriber::with_default(subscriber, f);

    let raw = buffer.lock().unwrap().clone();
    String::from_utf8(raw).expect("log output is UTF-8")
}

#[test]
fn backpressure_transitions_and_drops_are_logged() {
    let output = capture_logs(|| {
        let state = BackpressureState::new(BackpressureConfig {
            drop_log_interval: 2,
            ..Default::default()
        });
        state.set_total_rings(4);

        // NORMAL → PRESSURE → DROPPING, then two drops so the second one
        // lands on the log cadence.
        state.sample(0, 10);
        state.sample(0, 20);
        assert_eq!(state.mode(), Mode::Dropping);
        state.on_drop(32, 30);
        state.on_drop(32, 40);
        assert_eq!(state.events_dropped(), 2);
    });

    assert!(
        output.contains("backpressure state transition"),
        "missing transition log in:\n{output}"
    );
    assert!(output.contains("NORMAL"));
    assert!(output.contains("PRESSURE"));
    assert!(output.contains("DROPPING"));
    assert!(
        output.contains("event drop rate"),
        "missing drop-rate log in:\n{output}"
    );
}

#[test]
fn drain_lifecycle_is_logged() {
    let output = capture_logs(|| {
        let registry = Arc::new(ThreadRegistry::new(RegistryConfig {
            capacity: 2,
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
        }));
        let drain = DrainThread::new(
            registry,
            Arc::new(DiscardWriter),
            DrainConfig {
                poll_interval_us: 100,
                ..Default::default()
            },
        );
        drain.start().unwrap();
        drain.stop();
    });

    assert!(
        output.contains("drain thread started"),
        "missing start log in:\n{output}"
    );
    assert!(
        output.contains("drain thread stopped"),
        "missing stop log in:\n{output}"
    );
}
