//! Session facade: one object that wires the whole data path.
//!
//! A [`TraceSession`] owns the thread registry, the symbol registry, the
//! session writer, the drain thread, and (optionally) the metrics reporter,
//! and binds the registry as the process-wide one so the TLS recording entry
//! points work from any thread:
//!
//! ```no_run
//! use tracer_rs::session::{SessionConfig, TraceSession};
//!
//! let mut session = TraceSession::new(SessionConfig {
//!     directory: "/tmp/trace-session".into(),
//!     ..Default::default()
//! }).unwrap();
//!
//! let open = session.symbols().register_symbol("/usr/lib/libc.so", "open");
//! session.start().unwrap();
//!
//! tracer_rs::session::record_enter(open);
//! tracer_rs::session::record_exit(open);
//!
//! session.stop().unwrap();
//! ```
//!
//! `stop` drains everything (the drain's final passes), finalizes the trace
//! files, and writes `manifest.json`; the session directory is then complete
//! and self-describing.

use crate::clock;
use crate::drain::{DrainConfig, DrainError, DrainThread, RingWriter};
use crate::event::{DetailEvent, EventKind, IndexEvent, NO_DETAIL_SEQ};
use crate::metrics::reporter::{MetricsReporter, ReporterConfig};
use crate::registry::{self, RegistryConfig, ThreadRegistry};
use crate::symbols::SymbolRegistry;
use crate::writer::SessionWriter;

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything a session needs to come up.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Session directory; created if missing.
    pub directory: PathBuf,
    pub registry: RegistryConfig,
    pub drain: DrainConfig,
    /// `None` disables the reporter entirely.
    pub reporter: Option<ReporterConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            directory: std::env::temp_dir().join("trace-session"),
            registry: RegistryConfig::default(),
            drain: DrainConfig::default(),
            reporter: Some(ReporterConfig::default()),
        }
    }
}

/// Errors from session lifecycle operations.
#[derive(Debug)]
#[non_exhaustive]
pub enum SessionError {
    /// Creating the session directory or trace files failed.
    Io(io::Error),
    /// The drain thread could not be started or restarted.
    Drain(DrainError),
    /// The metrics reporter thread could not be started.
    ReporterStart,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "session I/O failed: {err}"),
            Self::Drain(err) => write!(f, "drain lifecycle failed: {err}"),
            Self::ReporterStart => write!(f, "metrics reporter failed to start"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Drain(err) => Some(err),
            Self::ReporterStart => None,
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<DrainError> for SessionError {
    fn from(err: DrainError) -> Self {
        Self::Drain(err)
    }
}

/// A fully wired tracing session.
pub struct TraceSession {
    registry: Arc<ThreadRegistry>,
    symbols: Arc<SymbolRegistry>,
    writer: Arc<SessionWriter>,
    drain: DrainThread,
    reporter: Option<MetricsReporter>,
    started: bool,
}

impl TraceSession {
    /// Builds every component; nothing runs until [`start`](Self::start).
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        let registry = Arc::new(ThreadRegistry::new(config.registry));
        let symbols = Arc::new(SymbolRegistry::new());
        let writer = Arc::new(SessionWriter::create(&config.directory)?);

        let drain = DrainThread::new(
            Arc::clone(&registry),
            Arc::clone(&writer) as Arc<dyn RingWriter>,
            config.drain,
        );

        let reporter = config
            .reporter
            .map(|cfg| MetricsReporter::new(Arc::clone(&registry), cfg));

        Ok(Self {
            registry,
            symbols,
            writer,
            drain,
            reporter,
            started: false,
        })
    }

    pub fn registry(&self) -> &Arc<ThreadRegistry> {
        &self.registry
    }

    pub fn symbols(&self) -> &Arc<SymbolRegistry> {
        &self.symbols
    }

    pub fn writer(&self) -> &Arc<SessionWriter> {
        &self.writer
    }

    pub fn drain(&self) -> &DrainThread {
        &self.drain
    }

    pub fn reporter(&self) -> Option<&MetricsReporter> {
        self.reporter.as_ref()
    }

    /// Attaches the registry process-wide and starts the drain and reporter.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.started {
            return Ok(());
        }

        registry::attach(Arc::clone(&self.registry));
        self.drain.start()?;

        if let Some(reporter) = &self.reporter {
            if !reporter.start() {
                self.drain.stop();
                registry::detach();
                return Err(SessionError::ReporterStart);
            }
        }

        self.started = true;
        tracing::debug!(directory = %self.writer.root().display(), "trace session started");
        Ok(())
    }

    /// Stops the data path, finalizes trace files, and writes the manifest.
    ///
    /// The drain's final passes guarantee every submitted ring reaches the
    /// files before headers are rewritten. Idempotent.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        if !self.started {
            return Ok(());
        }
        self.started = false;

        // Flush the calling thread's own tail before the final drain passes;
        // other threads hand theirs over when their TLS handles drop.
        registry::release_thread_handle();

        self.drain.stop();
        if let Some(reporter) = &self.reporter {
            reporter.stop();
        }
        registry::detach();

        self.writer.finalize()?;
        self.symbols.write_manifest(self.writer.root())?;
        tracing::debug!("trace session stopped");
        Ok(())
    }
}

impl Drop for TraceSession {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Records a function-entry event for the calling thread.
///
/// Returns `false` when the event was dropped (no registry attached, slot
/// table full, or pool exhausted).
pub fn record_enter(function_id: u64) -> bool {
    registry::with_thread_handle(|handle| {
        let event = IndexEvent {
            timestamp_ns: clock::now_ns(),
            function_id,
            thread_id: handle.thread_id(),
            kind: EventKind::Enter,
            call_depth: handle.push_depth(),
            detail_seq: NO_DETAIL_SEQ,
        };
        handle.write_index_event(&event)
    })
    .unwrap_or(false)
}

/// Records a function-exit event for the calling thread.
pub fn record_exit(function_id: u64) -> bool {
    registry::with_thread_handle(|handle| {
        let event = IndexEvent {
            timestamp_ns: clock::now_ns(),
            function_id,
            thread_id: handle.thread_id(),
            kind: EventKind::Exit,
            call_depth: handle.pop_depth(),
            detail_seq: NO_DETAIL_SEQ,
        };
        handle.write_index_event(&event)
    })
    .unwrap_or(false)
}

/// Records a stack sample: an index marker plus a detail-lane snapshot.
pub fn record_sample(function_id: u64, frames: &[u64]) -> bool {
    registry::with_thread_handle(|handle| {
        let now_ns = clock::now_ns();
        let detail = DetailEvent::from_frames(now_ns, handle.thread_id(), frames);
        let detail_seq = handle.write_detail_event(&detail);

        let event = IndexEvent {
            timestamp_ns: now_ns,
            function_id,
            thread_id: handle.thread_id(),
            kind: EventKind::Sample,
            call_depth: handle.call_depth(),
            detail_seq: detail_seq.unwrap_or(NO_DETAIL_SEQ),
        };
        handle.write_index_event(&event) && detail_seq.is_some()
    })
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lane::LaneConfig;
    use tempfile::TempDir;

    fn small_session(dir: &TempDir) -> TraceSession {
        TraceSession::new(SessionConfig {
            directory: dir.path().join("session"),
            registry: RegistryConfig {
                capacity: 4,
                index_lane: LaneConfig {
                    rings: 4,
                    ring_capacity: 16,
                    record_size: crate::event::INDEX_EVENT_SIZE as u32,
                },
                detail_lane: LaneConfig {
                    rings: 4,
                    ring_capacity: 8,
                    record_size: crate::event::DETAIL_EVENT_SIZE as u32,
                },
                backpressure: Default::default(),
            },
            drain: DrainConfig {
                poll_interval_us: 100,
                ..Default::default()
            },
            reporter: None,
        })
        .unwrap()
    }

    #[test]
    fn lifecycle_is_idempotent() {
        let _guard = crate::registry::BINDING_TEST_LOCK.lock().unwrap();
        let dir = TempDir::new().unwrap();
        let mut session = small_session(&dir);

        session.start().unwrap();
        session.start().unwrap();
        session.stop().unwrap();
        session.stop().unwrap();
        assert!(dir.path().join("session/manifest.json").exists());
    }

    #[test]
    fn recording_without_attachment_is_dropped() {
        let _guard = crate::registry::BINDING_TEST_LOCK.lock().unwrap();
        crate::registry::detach();
        crate::registry::release_thread_handle();
        assert!(!record_enter(42));
    }

    #[test]
    fn events_flow_to_disk() {
        let _guard = crate::registry::BINDING_TEST_LOCK.lock().unwrap();
        let dir = TempDir::new().unwrap();
        let mut session = small_session(&dir);
        let open_id = session.symbols().register_symbol("/usr/lib/libc.so", "open");

        session.start().unwrap();
        assert!(record_enter(open_id));
        assert!(record_exit(open_id));
        crate::registry::release_thread_handle();
        session.stop().unwrap();

        // The TLS handle got slot 0 in a fresh registry.
        let (header, events) =
            crate::writer::read_index_file(&dir.path().join("session/thread_0/index.atf"))
                .unwrap();
        assert_eq!(header.event_count, 2);
        assert_eq!(events[0].kind, EventKind::Enter);
        assert_eq!(events[0].function_id, open_id);
        assert_eq!(events[1].kind, EventKind::Exit);
        assert!(events[0].timestamp_ns <= events[1].timestamp_ns);

        let manifest: serde_json::Value = serde_json::from_slice(
            &std::fs::read(dir.path().join("session/manifest.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest["symbols"][0]["name"], "open");
    }

    #[test]
    fn samples_reach_the_detail_lane() {
        let _guard = crate::registry::BINDING_TEST_LOCK.lock().unwrap();
        let dir = TempDir::new().unwrap();
        let mut session = small_session(&dir);
        session.start().unwrap();

        assert!(record_sample(9, &[0x1000, 0x2000, 0x3000]));
        crate::registry::release_thread_handle();
        session.stop().unwrap();

        let (header, records) =
            crate::writer::read_detail_file(&dir.path().join("session/thread_0/detail.atf"))
                .unwrap();
        assert_eq!(header.event_count, 1);
        let raw: &[u8; crate::event::DETAIL_EVENT_SIZE] =
            records[0].as_slice().try_into().unwrap();
        let detail = DetailEvent::decode(raw).unwrap();
        assert_eq!(detail.frame_count, 3);
        assert_eq!(&detail.frames[..3], &[0x1000, 0x2000, 0x3000]);
    }
}
