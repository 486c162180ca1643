//! Session writer: turns drained rings into per-thread ATF trace files.
//!
//! # Layout
//!
//! One directory per session:
//!
//! ```text
//! <session>/
//!   thread_0/index.atf     64-byte header + 32-byte records
//!   thread_0/detail.atf    64-byte header + 256-byte records
//!   thread_1/...
//!   manifest.json          written by the symbol registry at finalize
//! ```
//!
//! Each file starts with a fixed 64-byte header ("ATI2" for index files,
//! "ATD2" for detail files) followed by a plain concatenation of fixed-size
//! records in drain order, which per lane is producer order. Headers are
//! written as placeholders at file creation and rewritten with the final
//! event counts and time range by [`SessionWriter::finalize`], so a file is
//! self-describing once the session closes cleanly.
//!
//! # Concurrency
//!
//! `process_ring` runs only on the drain thread; `finalize` runs after the
//! drain has stopped. The interior mutex exists so the writer can be shared
//! as an `Arc<dyn RingWriter>`, not because two threads ever stream records
//! concurrently.
//!
//! # Failure semantics
//!
//! A record that fails to write is counted and the remainder of that ring is
//! abandoned for this pass (the drain resets the ring regardless); the first
//! error per file logs a warning. Tracing must not take the process down
//! over a full disk.

use crate::event::{IndexEvent, DETAIL_EVENT_SIZE, INDEX_EVENT_SIZE};
use crate::lane::LaneKind;
use crate::stdx::RecordRing;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Magic for index files.
pub const INDEX_MAGIC: &[u8; 4] = b"ATI2";
/// Magic for detail files.
pub const DETAIL_MAGIC: &[u8; 4] = b"ATD2";
/// Fixed header size for both file kinds.
pub const FILE_HEADER_SIZE: usize = 64;

/// Format version stamped into headers.
const FORMAT_VERSION: u8 = 1;
/// Little-endian marker.
const ENDIAN_LITTLE: u8 = 1;
/// Index-header flag: a detail file exists alongside.
const FLAG_HAS_DETAIL_FILE: u32 = 1;

const fn arch_code() -> u8 {
    if cfg!(target_arch = "x86_64") {
        1
    } else if cfg!(target_arch = "aarch64") {
        2
    } else {
        0
    }
}

const fn os_code() -> u8 {
    if cfg!(target_os = "macos") {
        3
    } else if cfg!(target_os = "linux") {
        4
    } else if cfg!(target_os = "windows") {
        5
    } else {
        0
    }
}

struct LaneFile {
    file: File,
    thread_id: u32,
    record_size: u32,
    event_count: u64,
    bytes_written: u64,
    time_start_ns: u64,
    time_end_ns: u64,
    write_errors: u64,
    scratch: Vec<u8>,
}

/// Writes drained rings into a session directory.
pub struct SessionWriter {
    root: PathBuf,
    files: Mutex<HashMap<(u32, LaneKind), LaneFile>>,
}

impl SessionWriter {
    /// Creates the session directory (and parents) and an empty writer.
    pub fn create(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            files: Mutex::new(HashMap::new()),
        })
    }

    /// The session directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_name(kind: LaneKind) -> &'static str {
        match kind {
            LaneKind::Index => "index.atf",
            LaneKind::Detail => "detail.atf",
        }
    }

    fn open_lane_file(
        &self,
        slot: u32,
        thread_id: u32,
        kind: LaneKind,
        record_size: u32,
    ) -> io::Result<LaneFile> {
        let dir = self.root.join(format!("thread_{slot}"));
        fs::create_dir_all(&dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(dir.join(Self::file_name(kind)))?;

        // Placeholder header; rewritten with real counts on finalize.
        let header = encode_header(kind, thread_id, record_size, 0, 0, 0, 0);
        file.write_all(&header)?;

        Ok(LaneFile {
            file,
            thread_id,
            record_size,
            event_count: 0,
            bytes_written: 0,
            time_start_ns: 0,
            time_end_ns: 0,
            write_errors: 0,
            scratch: vec![0u8; record_size as usize],
        })
    }

    /// Streams every pending record of `ring` into the lane's file.
    pub fn write_ring(&self, slot: u32, thread_id: u32, kind: LaneKind, ring: &RecordRing) {
        let mut files = self.files.lock().expect("session writer poisoned");

        let entry = match files.entry((slot, kind)) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(v) => {
                match self.open_lane_file(slot, thread_id, kind, ring.record_size()) {
                    Ok(file) => v.insert(file),
                    Err(err) => {
                        tracing::warn!(slot, kind = kind.name(), %err, "trace file open failed");
                        while ring.drop_oldest() {}
                        return;
                    }
                }
            }
        };

        while ring.read_oldest(&mut entry.scratch) {
            // Both record layouts lead with the event timestamp.
            let ts = u64::from_le_bytes(entry.scratch[0..8].try_into().unwrap());
            if entry.time_start_ns == 0 {
                entry.time_start_ns = ts;
            }
            entry.time_end_ns = entry.time_end_ns.max(ts);

            if let Err(err) = entry.file.write_all(&entry.scratch) {
                if entry.write_errors == 0 {
                    tracing::warn!(slot, kind = kind.name(), %err, "trace record write failed");
                }
                entry.write_errors += 1;
                while ring.drop_oldest() {}
                return;
            }
            entry.event_count += 1;
            entry.bytes_written += entry.record_size as u64;
        }
    }

    /// Rewrites every file's header with final counts and flushes.
    ///
    /// All files are attempted; the first error is returned.
    pub fn finalize(&self) -> io::Result<()> {
        let mut files = self.files.lock().expect("session writer poisoned");
        let mut first_error = None;

        for ((_, kind), lane_file) in files.iter_mut() {
            let header = encode_header(
                *kind,
                lane_file.thread_id,
                lane_file.record_size,
                lane_file.event_count,
                lane_file.bytes_written,
                lane_file.time_start_ns,
                lane_file.time_end_ns,
            );
            let result = lane_file
                .file
                .seek(SeekFrom::Start(0))
                .and_then(|_| lane_file.file.write_all(&header))
                .and_then(|_| lane_file.file.flush());
            if let Err(err) = result {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Total records written across all files, for diagnostics.
    pub fn total_events_written(&self) -> u64 {
        self.files
            .lock()
            .expect("session writer poisoned")
            .values()
            .map(|f| f.event_count)
            .sum()
    }
}

impl crate::drain::RingWriter for SessionWriter {
    fn process_ring(&self, slot: u32, thread_id: u32, kind: LaneKind, ring: &RecordRing) {
        self.write_ring(slot, thread_id, kind, ring);
    }
}

#[allow(clippy::too_many_arguments)]
fn encode_header(
    kind: LaneKind,
    thread_id: u32,
    record_size: u32,
    event_count: u64,
    bytes_written: u64,
    time_start_ns: u64,
    time_end_ns: u64,
) -> [u8; FILE_HEADER_SIZE] {
    let mut out = [0u8; FILE_HEADER_SIZE];
    match kind {
        LaneKind::Index => {
            out[0..4].copy_from_slice(INDEX_MAGIC);
            out[4] = ENDIAN_LITTLE;
            out[5] = FORMAT_VERSION;
            out[6] = arch_code();
            out[7] = os_code();
            out[8..12].copy_from_slice(&FLAG_HAS_DETAIL_FILE.to_le_bytes());
            out[12..16].copy_from_slice(&thread_id.to_le_bytes());
            // [16..24] clock type + reserved
            out[24..28].copy_from_slice(&record_size.to_le_bytes());
            out[28..32].copy_from_slice(&(event_count.min(u32::MAX as u64) as u32).to_le_bytes());
            out[32..40].copy_from_slice(&(FILE_HEADER_SIZE as u64).to_le_bytes());
            // [40..48] footer offset, unused
            out[48..56].copy_from_slice(&time_start_ns.to_le_bytes());
            out[56..64].copy_from_slice(&time_end_ns.to_le_bytes());
        }
        LaneKind::Detail => {
            out[0..4].copy_from_slice(DETAIL_MAGIC);
            out[4] = ENDIAN_LITTLE;
            out[5] = FORMAT_VERSION;
            out[6] = arch_code();
            out[7] = os_code();
            // [8..12] flags, unused
            out[12..16].copy_from_slice(&thread_id.to_le_bytes());
            out[16..20].copy_from_slice(&record_size.to_le_bytes());
            out[20..28].copy_from_slice(&(FILE_HEADER_SIZE as u64).to_le_bytes());
            out[28..36].copy_from_slice(&event_count.to_le_bytes());
            out[36..44].copy_from_slice(&bytes_written.to_le_bytes());
            out[44..52].copy_from_slice(&time_start_ns.to_le_bytes());
            out[52..60].copy_from_slice(&time_end_ns.to_le_bytes());
        }
    }
    out
}

/// Parsed header of an index file.
#[derive(Debug, Clone, Copy)]
pub struct IndexFileHeader {
    pub thread_id: u32,
    pub event_size: u32,
    pub event_count: u32,
    pub time_start_ns: u64,
    pub time_end_ns: u64,
}

/// Reads an index file back: header plus decoded events in file order.
///
/// Fails with `InvalidData` on a bad magic, version, or record size.
pub fn read_index_file(path: &Path) -> io::Result<(IndexFileHeader, Vec<IndexEvent>)> {
    let mut raw = Vec::new();
    File::open(path)?.read_to_end(&mut raw)?;
    if raw.len() < FILE_HEADER_SIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "file shorter than header"));
    }
    if &raw[0..4] != INDEX_MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad index magic"));
    }
    let event_size = u32::from_le_bytes(raw[24..28].try_into().unwrap());
    if event_size as usize != INDEX_EVENT_SIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "unexpected event size"));
    }

    let header = IndexFileHeader {
        thread_id: u32::from_le_bytes(raw[12..16].try_into().unwrap()),
        event_size,
        event_count: u32::from_le_bytes(raw[28..32].try_into().unwrap()),
        time_start_ns: u64::from_le_bytes(raw[48..56].try_into().unwrap()),
        time_end_ns: u64::from_le_bytes(raw[56..64].try_into().unwrap()),
    };

    let mut events = Vec::with_capacity(header.event_count as usize);
    let mut at = FILE_HEADER_SIZE;
    while at + INDEX_EVENT_SIZE <= raw.len() {
        let chunk: &[u8; INDEX_EVENT_SIZE] = raw[at..at + INDEX_EVENT_SIZE].try_into().unwrap();
        let event = IndexEvent::decode(chunk)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "corrupt index record"))?;
        events.push(event);
        at += INDEX_EVENT_SIZE;
    }
    Ok((header, events))
}

/// Parsed header of a detail file.
#[derive(Debug, Clone, Copy)]
pub struct DetailFileHeader {
    pub thread_id: u32,
    pub record_size: u32,
    pub event_count: u64,
    pub bytes_written: u64,
    pub time_start_ns: u64,
    pub time_end_ns: u64,
}

/// Reads a detail file's header and raw record payloads.
pub fn read_detail_file(path: &Path) -> io::Result<(DetailFileHeader, Vec<Vec<u8>>)> {
    let mut raw = Vec::new();
    File::open(path)?.read_to_end(&mut raw)?;
    if raw.len() < FILE_HEADER_SIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "file shorter than header"));
    }
    if &raw[0..4] != DETAIL_MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad detail magic"));
    }

    let header = DetailFileHeader {
        thread_id: u32::from_le_bytes(raw[12..16].try_into().unwrap()),
        record_size: u32::from_le_bytes(raw[16..20].try_into().unwrap()),
        event_count: u64::from_le_bytes(raw[28..36].try_into().unwrap()),
        bytes_written: u64::from_le_bytes(raw[36..44].try_into().unwrap()),
        time_start_ns: u64::from_le_bytes(raw[44..52].try_into().unwrap()),
        time_end_ns: u64::from_le_bytes(raw[52..60].try_into().unwrap()),
    };
    if header.record_size == 0 || header.record_size as usize > DETAIL_EVENT_SIZE * 4 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "implausible record size"));
    }

    let step = header.record_size as usize;
    let mut records = Vec::new();
    let mut at = FILE_HEADER_SIZE;
    while at + step <= raw.len() {
        records.push(raw[at..at + step].to_vec());
        at += step;
    }
    Ok((header, records))
}
