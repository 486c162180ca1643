//! Fixed-size wire records carried by the two lanes.
//!
//! The index lane carries 32-byte [`IndexEvent`]s (function entry/exit and
//! sample markers); the detail lane carries 256-byte [`DetailEvent`]s (stack
//! snapshots). Both are little-endian and sized at compile time so a ring can
//! be carved into exact slots and the drain can treat ring contents as opaque
//! byte runs keyed only by the lane's record size.
//!
//! # Layout stability
//! The on-disk trace files are a plain concatenation of these records after a
//! writer header, so the encodings here are a wire contract: field order,
//! widths, and endianness must not change without bumping the file version.

/// Size in bytes of one encoded [`IndexEvent`].
pub const INDEX_EVENT_SIZE: usize = 32;

/// Size in bytes of one encoded [`DetailEvent`].
pub const DETAIL_EVENT_SIZE: usize = 256;

/// Maximum stack frames a detail event can carry.
pub const MAX_STACK_FRAMES: usize = 30;

/// Sentinel for "no linked detail event".
pub const NO_DETAIL_SEQ: u32 = u32::MAX;

// 8 (ts) + 4 (thread) + 2 (count) + 2 (flags) + 30 * 8 (frames) = 256.
const _: () = assert!(16 + MAX_STACK_FRAMES * 8 == DETAIL_EVENT_SIZE);

/// What an index event marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EventKind {
    /// Function entry.
    Enter = 1,
    /// Function exit.
    Exit = 2,
    /// Asynchronous stack sample.
    Sample = 3,
}

impl EventKind {
    /// Decodes the wire value; unknown values are rejected.
    pub fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Enter),
            2 => Some(Self::Exit),
            3 => Some(Self::Sample),
            _ => None,
        }
    }
}

/// One fixed-size index-lane record.
///
/// `function_id` is `(module_id << 32) | symbol_index` as assigned by
/// [`crate::symbols::SymbolRegistry`]. `detail_seq` forward-links to a record
/// in the detail lane, or [`NO_DETAIL_SEQ`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEvent {
    pub timestamp_ns: u64,
    pub function_id: u64,
    pub thread_id: u32,
    pub kind: EventKind,
    pub call_depth: u32,
    pub detail_seq: u32,
}

impl IndexEvent {
    /// Encodes into exactly [`INDEX_EVENT_SIZE`] bytes, little-endian.
    pub fn encode(&self, out: &mut [u8; INDEX_EVENT_SIZE]) {
        out[0..8].copy_from_slice(&self.timestamp_ns.to_le_bytes());
        out[8..16].copy_from_slice(&self.function_id.to_le_bytes());
        out[16..20].copy_from_slice(&self.thread_id.to_le_bytes());
        out[20..24].copy_from_slice(&(self.kind as u32).to_le_bytes());
        out[24..28].copy_from_slice(&self.call_depth.to_le_bytes());
        out[28..32].copy_from_slice(&self.detail_seq.to_le_bytes());
    }

    /// Encodes into a fresh byte array.
    pub fn to_bytes(&self) -> [u8; INDEX_EVENT_SIZE] {
        let mut out = [0u8; INDEX_EVENT_SIZE];
        self.encode(&mut out);
        out
    }

    /// Decodes from [`INDEX_EVENT_SIZE`] bytes; `None` on an unknown kind.
    pub fn decode(raw: &[u8; INDEX_EVENT_SIZE]) -> Option<Self> {
        let kind = EventKind::from_wire(u32::from_le_bytes(raw[20..24].try_into().unwrap()))?;
        Some(Self {
            timestamp_ns: u64::from_le_bytes(raw[0..8].try_into().unwrap()),
            function_id: u64::from_le_bytes(raw[8..16].try_into().unwrap()),
            thread_id: u32::from_le_bytes(raw[16..20].try_into().unwrap()),
            kind,
            call_depth: u32::from_le_bytes(raw[24..28].try_into().unwrap()),
            detail_seq: u32::from_le_bytes(raw[28..32].try_into().unwrap()),
        })
    }
}

/// One fixed-size detail-lane record: a truncated stack snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetailEvent {
    pub timestamp_ns: u64,
    pub thread_id: u32,
    /// Number of valid entries in `frames`; excess input is truncated.
    pub frame_count: u16,
    /// Bit 0: the snapshot was truncated to [`MAX_STACK_FRAMES`].
    pub flags: u16,
    pub frames: [u64; MAX_STACK_FRAMES],
}

/// Flag bit: the captured stack was deeper than [`MAX_STACK_FRAMES`].
pub const DETAIL_FLAG_TRUNCATED: u16 = 1;

impl DetailEvent {
    /// Builds a snapshot from raw frame addresses, truncating if needed.
    pub fn from_frames(timestamp_ns: u64, thread_id: u32, stack: &[u64]) -> Self {
        let truncated = stack.len() > MAX_STACK_FRAMES;
        let count = stack.len().min(MAX_STACK_FRAMES);
        let mut frames = [0u64; MAX_STACK_FRAMES];
        frames[..count].copy_from_slice(&stack[..count]);
        Self {
            timestamp_ns,
            thread_id,
            frame_count: count as u16,
            flags: if truncated { DETAIL_FLAG_TRUNCATED } else { 0 },
            frames,
        }
    }

    /// Encodes into exactly [`DETAIL_EVENT_SIZE`] bytes, little-endian.
    pub fn encode(&self, out: &mut [u8; DETAIL_EVENT_SIZE]) {
        out[0..8].copy_from_slice(&self.timestamp_ns.to_le_bytes());
        out[8..12].copy_from_slice(&self.thread_id.to_le_bytes());
        out[12..14].copy_from_slice(&self.frame_count.to_le_bytes());
        out[14..16].copy_from_slice(&self.flags.to_le_bytes());
        for (i, frame) in self.frames.iter().enumerate() {
            let at = 16 + i * 8;
            out[at..at + 8].copy_from_slice(&frame.to_le_bytes());
        }
    }

    /// Encodes into a fresh byte array.
    pub fn to_bytes(&self) -> [u8; DETAIL_EVENT_SIZE] {
        let mut out = [0u8; DETAIL_EVENT_SIZE];
        self.encode(&mut out);
        out
    }

    /// Decodes from [`DETAIL_EVENT_SIZE`] bytes.
    ///
    /// A `frame_count` beyond [`MAX_STACK_FRAMES`] marks a corrupt record and
    /// yields `None`.
    pub fn decode(raw: &[u8; DETAIL_EVENT_SIZE]) -> Option<Self> {
        let frame_count = u16::from_le_bytes(raw[12..14].try_into().unwrap());
        if frame_count as usize > MAX_STACK_FRAMES {
            return None;
        }
        let mut frames = [0u64; MAX_STACK_FRAMES];
        for (i, frame) in frames.iter_mut().enumerate() {
            let at = 16 + i * 8;
            *frame = u64::from_le_bytes(raw[at..at + 8].try_into().unwrap());
        }
        Some(Self {
            timestamp_ns: u64::from_le_bytes(raw[0..8].try_into().unwrap()),
            thread_id: u32::from_le_bytes(raw[8..12].try_into().unwrap()),
            frame_count,
            flags: u16::from_le_bytes(raw[14..16].try_into().unwrap()),
            frames,
        })
    }
}
