//! On-disk PHGL journal: magic, version, then length-prefixed frames.
//!
//! ```text
//! "PHGL" | u32 version | (u32 len | canonical event bytes)*
//! ```
//!
//! There is no index; readers replay linearly.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::{verify_chain, AuditEvent};
use crate::error::CoreError;

/// File magic.
pub const MAGIC: [u8; 4] = *b"PHGL";

/// Current frame format version.
pub const FORMAT_VERSION: u32 = 1;

const HEADER_LEN: usize = 8;

/// Destination for committed audit events.
pub trait AuditSink: Send {
    /// Write one event. May buffer.
    fn append(&mut self, event: &AuditEvent) -> io::Result<()>;

    /// Make every event up to `up_to_seq` durable.
    fn flush(&mut self, up_to_seq: u64) -> io::Result<()>;

    /// Drop buffered events after `keep_through` (all of them for `None`).
    ///
    /// Called when the log rejects an event the sink already accepted, so
    /// a later flush never writes it.
    fn discard_after(&mut self, _keep_through: Option<u64>) -> io::Result<()> {
        Ok(())
    }
}

/// Byte store under a [`FrameSink`] that can be cut back to a known length.
pub trait JournalStore: Write + Send {
    /// Current length in bytes.
    fn byte_len(&mut self) -> io::Result<u64>;

    /// Cut the store back to `len` bytes; later writes continue from there.
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;

    /// Push written bytes to stable storage.
    fn sync(&mut self) -> io::Result<()> {
        self.flush()
    }
}

impl JournalStore for File {
    fn byte_len(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.seek(SeekFrom::Start(len))?;
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.flush()?;
        self.sync_data()
    }
}

/// Frame writer over a [`JournalStore`].
///
/// Frames are staged in memory and reach the store only on flush, one
/// write per flush. A failed flush cuts the store back to the last synced
/// length, so the store never ends in a torn or unacknowledged frame.
pub struct FrameSink {
    store: Box<dyn JournalStore>,
    synced_len: u64,
    staged: Vec<u8>,
    /// `(seq, end offset in staged)` per staged frame.
    staged_frames: Vec<(u64, usize)>,
}

impl FrameSink {
    /// Create (or truncate) a journal file and write its header.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        Self::from_store(Box::new(file))
    }

    /// Open an existing journal for appending, checking its header.
    pub fn append_to(path: &Path) -> io::Result<Self> {
        let mut header = [0u8; HEADER_LEN];
        File::open(path)?.read_exact(&mut header)?;
        check_header(&header).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            synced_len: file.byte_len()?,
            store: Box::new(file),
            staged: Vec::new(),
            staged_frames: Vec::new(),
        })
    }

    /// Start a journal in an empty store, writing the header first.
    pub fn from_store(mut store: Box<dyn JournalStore>) -> io::Result<Self> {
        store.write_all(&MAGIC)?;
        store.write_all(&FORMAT_VERSION.to_be_bytes())?;
        store.sync()?;
        Ok(Self {
            synced_len: store.byte_len()?,
            store,
            staged: Vec::new(),
            staged_frames: Vec::new(),
        })
    }

    fn write_staged(&mut self) -> io::Result<()> {
        if self.staged.is_empty() {
            return self.store.sync();
        }
        let written = self
            .store
            .write_all(&self.staged)
            .and_then(|()| self.store.sync());
        if let Err(e) = written {
            // Staged frames stay for a retry; the store loses the partial write.
            if let Err(cut) = self.store.truncate_to(self.synced_len) {
                return Err(io::Error::new(
                    e.kind(),
                    format!("{e}; truncating journal also failed: {cut}"),
                ));
            }
            return Err(e);
        }
        let added = u64::try_from(self.staged.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "staged frames too large"))?;
        self.synced_len = self.synced_len.saturating_add(added);
        self.staged.clear();
        self.staged_frames.clear();
        Ok(())
    }
}

impl AuditSink for FrameSink {
    fn append(&mut self, event: &AuditEvent) -> io::Result<()> {
        let body = event.canonical_bytes();
        let len = u32::try_from(body.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
        let mut frame = Vec::with_capacity(body.len().saturating_add(4));
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&body);
        self.staged.extend_from_slice(&frame);
        self.staged_frames.push((event.seq, self.staged.len()));
        Ok(())
    }

    fn flush(&mut self, _up_to_seq: u64) -> io::Result<()> {
        self.write_staged()
    }

    fn discard_after(&mut self, keep_through: Option<u64>) -> io::Result<()> {
        let keep = self
            .staged_frames
            .iter()
            .take_while(|(seq, _)| keep_through.is_some_and(|k| *seq <= k))
            .count();
        let cut = keep
            .checked_sub(1)
            .and_then(|i| self.staged_frames.get(i))
            .map_or(0, |(_, end)| *end);
        self.staged_frames.truncate(keep);
        self.staged.truncate(cut);
        Ok(())
    }
}

impl Drop for FrameSink {
    fn drop(&mut self) {
        if !self.staged.is_empty() {
            let _ = self.write_staged();
        }
    }
}

fn check_header(header: &[u8]) -> Result<(), String> {
    let magic = header.get(..4).ok_or("missing magic")?;
    if magic != MAGIC {
        return Err("not a PHGL journal".to_owned());
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(header.get(4..HEADER_LEN).ok_or("missing version")?);
    let version = u32::from_be_bytes(version);
    if version != FORMAT_VERSION {
        return Err(format!("unsupported PHGL version {version}"));
    }
    Ok(())
}

/// Decode a whole journal image into events without verifying the chain.
///
/// # Errors
///
/// Returns [`CoreError::InvalidInput`] on a bad header or a torn frame.
pub fn decode_frames(bytes: &[u8]) -> Result<Vec<AuditEvent>, CoreError> {
    let header = bytes
        .get(..HEADER_LEN)
        .ok_or_else(|| CoreError::InvalidInput("journal shorter than header".to_owned()))?;
    check_header(header).map_err(CoreError::InvalidInput)?;

    let mut events = Vec::new();
    let mut pos = HEADER_LEN;
    while pos < bytes.len() {
        let len_end = pos
            .checked_add(4)
            .filter(|e| *e <= bytes.len())
            .ok_or_else(|| CoreError::InvalidInput(format!("torn frame length at {pos}")))?;
        let mut len = [0u8; 4];
        len.copy_from_slice(bytes.get(pos..len_end).unwrap_or_default());
        let len = usize::try_from(u32::from_be_bytes(len))
            .map_err(|_| CoreError::InvalidInput("frame length overflow".to_owned()))?;
        let end = len_end
            .checked_add(len)
            .filter(|e| *e <= bytes.len())
            .ok_or_else(|| CoreError::InvalidInput(format!("torn frame body at {pos}")))?;
        events.push(AuditEvent::decode(bytes.get(len_end..end).unwrap_or_default())?);
        pos = end;
    }
    Ok(events)
}

/// Read a journal file and verify its chain.
///
/// # Errors
///
/// Returns [`CoreError::AuditFailure`] if the file cannot be read and
/// [`CoreError::InvalidInput`] if it is malformed or the chain is broken.
pub fn replay(path: &Path) -> Result<Vec<AuditEvent>, CoreError> {
    let bytes = std::fs::read(path)
        .map_err(|e| CoreError::AuditFailure(format!("{}: {e}", path.display())))?;
    let events = decode_frames(&bytes)?;
    verify_chain(&events)?;
    Ok(events)
}
