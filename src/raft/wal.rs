//! Consensus write-ahead log.
//!
//! One append-only file per node (`raft_<id>.log`) holding two kinds of
//! records behind a shared frame: replicated log entries and hard-state
//! snapshots (term, vote, commit). Everything the consensus module must
//! not forget across a crash goes through here, fsynced before the action
//! that depends on it.
//!
//! # On-disk layout
//!
//! ```text
//! [MAGIC "SRFT"][VERSION_LE u32][HEADER_CRC32_LE]
//! [REC_LEN_LE u32][RECORD_BYTES][REC_CRC32_LE]
//! ...
//! ```
//!
//! The record payload is an [`encoding`]-serialized [`RaftWalRecord`]; the
//! CRC covers `len || payload`.
//!
//! # Idempotent appends
//!
//! The consensus module may re-emit entries that are already on disk (a
//! follower batch can overlap what was flushed earlier). Appends therefore
//! skip every entry whose index is ≤ the highest index already persisted,
//! so callers never track persistence themselves and recovery always sees
//! an index-monotonic sequence.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};

const RAFT_WAL_MAGIC: [u8; 4] = *b"SRFT";
const RAFT_WAL_VERSION: u32 = 1;

/// `magic(4) + version(4) + crc(4)`.
const FILE_HEADER_SIZE: usize = 12;

const TAG_LOG: u8 = 1;
const TAG_HARD_STATE: u8 = 2;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by the consensus WAL.
#[derive(Debug, Error)]
pub enum RaftWalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The file header failed validation.
    #[error("invalid raft WAL header: {0}")]
    InvalidHeader(String),

    /// Internal consistency or locking error.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Record types
// ------------------------------------------------------------------------------------------------

/// One replicated log entry.
///
/// Indexes are 1-based and gapless; index 0 is an in-memory sentinel with
/// term 0 and is never written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Position in the replicated log.
    pub index: u64,
    /// Election term under which the entry was proposed.
    pub term: u64,
    /// Opaque command payload; the consensus layer never interprets it.
    pub command: Vec<u8>,
}

impl Encode for LogEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.index.encode_to(buf)?;
        self.term.encode_to(buf)?;
        self.command.encode_to(buf)
    }
}

impl Decode for LogEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (index, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (term, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (command, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                index,
                term,
                command,
            },
            offset,
        ))
    }
}

/// Durable consensus state: current term, vote, and commit index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HardState {
    /// Current election term.
    pub term: u64,
    /// Peer voted for in `term`, if any.
    pub vote: Option<u64>,
    /// Highest log index known committed.
    pub commit: u64,
}

impl Encode for HardState {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.term.encode_to(buf)?;
        self.vote.encode_to(buf)?;
        self.commit.encode_to(buf)
    }
}

impl Decode for HardState {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (term, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (vote, n) = <Option<u64>>::decode_from(&buf[offset..])?;
        offset += n;
        let (commit, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { term, vote, commit }, offset))
    }
}

/// The two record kinds sharing the WAL file, discriminated by a leading
/// tag byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaftWalRecord {
    /// A replicated log entry.
    Log(LogEntry),
    /// A hard-state snapshot; the last one in the file wins.
    HardState(HardState),
}

impl Encode for RaftWalRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            RaftWalRecord::Log(entry) => {
                TAG_LOG.encode_to(buf)?;
                entry.encode_to(buf)
            }
            RaftWalRecord::HardState(state) => {
                TAG_HARD_STATE.encode_to(buf)?;
                state.encode_to(buf)
            }
        }
    }
}

impl Decode for RaftWalRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut offset) = u8::decode_from(buf)?;
        match tag {
            TAG_LOG => {
                let (entry, n) = LogEntry::decode_from(&buf[offset..])?;
                offset += n;
                Ok((RaftWalRecord::Log(entry), offset))
            }
            TAG_HARD_STATE => {
                let (state, n) = HardState::decode_from(&buf[offset..])?;
                offset += n;
                Ok((RaftWalRecord::HardState(state), offset))
            }
            other => Err(EncodingError::InvalidTag {
                tag: u32::from(other),
                type_name: "RaftWalRecord",
            }),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// RaftWal
// ------------------------------------------------------------------------------------------------

struct WalFile {
    file: File,
    /// Highest log-entry index written to this file.
    last_persisted: u64,
    /// File length up to the last valid record.
    valid_len: u64,
    /// A torn tail from recovery waits to be cut by the next append.
    needs_truncate: bool,
}

/// The per-node consensus WAL. Thread-safe; persistence calls arrive from
/// whichever thread holds the consensus state lock.
pub struct RaftWal {
    inner: Mutex<WalFile>,
    path: PathBuf,
}

impl RaftWal {
    /// Opens or creates the WAL file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RaftWalError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        if file.metadata()?.len() == 0 {
            let mut header = [0u8; FILE_HEADER_SIZE];
            header[0..4].copy_from_slice(&RAFT_WAL_MAGIC);
            header[4..8].copy_from_slice(&RAFT_WAL_VERSION.to_le_bytes());
            let mut hasher = Crc32::new();
            hasher.update(&header[..8]);
            header[8..12].copy_from_slice(&hasher.finalize().to_le_bytes());
            file.write_all(&header)?;
            file.sync_all()?;
            info!(path = %path.display(), "raft WAL created");
        } else {
            file.seek(SeekFrom::Start(0))?;
            let mut header = [0u8; FILE_HEADER_SIZE];
            file.read_exact(&mut header)
                .map_err(|_| RaftWalError::InvalidHeader("file shorter than header".into()))?;
            let mut hasher = Crc32::new();
            hasher.update(&header[..8]);
            let stored = u32::from_le_bytes(header[8..12].try_into().unwrap_or_default());
            if hasher.finalize() != stored {
                return Err(RaftWalError::InvalidHeader("header checksum mismatch".into()));
            }
            if header[0..4] != RAFT_WAL_MAGIC {
                return Err(RaftWalError::InvalidHeader("bad magic".into()));
            }
            let version = u32::from_le_bytes(header[4..8].try_into().unwrap_or_default());
            if version != RAFT_WAL_VERSION {
                return Err(RaftWalError::InvalidHeader(format!(
                    "unsupported version {version}"
                )));
            }
        }

        Ok(Self {
            inner: Mutex::new(WalFile {
                file,
                last_persisted: 0,
                valid_len: FILE_HEADER_SIZE as u64,
                needs_truncate: false,
            }),
            path,
        })
    }

    /// Appends log entries under a single durable sync.
    ///
    /// Entries whose index is ≤ the highest index already persisted are
    /// skipped (idempotent redelivery).
    pub fn append_entries(&self, entries: &[LogEntry]) -> Result<(), RaftWalError> {
        let mut inner = self.lock()?;

        let mut buf = Vec::new();
        let mut highest = inner.last_persisted;
        let mut written = 0usize;
        for entry in entries {
            if entry.index <= inner.last_persisted {
                continue;
            }
            encode_frame(&RaftWalRecord::Log(entry.clone()), &mut buf)?;
            highest = highest.max(entry.index);
            written += 1;
        }
        if written == 0 {
            return Ok(());
        }

        inner.write_frames(&buf)?;
        inner.last_persisted = highest;
        trace!(written, last_persisted = highest, "raft log entries appended");
        Ok(())
    }

    /// Appends one hard-state record followed by a durable sync.
    pub fn persist_hard_state(&self, state: &HardState) -> Result<(), RaftWalError> {
        let mut inner = self.lock()?;
        let mut buf = Vec::new();
        encode_frame(&RaftWalRecord::HardState(state.clone()), &mut buf)?;
        inner.write_frames(&buf)?;
        trace!(term = state.term, vote = ?state.vote, commit = state.commit, "hard state persisted");
        Ok(())
    }

    /// Scans the whole file, returning log entries in file order and the
    /// hard state from the *last* hard-state record.
    ///
    /// A truncated or corrupt tail record terminates the scan; the valid
    /// prefix stands and the tail is cut on the next append. Safe to call
    /// repeatedly — replaying changes nothing.
    pub fn recover(&self) -> Result<(Vec<LogEntry>, HardState), RaftWalError> {
        let mut inner = self.lock()?;
        let file_len = inner.file.metadata()?.len();
        inner.file.seek(SeekFrom::Start(FILE_HEADER_SIZE as u64))?;

        let mut entries = Vec::new();
        let mut state = HardState::default();
        let mut offset = FILE_HEADER_SIZE as u64;
        let mut last_persisted = 0u64;

        loop {
            match read_frame(&mut inner.file, offset, file_len)? {
                FrameOutcome::Record { record, next } => {
                    match record {
                        RaftWalRecord::Log(entry) => {
                            last_persisted = last_persisted.max(entry.index);
                            entries.push(entry);
                        }
                        RaftWalRecord::HardState(s) => state = s,
                    }
                    offset = next;
                }
                FrameOutcome::Eof => break,
                FrameOutcome::Torn => {
                    warn!(
                        path = %self.path.display(),
                        offset,
                        "torn record at raft WAL tail, truncating on next write"
                    );
                    inner.needs_truncate = true;
                    break;
                }
            }
        }

        inner.valid_len = offset;
        inner.last_persisted = last_persisted;
        inner.file.seek(SeekFrom::End(0))?;

        debug!(
            path = %self.path.display(),
            entries = entries.len(),
            term = state.term,
            commit = state.commit,
            "raft WAL recovered"
        );
        Ok((entries, state))
    }

    /// Highest log-entry index persisted in this file.
    pub fn last_persisted(&self) -> Result<u64, RaftWalError> {
        Ok(self.lock()?.last_persisted)
    }

    /// Path of the WAL file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, WalFile>, RaftWalError> {
        self.inner
            .lock()
            .map_err(|_| RaftWalError::Internal("raft WAL mutex poisoned".into()))
    }
}

impl WalFile {
    /// Writes pre-encoded frames and fsyncs, cutting a torn tail first if
    /// recovery flagged one.
    fn write_frames(&mut self, buf: &[u8]) -> Result<(), RaftWalError> {
        if self.needs_truncate {
            self.file.set_len(self.valid_len)?;
            self.needs_truncate = false;
        }
        self.file.write_all(buf)?;
        self.file.sync_all()?;
        self.valid_len += buf.len() as u64;
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Frame I/O
// ------------------------------------------------------------------------------------------------

/// Appends `[len][payload][crc]` for one record to `buf`.
fn encode_frame(record: &RaftWalRecord, buf: &mut Vec<u8>) -> Result<(), RaftWalError> {
    let payload = encoding::encode_to_vec(record)?;
    let len_bytes = (payload.len() as u32).to_le_bytes();

    let mut hasher = Crc32::new();
    hasher.update(&len_bytes);
    hasher.update(&payload);

    buf.extend_from_slice(&len_bytes);
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&hasher.finalize().to_le_bytes());
    Ok(())
}

enum FrameOutcome {
    Record { record: RaftWalRecord, next: u64 },
    Eof,
    Torn,
}

fn read_frame(file: &mut File, offset: u64, file_len: u64) -> Result<FrameOutcome, RaftWalError> {
    if offset == file_len {
        return Ok(FrameOutcome::Eof);
    }
    if file_len - offset < 4 {
        return Ok(FrameOutcome::Torn);
    }

    file.seek(SeekFrom::Start(offset))?;
    let mut len_bytes = [0u8; 4];
    file.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as u64;

    if file_len - offset - 4 < len + 4 {
        return Ok(FrameOutcome::Torn);
    }

    let mut payload = vec![0u8; len as usize];
    file.read_exact(&mut payload)?;
    let mut crc_bytes = [0u8; 4];
    file.read_exact(&mut crc_bytes)?;
    let stored = u32::from_le_bytes(crc_bytes);

    let mut hasher = Crc32::new();
    hasher.update(&len_bytes);
    hasher.update(&payload);
    if hasher.finalize() != stored {
        return Ok(FrameOutcome::Torn);
    }

    let record = match encoding::decode_from_slice::<RaftWalRecord>(&payload) {
        Ok((record, _)) => record,
        // CRC-valid but undecodable: a future format, not bit rot.
        Err(e) => return Err(e.into()),
    };
    Ok(FrameOutcome::Record {
        record,
        next: offset + 4 + len + 4,
    })
}
