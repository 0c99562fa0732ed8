//! Key-value write-ahead log.
//!
//! Every memtable owns exactly one WAL segment, named `wal_<seq>.log` inside
//! the node's WAL directory. A mutation is appended and fsynced here before
//! it touches the in-memory state; when the memtable is eventually flushed
//! to an SSTable, its segment is deleted.
//!
//! # On-disk layout
//!
//! ```text
//! [MAGIC "SWAL"][VERSION_LE u32][SEQ_LE u64][HEADER_CRC32_LE]
//! [CRC32_LE][LSN_LE u64][TIMESTAMP_LE u64][CMD u8][KEY_LEN_LE u32][VAL_LEN_LE u32][KEY][VALUE]
//! ...
//! ```
//!
//! The record CRC covers every byte of the record after itself. The LSN is
//! the byte offset of the record within the record area, so recovery can
//! cross-check positions for free. The timestamp is informational.
//!
//! # Recovery contract
//!
//! Replay scans records until EOF. A short read or CRC mismatch at the tail
//! is a torn write: recovery stops cleanly, keeps everything before it, and
//! the tail is truncated on the next write. A CRC mismatch that is followed
//! by another valid record is real mid-file corruption and fails recovery.

#[cfg(test)]
mod tests;

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Fixed part of every record: `crc(4) + lsn(8) + timestamp(8) + cmd(1) +
/// key_len(4) + val_len(4)`.
pub const RECORD_HEADER_SIZE: usize = 29;

const WAL_MAGIC: [u8; 4] = *b"SWAL";
const WAL_VERSION: u32 = 1;

/// On-disk size of the file header: `magic(4) + version(4) + seq(8) + crc(4)`.
const FILE_HEADER_SIZE: usize = 20;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by KV WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The file header failed validation (bad magic, version, or checksum).
    #[error("invalid WAL header: {0}")]
    InvalidHeader(String),

    /// A corrupt record was found with valid records after it.
    #[error("WAL corruption at offset {offset}")]
    Corruption {
        /// File offset of the first bad record.
        offset: u64,
    },

    /// A record claimed an unknown command byte mid-file.
    #[error("unknown WAL command byte: {0}")]
    UnknownCommand(u8),
}

// ------------------------------------------------------------------------------------------------
// Record types
// ------------------------------------------------------------------------------------------------

/// Mutation kind carried by a WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalCommand {
    /// Insert or update a key.
    Put = 1,
    /// Delete a key (the value bytes may be empty).
    Delete = 2,
}

impl WalCommand {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(WalCommand::Put),
            2 => Some(WalCommand::Delete),
            _ => None,
        }
    }
}

/// A decoded WAL record, as returned by recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    /// Byte offset of the record within the record area.
    pub lsn: u64,
    /// Wall-clock nanoseconds at append time. Informational only.
    pub timestamp: u64,
    /// Mutation kind.
    pub cmd: WalCommand,
    /// Key bytes.
    pub key: Vec<u8>,
    /// Value bytes (empty for deletes).
    pub value: Vec<u8>,
}

// ------------------------------------------------------------------------------------------------
// KvWal
// ------------------------------------------------------------------------------------------------

/// A single KV WAL segment.
///
/// Not internally synchronized: the owning memtable is guarded by the
/// store's lock, which serializes all appends.
#[derive(Debug)]
pub struct KvWal {
    file: File,
    path: PathBuf,
    seq: u64,

    /// LSN assigned to the next record (byte offset in the record area).
    next_lsn: u64,

    /// File length up to and including the last valid record.
    valid_len: u64,

    /// Set when recovery found a torn tail that must be cut before the
    /// next append.
    needs_truncate: bool,
}

impl KvWal {
    /// Opens or creates segment `wal_<seq>.log` under `dir` and replays it.
    ///
    /// Returns the WAL handle together with every valid record in file
    /// order. A torn tail terminates replay cleanly; mid-file corruption
    /// (a later valid record exists) is fatal.
    pub fn open(dir: &Path, seq: u64) -> Result<(Self, Vec<WalEntry>), WalError> {
        let path = dir.join(segment_file_name(seq));
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        if file.metadata()?.len() == 0 {
            write_file_header(&mut file, seq)?;
            file.sync_all()?;
            info!(path = %path.display(), seq, "KV WAL segment created");

            let wal = Self {
                file,
                path,
                seq,
                next_lsn: 0,
                valid_len: FILE_HEADER_SIZE as u64,
                needs_truncate: false,
            };
            return Ok((wal, Vec::new()));
        }

        file.seek(SeekFrom::Start(0))?;
        read_and_validate_header(&mut file, seq)?;

        let mut wal = Self {
            file,
            path,
            seq,
            next_lsn: 0,
            valid_len: FILE_HEADER_SIZE as u64,
            needs_truncate: false,
        };
        let entries = wal.recover()?;

        info!(
            path = %wal.path.display(),
            seq,
            records = entries.len(),
            "KV WAL segment opened"
        );
        Ok((wal, entries))
    }

    /// Appends one record and fsyncs before returning.
    ///
    /// If recovery left a torn tail behind, it is cut here, immediately
    /// before the first new write.
    pub fn append(&mut self, key: &[u8], value: &[u8], cmd: WalCommand) -> Result<(), WalError> {
        if self.needs_truncate {
            warn!(
                path = %self.path.display(),
                valid_len = self.valid_len,
                "truncating torn WAL tail before append"
            );
            self.file.set_len(self.valid_len)?;
            self.needs_truncate = false;
        }

        let total = RECORD_HEADER_SIZE + key.len() + value.len();
        let mut buf = vec![0u8; total];

        let timestamp = unix_nanos();
        buf[4..12].copy_from_slice(&self.next_lsn.to_le_bytes());
        buf[12..20].copy_from_slice(&timestamp.to_le_bytes());
        buf[20] = cmd as u8;
        buf[21..25].copy_from_slice(&(key.len() as u32).to_le_bytes());
        buf[25..29].copy_from_slice(&(value.len() as u32).to_le_bytes());
        buf[29..29 + key.len()].copy_from_slice(key);
        buf[29 + key.len()..].copy_from_slice(value);

        let mut hasher = Crc32::new();
        hasher.update(&buf[4..]);
        buf[0..4].copy_from_slice(&hasher.finalize().to_le_bytes());

        self.file.write_all(&buf)?;
        self.file.sync_all()?;

        trace!(lsn = self.next_lsn, len = total, "KV WAL record appended");

        self.next_lsn += total as u64;
        self.valid_len += total as u64;
        Ok(())
    }

    /// Path of the underlying segment file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Segment sequence number.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Replays the segment from the start, returning all valid records.
    ///
    /// Restores `next_lsn` and `valid_len` as a side effect.
    fn recover(&mut self) -> Result<Vec<WalEntry>, WalError> {
        self.file.seek(SeekFrom::Start(FILE_HEADER_SIZE as u64))?;

        let file_len = self.file.metadata()?.len();
        let mut entries = Vec::new();
        let mut offset = FILE_HEADER_SIZE as u64;

        loop {
            match read_record(&mut self.file, offset, file_len)? {
                RecordOutcome::Entry { entry, next_offset } => {
                    self.next_lsn = entry.lsn + (next_offset - offset);
                    entries.push(entry);
                    offset = next_offset;
                }
                RecordOutcome::Eof => break,
                RecordOutcome::Torn => {
                    // A later valid record turns a torn tail into real
                    // corruption.
                    if has_valid_record_after(&mut self.file, offset, file_len) {
                        return Err(WalError::Corruption { offset });
                    }
                    warn!(
                        path = %self.path.display(),
                        offset,
                        "torn record at WAL tail, truncating on next write"
                    );
                    self.needs_truncate = true;
                    break;
                }
            }
        }

        self.valid_len = offset;
        // Re-position the append cursor past any garbage we will cut later.
        self.file.seek(SeekFrom::End(0))?;

        debug!(
            path = %self.path.display(),
            records = entries.len(),
            valid_len = self.valid_len,
            "KV WAL recovery complete"
        );
        Ok(entries)
    }
}

/// Segment file name for a sequence number.
pub fn segment_file_name(seq: u64) -> String {
    format!("wal_{seq:06}.log")
}

/// Parses the sequence number out of a `wal_<seq>.log` file name.
pub fn parse_segment_seq(name: &str) -> Option<u64> {
    name.strip_prefix("wal_")
        .and_then(|s| s.strip_suffix(".log"))
        .and_then(|s| s.parse::<u64>().ok())
}

// ------------------------------------------------------------------------------------------------
// Record scanning
// ------------------------------------------------------------------------------------------------

enum RecordOutcome {
    Entry { entry: WalEntry, next_offset: u64 },
    Eof,
    Torn,
}

/// Reads one record at `offset`. Distinguishes clean EOF, a complete valid
/// record, and a torn/corrupt record.
fn read_record(file: &mut File, offset: u64, file_len: u64) -> Result<RecordOutcome, WalError> {
    if offset == file_len {
        return Ok(RecordOutcome::Eof);
    }
    if file_len - offset < RECORD_HEADER_SIZE as u64 {
        return Ok(RecordOutcome::Torn);
    }

    file.seek(SeekFrom::Start(offset))?;
    let mut header = [0u8; RECORD_HEADER_SIZE];
    file.read_exact(&mut header)?;

    let crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let lsn = u64::from_le_bytes(header[4..12].try_into().unwrap_or_default());
    let timestamp = u64::from_le_bytes(header[12..20].try_into().unwrap_or_default());
    let cmd_byte = header[20];
    let key_len = u32::from_le_bytes(header[21..25].try_into().unwrap_or_default()) as u64;
    let val_len = u32::from_le_bytes(header[25..29].try_into().unwrap_or_default()) as u64;

    let payload_len = key_len + val_len;
    if file_len - offset - (RECORD_HEADER_SIZE as u64) < payload_len {
        return Ok(RecordOutcome::Torn);
    }

    let mut payload = vec![0u8; payload_len as usize];
    file.read_exact(&mut payload)?;

    let mut hasher = Crc32::new();
    hasher.update(&header[4..]);
    hasher.update(&payload);
    if hasher.finalize() != crc {
        return Ok(RecordOutcome::Torn);
    }

    let cmd = match WalCommand::from_byte(cmd_byte) {
        Some(cmd) => cmd,
        // The CRC matched, so this is a record from a future format rather
        // than bit rot; refuse to guess.
        None => return Err(WalError::UnknownCommand(cmd_byte)),
    };

    let value = payload.split_off(key_len as usize);
    let entry = WalEntry {
        lsn,
        timestamp,
        cmd,
        key: payload,
        value,
    };
    let next_offset = offset + RECORD_HEADER_SIZE as u64 + payload_len;
    Ok(RecordOutcome::Entry { entry, next_offset })
}

/// After a bad record at `bad_offset`, probes whether any later position
/// parses as a valid record. Used to tell a torn tail from mid-file
/// corruption.
fn has_valid_record_after(file: &mut File, bad_offset: u64, file_len: u64) -> bool {
    // The bad record's claimed extent is unreliable, so probe every byte
    // position after it. Segments are small (one memtable's worth), and
    // this path only runs after a crash.
    let mut probe = bad_offset + 1;
    while probe + (RECORD_HEADER_SIZE as u64) <= file_len {
        if let Ok(RecordOutcome::Entry { .. }) = read_record(file, probe, file_len) {
            return true;
        }
        probe += 1;
    }
    false
}

// ------------------------------------------------------------------------------------------------
// File header I/O
// ------------------------------------------------------------------------------------------------

fn write_file_header(file: &mut File, seq: u64) -> Result<(), WalError> {
    let mut buf = [0u8; FILE_HEADER_SIZE];
    buf[0..4].copy_from_slice(&WAL_MAGIC);
    buf[4..8].copy_from_slice(&WAL_VERSION.to_le_bytes());
    buf[8..16].copy_from_slice(&seq.to_le_bytes());

    let mut hasher = Crc32::new();
    hasher.update(&buf[..16]);
    buf[16..20].copy_from_slice(&hasher.finalize().to_le_bytes());

    file.write_all(&buf)?;
    Ok(())
}

fn read_and_validate_header(file: &mut File, expected_seq: u64) -> Result<(), WalError> {
    let mut buf = [0u8; FILE_HEADER_SIZE];
    file.read_exact(&mut buf)
        .map_err(|_| WalError::InvalidHeader("file shorter than header".into()))?;

    let mut hasher = Crc32::new();
    hasher.update(&buf[..16]);
    let stored = u32::from_le_bytes(buf[16..20].try_into().unwrap_or_default());
    if hasher.finalize() != stored {
        return Err(WalError::InvalidHeader("header checksum mismatch".into()));
    }

    if buf[0..4] != WAL_MAGIC {
        return Err(WalError::InvalidHeader("bad magic".into()));
    }
    let version = u32::from_le_bytes(buf[4..8].try_into().unwrap_or_default());
    if version != WAL_VERSION {
        return Err(WalError::InvalidHeader(format!(
            "unsupported version {version}"
        )));
    }
    let seq = u64::from_le_bytes(buf[8..16].try_into().unwrap_or_default());
    if seq != expected_seq {
        return Err(WalError::InvalidHeader(format!(
            "sequence mismatch: file says {seq}, expected {expected_seq}"
        )));
    }
    Ok(())
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
