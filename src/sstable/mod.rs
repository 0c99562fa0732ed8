//! Sorted String Table (SSTable) Module
//!
//! Immutable, sorted, on-disk tables produced by flushing a memtable or by
//! compaction. Each table stores its records in one sorted data region,
//! followed by a bloom filter, a sparse index (one entry for every Nth
//! record), and a fixed-size footer locating the two blocks.
//!
//! # On-disk layout
//!
//! ```text
//! [MAGIC "SSST"][VERSION_LE u32][HEADER_CRC32_LE]
//! [record][record]…                      sorted by key, arena encoding
//! [BLOOM_LEN_LE][BLOOM_BYTES][BLOOM_CRC32_LE]
//! [INDEX_LEN_LE][INDEX_BYTES][INDEX_CRC32_LE]
//! [BLOOM_OFF_LE u64][INDEX_OFF_LE u64][FOOTER_CRC32_LE][FOOTER_MAGIC_LE]
//! ```
//!
//! Records use the arena encoding (`flags | key_len u16 | val_len u32 |
//! key | value`); the index maps every 16th key to the absolute file offset
//! of its record.
//!
//! # Naming & freshness
//!
//! Files are named `level<L>_<seq>.sst`. The sequence number comes from one
//! global counter, so a higher seq always means fresher data; readers probe
//! tables in descending-seq order and stop at the first hit.
//!
//! # Concurrency & lifetime
//!
//! Tables are immutable once renamed into place, so readers need no
//! locking. A [`SstReader`] is opened per lookup and dropped before the
//! read returns; compaction unlinks files only after the replacement table
//! is durable, and a reader racing that unlink simply skips the vanished
//! file.

pub mod builder;

#[cfg(test)]
mod tests;

pub use builder::SstWriter;

use std::{fs::File, io, path::Path};

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;
use tracing::trace;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

pub(crate) const SST_MAGIC: [u8; 4] = *b"SSST";
pub(crate) const SST_VERSION: u32 = 1;
pub(crate) const SST_FOOTER_MAGIC: u32 = u32::from_le_bytes(*b"sst1");

/// `magic(4) + version(4) + crc(4)`.
pub(crate) const SST_HEADER_SIZE: usize = 12;

/// `bloom_off(8) + index_off(8) + crc(4) + magic(4)`.
pub(crate) const SST_FOOTER_SIZE: usize = 24;

/// One sparse-index entry for every this many records.
pub(crate) const SPARSE_INDEX_EVERY: usize = 16;

pub(crate) const SST_BLOOM_FP_RATE: f64 = 0.01;

/// `flags(1) + key_len(2) + val_len(4)` — same shape as the arena record.
pub(crate) const RECORD_OVERHEAD: usize = 7;
pub(crate) const FLAG_TOMBSTONE: u8 = 0x01;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by SSTable operations (build, open, lookup).
#[derive(Debug, Error)]
pub enum SstableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A block or footer checksum did not match.
    #[error("checksum mismatch in {0}")]
    ChecksumMismatch(&'static str),

    /// Structural damage: bad magic, impossible offsets, truncated records.
    #[error("corrupt SSTable: {0}")]
    Corrupt(String),
}

// ------------------------------------------------------------------------------------------------
// Shared record type
// ------------------------------------------------------------------------------------------------

/// One key/value record (or tombstone) as it flows between the memtable,
/// the SSTable builder, and compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Key bytes.
    pub key: Vec<u8>,
    /// Value bytes (empty for tombstones).
    pub value: Vec<u8>,
    /// Whether this record marks a deletion.
    pub tombstone: bool,
}

/// Result of a point lookup against a single SSTable.
#[derive(Debug, PartialEq, Eq)]
pub enum SstGet {
    /// Live value for the key.
    Put(Vec<u8>),
    /// The key is deleted here; stop probing older tables.
    Tombstone,
    /// This table has no record for the key.
    NotFound,
}

/// Sparse index entry: first key of a stripe and the file offset of its
/// record.
#[derive(Debug, Clone)]
pub(crate) struct IndexEntry {
    pub(crate) key: Vec<u8>,
    pub(crate) offset: u64,
}

// ------------------------------------------------------------------------------------------------
// File naming
// ------------------------------------------------------------------------------------------------

/// File name for a table at `level` with freshness sequence `seq`.
pub fn table_file_name(level: u32, seq: u64) -> String {
    format!("level{level}_{seq:06}.sst")
}

/// Parses `level<L>_<seq>.sst` into `(level, seq)`.
pub fn parse_table_name(name: &str) -> Option<(u32, u64)> {
    let rest = name.strip_prefix("level")?.strip_suffix(".sst")?;
    let (level, seq) = rest.split_once('_')?;
    Some((level.parse().ok()?, seq.parse().ok()?))
}

// ------------------------------------------------------------------------------------------------
// SstReader
// ------------------------------------------------------------------------------------------------

/// A memory-mapped, immutable SSTable opened for reading.
#[derive(Debug)]
pub struct SstReader {
    mmap: Mmap,
    bloom: Option<Bloom<Vec<u8>>>,
    index: Vec<IndexEntry>,
    /// End of the data region (== bloom block offset).
    data_end: u64,
}

impl SstReader {
    /// Opens a table, verifying header, footer, and block checksums and
    /// loading the bloom filter and sparse index into memory.
    ///
    /// The mmap is read-only and the file is never modified after the
    /// rename that published it, so the mapping is safe to hold.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SstableError> {
        let file = File::open(path.as_ref())?;
        let mmap = unsafe { Mmap::map(&file)? };

        let file_len = mmap.len();
        if file_len < SST_HEADER_SIZE + SST_FOOTER_SIZE {
            return Err(SstableError::Corrupt("file too small".into()));
        }

        // Header: magic + version under CRC.
        let header = &mmap[..SST_HEADER_SIZE];
        let stored = u32::from_le_bytes(header[8..12].try_into().unwrap_or_default());
        if crc32(&header[..8]) != stored {
            return Err(SstableError::ChecksumMismatch("header"));
        }
        if header[..4] != SST_MAGIC {
            return Err(SstableError::Corrupt("header magic mismatch".into()));
        }
        let version = u32::from_le_bytes(header[4..8].try_into().unwrap_or_default());
        if version != SST_VERSION {
            return Err(SstableError::Corrupt(format!(
                "unsupported version {version}"
            )));
        }

        // Footer: block offsets under CRC, then magic.
        let footer = &mmap[file_len - SST_FOOTER_SIZE..];
        let footer_magic = u32::from_le_bytes(footer[20..24].try_into().unwrap_or_default());
        if footer_magic != SST_FOOTER_MAGIC {
            return Err(SstableError::Corrupt("footer magic mismatch".into()));
        }
        let stored = u32::from_le_bytes(footer[16..20].try_into().unwrap_or_default());
        if crc32(&footer[..16]) != stored {
            return Err(SstableError::ChecksumMismatch("footer"));
        }
        let bloom_off = u64::from_le_bytes(footer[0..8].try_into().unwrap_or_default());
        let index_off = u64::from_le_bytes(footer[8..16].try_into().unwrap_or_default());

        if bloom_off < SST_HEADER_SIZE as u64
            || index_off <= bloom_off
            || index_off >= file_len as u64
        {
            return Err(SstableError::Corrupt("block offsets out of range".into()));
        }

        let bloom_bytes = read_checksummed_block(&mmap, bloom_off, "bloom")?;
        let bloom = if bloom_bytes.is_empty() {
            None
        } else {
            // A bloom that fails to deserialize is only a lost optimization.
            Bloom::from_slice(bloom_bytes).ok()
        };

        let index_bytes = read_checksummed_block(&mmap, index_off, "index")?;
        let index = decode_index(index_bytes)?;

        Ok(Self {
            mmap,
            bloom,
            index,
            data_end: bloom_off,
        })
    }

    /// Point lookup: bloom check, binary search on the sparse index, then a
    /// linear scan of one stripe.
    pub fn get(&self, key: &[u8]) -> Result<SstGet, SstableError> {
        if let Some(bloom) = &self.bloom
            && !bloom.check(&key.to_vec())
        {
            trace!(key_len = key.len(), "bloom filter excluded key");
            return Ok(SstGet::NotFound);
        }
        if self.index.is_empty() {
            return Ok(SstGet::NotFound);
        }

        // Greatest index entry with key <= target marks the stripe start.
        let slot = match self.index.binary_search_by(|e| e.key.as_slice().cmp(key)) {
            Ok(i) => i,
            Err(0) => return Ok(SstGet::NotFound), // key sorts before the table
            Err(i) => i - 1,
        };
        let mut pos = self.index[slot].offset;
        let stripe_end = self
            .index
            .get(slot + 1)
            .map_or(self.data_end, |next| next.offset);

        while pos < stripe_end {
            let (record_key, value, tombstone, next) = parse_record(&self.mmap, pos)?;
            match record_key.cmp(key) {
                std::cmp::Ordering::Less => pos = next,
                std::cmp::Ordering::Equal => {
                    return Ok(if tombstone {
                        SstGet::Tombstone
                    } else {
                        SstGet::Put(value.to_vec())
                    });
                }
                std::cmp::Ordering::Greater => break,
            }
        }
        Ok(SstGet::NotFound)
    }

    /// Iterates every record in key order. Used by compaction.
    pub fn iter(&self) -> SstIter<'_> {
        SstIter {
            reader: self,
            pos: SST_HEADER_SIZE as u64,
        }
    }
}

/// Streaming iterator over a table's data region.
pub struct SstIter<'a> {
    reader: &'a SstReader,
    pos: u64,
}

impl Iterator for SstIter<'_> {
    type Item = Result<Record, SstableError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.reader.data_end {
            return None;
        }
        match parse_record(&self.reader.mmap, self.pos) {
            Ok((key, value, tombstone, next)) => {
                self.pos = next;
                Some(Ok(Record {
                    key: key.to_vec(),
                    value: value.to_vec(),
                    tombstone,
                }))
            }
            Err(e) => {
                self.pos = self.reader.data_end; // stop after an error
                Some(Err(e))
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Parsing helpers
// ------------------------------------------------------------------------------------------------

/// Parses the record at `pos`, returning `(key, value, tombstone,
/// next_pos)` with the slices borrowing from the mapping.
fn parse_record(mmap: &Mmap, pos: u64) -> Result<(&[u8], &[u8], bool, u64), SstableError> {
    let start = pos as usize;
    let header = mmap
        .get(start..start + RECORD_OVERHEAD)
        .ok_or_else(|| SstableError::Corrupt(format!("truncated record header at {pos}")))?;

    let tombstone = header[0] & FLAG_TOMBSTONE != 0;
    let key_len = u16::from_le_bytes([header[1], header[2]]) as usize;
    let val_len = u32::from_le_bytes([header[3], header[4], header[5], header[6]]) as usize;

    let key_start = start + RECORD_OVERHEAD;
    let key = mmap
        .get(key_start..key_start + key_len)
        .ok_or_else(|| SstableError::Corrupt(format!("truncated key at {pos}")))?;
    let value = mmap
        .get(key_start + key_len..key_start + key_len + val_len)
        .ok_or_else(|| SstableError::Corrupt(format!("truncated value at {pos}")))?;

    let next = (key_start + key_len + val_len) as u64;
    Ok((key, value, tombstone, next))
}

/// Reads a `[len][bytes][crc]` block at `offset` and verifies its checksum.
fn read_checksummed_block<'a>(
    mmap: &'a Mmap,
    offset: u64,
    what: &'static str,
) -> Result<&'a [u8], SstableError> {
    let start = offset as usize;
    let len_bytes = mmap
        .get(start..start + 4)
        .ok_or_else(|| SstableError::Corrupt(format!("truncated {what} block length")))?;
    let len = u32::from_le_bytes(len_bytes.try_into().unwrap_or_default()) as usize;

    let data = mmap
        .get(start + 4..start + 4 + len)
        .ok_or_else(|| SstableError::Corrupt(format!("truncated {what} block")))?;
    let crc_bytes = mmap
        .get(start + 4 + len..start + 8 + len)
        .ok_or_else(|| SstableError::Corrupt(format!("truncated {what} block checksum")))?;
    let stored = u32::from_le_bytes(crc_bytes.try_into().unwrap_or_default());

    if crc32(data) != stored {
        return Err(SstableError::ChecksumMismatch(what));
    }
    Ok(data)
}

/// Decodes the sparse index block: `[count u32]` then
/// `[key_len u16][key][offset u64]` per entry.
fn decode_index(bytes: &[u8]) -> Result<Vec<IndexEntry>, SstableError> {
    let corrupt = || SstableError::Corrupt("malformed index block".into());

    let count_bytes = bytes.get(..4).ok_or_else(corrupt)?;
    let count = u32::from_le_bytes(count_bytes.try_into().unwrap_or_default()) as usize;

    let mut entries = Vec::with_capacity(count);
    let mut pos = 4usize;
    for _ in 0..count {
        let len_bytes = bytes.get(pos..pos + 2).ok_or_else(corrupt)?;
        let key_len = u16::from_le_bytes(len_bytes.try_into().unwrap_or_default()) as usize;
        pos += 2;

        let key = bytes.get(pos..pos + key_len).ok_or_else(corrupt)?.to_vec();
        pos += key_len;

        let off_bytes = bytes.get(pos..pos + 8).ok_or_else(corrupt)?;
        let offset = u64::from_le_bytes(off_bytes.try_into().unwrap_or_default());
        pos += 8;

        entries.push(IndexEntry { key, offset });
    }
    if pos != bytes.len() {
        return Err(corrupt());
    }
    Ok(entries)
}

pub(crate) fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    hasher.finalize()
}
