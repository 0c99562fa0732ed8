//! # Memtable Module
//!
//! The mutable, in-memory write buffer of the storage engine: a hash index
//! from key to an offset in an append-only [`Arena`], plus the WAL segment
//! this memtable exclusively owns.
//!
//! ## Design Invariants
//!
//! - Every mutation is appended to the owned WAL segment and fsynced
//!   *before* it is applied in memory.
//! - The latest record for a key wins; tombstones are records with the
//!   delete flag set, never physical removals.
//! - A memtable and its WAL segment live and die together: rotation hands
//!   the pair to the frozen slot, and the flush worker deletes the segment
//!   only after the SSTable replacing it is durable.
//! - No internal locking — the enclosing store lock serializes access
//!   (readers under the read half, writers under the write half).

pub mod arena;

#[cfg(test)]
mod tests;

use std::{collections::HashMap, path::Path};

use thiserror::Error;
use tracing::{debug, info};

use crate::sstable::Record;
use crate::wal::{KvWal, WalCommand, WalEntry, WalError};

pub use arena::{Arena, ArenaRecord, record_len};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Memtable`] operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// Underlying WAL failure.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Key longer than the arena record format can address.
    #[error("key too large: {0} bytes")]
    KeyTooLarge(usize),

    /// Value longer than the arena record format can address.
    #[error("value too large: {0} bytes")]
    ValueTooLarge(usize),

    /// Internal invariant violation (dangling arena offset).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result of a point lookup against a single memtable.
#[derive(Debug, PartialEq, Eq)]
pub enum MemtableGet {
    /// Live value for the key.
    Put(Vec<u8>),
    /// The key was deleted; shadows anything older.
    Tombstone,
    /// This memtable knows nothing about the key.
    NotFound,
}

// ------------------------------------------------------------------------------------------------
// Memtable
// ------------------------------------------------------------------------------------------------

/// In-memory write buffer: hash index over an arena, backed by one WAL
/// segment.
#[derive(Debug)]
pub struct Memtable {
    index: HashMap<Vec<u8>, u32>,
    arena: Arena,
    wal: KvWal,
}

impl Memtable {
    /// Opens the WAL segment `wal_<seq>.log` under `wal_dir` and rebuilds
    /// the in-memory state from it.
    ///
    /// A fresh segment yields an empty memtable; an existing one (crash
    /// recovery) is replayed record by record without re-appending.
    pub fn open(wal_dir: &Path, seq: u64) -> Result<Self, MemtableError> {
        let (wal, recovered) = KvWal::open(wal_dir, seq)?;

        let mut memtable = Self {
            index: HashMap::new(),
            arena: Arena::new(),
            wal,
        };
        let replayed = recovered.len();
        for entry in recovered {
            memtable.apply_replayed(entry);
        }

        if replayed > 0 {
            info!(seq, records = replayed, "memtable rebuilt from WAL");
        } else {
            debug!(seq, "fresh memtable created");
        }
        Ok(memtable)
    }

    /// Inserts or updates a key. WAL-first, then arena and index.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), MemtableError> {
        self.write(key, value, WalCommand::Put)
    }

    /// Deletes a key by writing a tombstone record.
    pub fn delete(&mut self, key: &[u8]) -> Result<(), MemtableError> {
        self.write(key, b"", WalCommand::Delete)
    }

    fn write(&mut self, key: &[u8], value: &[u8], cmd: WalCommand) -> Result<(), MemtableError> {
        if key.len() > arena::MAX_KEY_LEN {
            return Err(MemtableError::KeyTooLarge(key.len()));
        }
        if value.len() > arena::MAX_VALUE_LEN {
            return Err(MemtableError::ValueTooLarge(value.len()));
        }

        self.wal.append(key, value, cmd)?;

        let tombstone = cmd == WalCommand::Delete;
        let offset = self.arena.append(key, value, tombstone);
        self.index.insert(key.to_vec(), offset);
        Ok(())
    }

    /// Point lookup. A tombstone is reported as such so the caller can stop
    /// probing older tiers.
    pub fn get(&self, key: &[u8]) -> MemtableGet {
        let Some(&offset) = self.index.get(key) else {
            return MemtableGet::NotFound;
        };
        match self.arena.read(offset) {
            Some(rec) if rec.tombstone => MemtableGet::Tombstone,
            Some(rec) => MemtableGet::Put(rec.value.to_vec()),
            // An offset we handed out ourselves always resolves; treat a
            // miss like an absent key rather than poisoning the read path.
            None => MemtableGet::NotFound,
        }
    }

    /// Bytes of encoded records held in the arena. This is the size the
    /// rotation threshold is compared against.
    pub fn approximate_size(&self) -> usize {
        self.arena.len()
    }

    /// True when no record has ever been written.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Number of live keys (latest record per key).
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Sequence number of the owned WAL segment.
    pub fn wal_seq(&self) -> u64 {
        self.wal.seq()
    }

    /// Path of the owned WAL segment, for deletion after flush.
    pub fn wal_path(&self) -> std::path::PathBuf {
        self.wal.path().to_path_buf()
    }

    /// Snapshot of the live records in ascending key order, ready for the
    /// SSTable builder.
    pub fn sorted_records(&self) -> Result<Vec<Record>, MemtableError> {
        let mut records = Vec::with_capacity(self.index.len());
        for (key, &offset) in &self.index {
            let rec = self.arena.read(offset).ok_or_else(|| {
                MemtableError::Internal(format!("dangling arena offset {offset}"))
            })?;
            records.push(Record {
                key: key.clone(),
                value: rec.value.to_vec(),
                tombstone: rec.tombstone,
            });
        }
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }

    /// Applies one recovered WAL record in memory, without re-logging it.
    fn apply_replayed(&mut self, entry: WalEntry) {
        let tombstone = entry.cmd == WalCommand::Delete;
        let offset = self.arena.append(&entry.key, &entry.value, tombstone);
        self.index.insert(entry.key, offset);
    }
}
