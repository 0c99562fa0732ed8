//! Compaction — merges SSTables into one fresher table.
//!
//! A compaction run takes every live table (newest first), performs a
//! streaming k-way merge keeping only the freshest record per key, and
//! writes the survivors into a single new table one level up. Tombstones
//! are dropped when no older table below could still hold the key — since
//! a run always consumes *all* live tables, every tombstone is spent and
//! none survives the merge.
//!
//! The engine serializes runs with a compaction lock and unlinks the input
//! files only after the output is durable, so readers racing a run either
//! see the old tables or the new one, never a gap.

#[cfg(test)]
mod tests;

use std::{io, iter::Peekable, path::{Path, PathBuf}};

use thiserror::Error;
use tracing::{debug, info};

use crate::sstable::{Record, SstIter, SstReader, SstWriter, SstableError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by compaction.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// Error reading an input table or writing the output table.
    #[error("SSTable error: {0}")]
    Sstable(#[from] SstableError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// What a compaction run produced.
#[derive(Debug)]
pub struct CompactionOutcome {
    /// The new table, or `None` when every surviving record was a spent
    /// tombstone and nothing needed writing.
    pub output: Option<PathBuf>,
    /// Records written to the output.
    pub records: usize,
    /// Tombstones dropped by the merge.
    pub dropped_tombstones: usize,
}

// ------------------------------------------------------------------------------------------------
// Merge iterator
// ------------------------------------------------------------------------------------------------

/// Streaming merge over several sorted tables.
///
/// Inputs are ordered newest first; when multiple tables hold the same key,
/// the record from the lowest-ranked (freshest) input wins and the staler
/// duplicates are consumed silently.
pub struct MergeIter<'a> {
    inputs: Vec<Peekable<SstIter<'a>>>,
}

impl<'a> MergeIter<'a> {
    /// Builds a merge over the given readers, newest first.
    pub fn new(readers_newest_first: &'a [SstReader]) -> Self {
        Self {
            inputs: readers_newest_first
                .iter()
                .map(|r| r.iter().peekable())
                .collect(),
        }
    }
}

impl Iterator for MergeIter<'_> {
    type Item = Result<Record, SstableError>;

    fn next(&mut self) -> Option<Self::Item> {
        // Find the smallest head key; ties go to the freshest input.
        let mut winner: Option<(usize, Vec<u8>)> = None;
        for (rank, input) in self.inputs.iter_mut().enumerate() {
            match input.peek() {
                None => continue,
                Some(Err(_)) => {
                    // Surface the error we just peeked.
                    return input.next();
                }
                Some(Ok(record)) => {
                    let better = match &winner {
                        None => true,
                        Some((_, best_key)) => record.key < *best_key,
                    };
                    if better {
                        winner = Some((rank, record.key.clone()));
                    }
                }
            }
        }

        let (rank, _) = winner?;
        let record = match self.inputs[rank].next() {
            Some(Ok(record)) => record,
            other => return other,
        };

        // Consume the same key from every staler input.
        for input in self.inputs.iter_mut().skip(rank + 1) {
            while let Some(Ok(head)) = input.peek() {
                if head.key == record.key {
                    input.next();
                } else {
                    break;
                }
            }
        }

        Some(Ok(record))
    }
}

// ------------------------------------------------------------------------------------------------
// Compaction run
// ------------------------------------------------------------------------------------------------

/// Merges `inputs` (newest first) into a single table at `output_path`.
///
/// Keeps the freshest record per key and drops all tombstones — the caller
/// passes every live table, so nothing older remains below. Returns the
/// outcome; the caller swaps the reader list and unlinks the inputs.
pub fn compact_tables(
    inputs_newest_first: &[PathBuf],
    output_path: &Path,
) -> Result<CompactionOutcome, CompactionError> {
    let mut readers = Vec::with_capacity(inputs_newest_first.len());
    for path in inputs_newest_first {
        readers.push(SstReader::open(path)?);
    }

    let mut survivors = Vec::new();
    let mut dropped = 0usize;
    for record in MergeIter::new(&readers) {
        let record = record?;
        if record.tombstone {
            dropped += 1;
        } else {
            survivors.push(record);
        }
    }

    if survivors.is_empty() {
        debug!(
            inputs = inputs_newest_first.len(),
            dropped_tombstones = dropped,
            "compaction produced no live records, skipping output"
        );
        return Ok(CompactionOutcome {
            output: None,
            records: 0,
            dropped_tombstones: dropped,
        });
    }

    let records = survivors.len();
    SstWriter::new(output_path).build(&survivors)?;

    info!(
        inputs = inputs_newest_first.len(),
        output = %output_path.display(),
        records,
        dropped_tombstones = dropped,
        "compaction complete"
    );
    Ok(CompactionOutcome {
        output: Some(output_path.to_path_buf()),
        records,
        dropped_tombstones: dropped,
    })
}
