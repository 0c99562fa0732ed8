//! SSTable writer — builds a complete table file from key-sorted records.
//!
//! # Input requirements
//!
//! Records must be sorted by key with at most one record per key (the
//! memtable snapshot and the compaction merge both guarantee this), and at
//! least one record must be supplied.
//!
//! # Atomicity
//!
//! 1. Write everything to `<path>.tmp`.
//! 2. Flush and fsync.
//! 3. Rename `<path>.tmp` → `<path>`.
//!
//! A crash can leave a stale `.tmp` behind but never a half-written table
//! under the published name; the engine removes orphaned `.tmp` files on
//! startup.

use std::{
    fs::{File, OpenOptions, rename},
    io::{BufWriter, Write},
    path::Path,
};

use bloomfilter::Bloom;
use tracing::info;

use super::{
    FLAG_TOMBSTONE, RECORD_OVERHEAD, Record, SPARSE_INDEX_EVERY, SST_BLOOM_FP_RATE,
    SST_FOOTER_MAGIC, SST_MAGIC, SST_VERSION, SstableError, crc32,
};

/// Builds one SSTable file on disk.
///
/// ```rust,ignore
/// SstWriter::new(&path).build(&records)?;
/// ```
pub struct SstWriter<P: AsRef<Path>> {
    path: P,
}

impl<P: AsRef<Path>> SstWriter<P> {
    /// Create a writer targeting the given output path.
    pub fn new(path: P) -> Self {
        Self { path }
    }

    /// Writes header, sorted records, bloom filter, sparse index, and
    /// footer, then atomically publishes the file.
    pub fn build(self, records: &[Record]) -> Result<(), SstableError> {
        if records.is_empty() {
            return Err(SstableError::Corrupt(
                "refusing to build an empty SSTable".into(),
            ));
        }
        debug_assert!(records.windows(2).all(|w| w[0].key < w[1].key));

        let final_path = self.path.as_ref();
        let tmp_path = final_path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut writer = BufWriter::new(&mut file);

        // 1. Header.
        let mut header = [0u8; 12];
        header[0..4].copy_from_slice(&SST_MAGIC);
        header[4..8].copy_from_slice(&SST_VERSION.to_le_bytes());
        let crc = crc32(&header[..8]);
        header[8..12].copy_from_slice(&crc.to_le_bytes());
        writer.write_all(&header)?;

        // 2. Data region + bloom + sparse index, in one pass.
        let mut bloom = Bloom::new_for_fp_rate(records.len(), SST_BLOOM_FP_RATE)
            .map_err(|e| SstableError::Corrupt(e.to_string()))?;
        let mut index = Vec::new();
        let mut offset = header.len() as u64;

        for (i, record) in records.iter().enumerate() {
            bloom.set(&record.key);
            if i % SPARSE_INDEX_EVERY == 0 {
                index.push((record.key.clone(), offset));
            }
            offset += write_record(&mut writer, record)?;
        }

        // 3. Bloom block.
        let bloom_off = offset;
        offset += write_checksummed_block(&mut writer, bloom.as_slice())?;

        // 4. Sparse index block.
        let index_off = offset;
        write_checksummed_block(&mut writer, &encode_index(&index))?;

        // 5. Footer.
        let mut footer = [0u8; 24];
        footer[0..8].copy_from_slice(&bloom_off.to_le_bytes());
        footer[8..16].copy_from_slice(&index_off.to_le_bytes());
        let crc = crc32(&footer[..16]);
        footer[16..20].copy_from_slice(&crc.to_le_bytes());
        footer[20..24].copy_from_slice(&SST_FOOTER_MAGIC.to_le_bytes());
        writer.write_all(&footer)?;

        // 6. Make it durable, then publish.
        writer.flush()?;
        drop(writer);
        file.sync_all()?;
        rename(&tmp_path, final_path)?;
        sync_parent_dir(final_path)?;

        info!(
            path = %final_path.display(),
            records = records.len(),
            index_entries = index.len(),
            "SSTable written"
        );
        Ok(())
    }
}

/// Writes one record in arena encoding; returns its encoded length.
fn write_record(writer: &mut impl Write, record: &Record) -> Result<u64, SstableError> {
    let mut head = [0u8; RECORD_OVERHEAD];
    head[0] = if record.tombstone { FLAG_TOMBSTONE } else { 0 };
    head[1..3].copy_from_slice(&(record.key.len() as u16).to_le_bytes());
    head[3..7].copy_from_slice(&(record.value.len() as u32).to_le_bytes());

    writer.write_all(&head)?;
    writer.write_all(&record.key)?;
    writer.write_all(&record.value)?;
    Ok((RECORD_OVERHEAD + record.key.len() + record.value.len()) as u64)
}

/// Writes a `[len][bytes][crc]` block; returns the total bytes written.
fn write_checksummed_block(writer: &mut impl Write, data: &[u8]) -> Result<u64, SstableError> {
    writer.write_all(&(data.len() as u32).to_le_bytes())?;
    writer.write_all(data)?;
    writer.write_all(&crc32(data).to_le_bytes())?;
    Ok(4 + data.len() as u64 + 4)
}

/// Encodes the sparse index: `[count u32]` then
/// `[key_len u16][key][offset u64]` per entry.
fn encode_index(entries: &[(Vec<u8>, u64)]) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for (key, offset) in entries {
        bytes.extend_from_slice(&(key.len() as u16).to_le_bytes());
        bytes.extend_from_slice(key);
        bytes.extend_from_slice(&offset.to_le_bytes());
    }
    bytes
}

/// Fsync the directory containing `path` so the rename itself is durable.
fn sync_parent_dir(path: &Path) -> Result<(), SstableError> {
    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        dir.sync_all()?;
    }
    Ok(())
}
