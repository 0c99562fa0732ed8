//! # LSM Storage Engine
//!
//! A synchronous, crash-safe LSM-tree engine: an active memtable taking
//! writes, at most one frozen memtable awaiting flush, and immutable
//! SSTables on disk, queried newest-first.
//!
//! ## Write path
//!
//! A write first checks whether the encoded record still fits the active
//! memtable. If not, the memtable rotates: with the frozen slot already
//! occupied the write fails with [`EngineError::WriteStall`] (backpressure
//! the applier retries); otherwise the active table moves into the frozen
//! slot, a fresh memtable with a fresh WAL segment takes its place, and the
//! flush worker is signalled. The record then goes WAL-first into the
//! active memtable.
//!
//! ## Read path
//!
//! Under the read lock: active memtable, then frozen. The lock is released
//! before any disk I/O; SSTables are then probed freshest-first, and the
//! first hit (value or tombstone) decides the result.
//!
//! ## Background workers
//!
//! One flush worker drains the frozen slot into a new level-0 SSTable and
//! deletes the memtable's WAL segment afterwards; flush failures are
//! retried, persistent failure aborts the process (losing acknowledged
//! writes would be worse). One compaction worker periodically merges all
//! live tables into a single fresher one, dropping spent tombstones. Both
//! stop through an explicit shutdown protocol in [`Engine::close`].
//!
//! ## Freshness ordering
//!
//! Tables are ordered by their global sequence number, descending; ties
//! (a compaction output briefly coexisting with its newest input) prefer
//! the lower level. A compaction output reuses its newest input's sequence
//! number, so a table flushed mid-compaction always outranks the merged
//! output — the merge can only contain older data.

#[cfg(test)]
mod tests;

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use crossbeam::channel::{Receiver, Sender, bounded, tick, unbounded};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::compaction::{CompactionError, compact_tables};
use crate::memtable::{self, Memtable, MemtableError, MemtableGet};
use crate::sstable::{
    SstGet, SstReader, SstWriter, SstableError, parse_table_name, table_file_name,
};
use crate::wal;

/// Attempts before a failing flush takes the process down.
const FLUSH_MAX_RETRIES: u32 = 5;

/// Delay between flush retry attempts.
const FLUSH_RETRY_BACKOFF: Duration = Duration::from_millis(100);

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Error originating from a memtable or its WAL.
    #[error("memtable error: {0}")]
    Memtable(#[from] MemtableError),

    /// Error originating from the SSTable subsystem.
    #[error("SSTable error: {0}")]
    Sstable(#[from] SstableError),

    /// Error originating from compaction.
    #[error("compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The memtable is full and the previous frozen table has not finished
    /// flushing. The caller should back off and retry.
    #[error("write stall: frozen memtable still flushing")]
    WriteStall,

    /// Internal invariant violation (poisoned lock, unexpected state).
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration & stats
// ------------------------------------------------------------------------------------------------

/// Configuration for an [`Engine`] instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding the KV WAL segments.
    pub wal_dir: PathBuf,

    /// Directory holding the SSTables.
    pub sst_dir: PathBuf,

    /// Max memtable size (bytes of encoded records) before rotation.
    pub memtable_limit: usize,

    /// How often the background compaction worker wakes up.
    pub compaction_interval: Duration,

    /// Minimum number of live tables before a compaction run merges them.
    pub compaction_min_tables: usize,
}

impl EngineConfig {
    /// Defaults tuned for small clusters; tests shrink `memtable_limit`
    /// to force rotation.
    pub fn new(wal_dir: impl Into<PathBuf>, sst_dir: impl Into<PathBuf>) -> Self {
        Self {
            wal_dir: wal_dir.into(),
            sst_dir: sst_dir.into(),
            memtable_limit: 4 * 1024 * 1024,
            compaction_interval: Duration::from_secs(60),
            compaction_min_tables: 4,
        }
    }
}

/// Snapshot of engine statistics returned by [`Engine::stats`].
#[derive(Debug)]
pub struct EngineStats {
    /// Whether a frozen memtable is currently pending flush.
    pub frozen_pending: bool,
    /// Number of SSTables on disk.
    pub sstable_count: usize,
    /// Completed memtable flushes.
    pub flushes: u64,
    /// Completed compaction runs.
    pub compactions: u64,
    /// Writes rejected with a write stall.
    pub write_stalls: u64,
}

#[derive(Debug, Default)]
struct EngineCounters {
    flushes: AtomicU64,
    compactions: AtomicU64,
    write_stalls: AtomicU64,
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

enum FlushSignal {
    Flush,
    Shutdown,
}

struct EngineInner {
    /// Active memtable accepting writes.
    active: Memtable,

    /// At most one frozen memtable awaiting flush.
    frozen: Option<Memtable>,

    /// Next KV WAL segment sequence number.
    next_wal_seq: u64,

    /// Next SSTable sequence number (global freshness counter).
    next_sst_seq: u64,
}

/// The LSM storage engine handle.
///
/// Cheap to clone; all clones share the same state, workers, and counters.
pub struct Engine {
    inner: Arc<RwLock<EngineInner>>,
    config: Arc<EngineConfig>,
    counters: Arc<EngineCounters>,
    flush_tx: Sender<FlushSignal>,
    compact_shutdown_tx: Sender<()>,
    compact_lock: Arc<Mutex<()>>,
    workers: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
}

impl Clone for Engine {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            config: Arc::clone(&self.config),
            counters: Arc::clone(&self.counters),
            flush_tx: self.flush_tx.clone(),
            compact_shutdown_tx: self.compact_shutdown_tx.clone(),
            compact_lock: Arc::clone(&self.compact_lock),
            workers: Arc::clone(&self.workers),
        }
    }
}

impl Engine {
    /// Opens (or creates) an engine over the given directories and starts
    /// the background workers.
    ///
    /// Recovery: leftover WAL segments below the newest are the remains of
    /// frozen memtables whose flush never finished — each is replayed and
    /// flushed to a level-0 table immediately, then deleted. The newest
    /// segment (or a fresh one) becomes the active memtable. Orphaned
    /// `.tmp` tables from interrupted builds are removed.
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        fs::create_dir_all(&config.wal_dir)?;
        fs::create_dir_all(&config.sst_dir)?;

        // Drop half-built tables from a previous crash.
        for entry in fs::read_dir(&config.sst_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                warn!(path = %path.display(), "removing orphaned partial SSTable");
                fs::remove_file(&path)?;
            }
        }

        let mut next_sst_seq = 1 + list_tables(&config.sst_dir)?
            .iter()
            .map(|t| t.seq)
            .max()
            .unwrap_or(0);

        // Collect existing WAL segments, oldest first.
        let mut segments = Vec::new();
        for entry in fs::read_dir(&config.wal_dir)? {
            let path = entry?.path();
            if let Some(name) = path.file_name().and_then(|n| n.to_str())
                && let Some(seq) = wal::parse_segment_seq(name)
            {
                segments.push(seq);
            }
        }
        segments.sort_unstable();

        // Every segment but the newest belonged to a memtable that was
        // frozen when the process died; finish its flush now.
        let (older, newest) = match segments.split_last() {
            Some((newest, older)) => (older.to_vec(), Some(*newest)),
            None => (Vec::new(), None),
        };
        for seq in older {
            let memtable = Memtable::open(&config.wal_dir, seq)?;
            if !memtable.is_empty() {
                let records = memtable.sorted_records()?;
                let path = config.sst_dir.join(table_file_name(0, next_sst_seq));
                SstWriter::new(&path).build(&records)?;
                next_sst_seq += 1;
                info!(wal_seq = seq, table = %path.display(), "recovered frozen memtable");
            }
            fs::remove_file(memtable.wal_path())?;
        }

        let active_seq = newest.unwrap_or(1);
        let active = Memtable::open(&config.wal_dir, active_seq)?;

        let inner = EngineInner {
            active,
            frozen: None,
            next_wal_seq: active_seq + 1,
            next_sst_seq,
        };

        let (flush_tx, flush_rx) = unbounded();
        let (compact_shutdown_tx, compact_shutdown_rx) = bounded(1);

        let engine = Self {
            inner: Arc::new(RwLock::new(inner)),
            config: Arc::new(config),
            counters: Arc::new(EngineCounters::default()),
            flush_tx,
            compact_shutdown_tx,
            compact_lock: Arc::new(Mutex::new(())),
            workers: Arc::new(Mutex::new(Vec::new())),
        };

        engine.spawn_workers(flush_rx, compact_shutdown_rx)?;
        info!(
            wal_dir = %engine.config.wal_dir.display(),
            sst_dir = %engine.config.sst_dir.display(),
            "engine opened"
        );
        Ok(engine)
    }

    /// Inserts or updates a key.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        self.write(key, value, false)
    }

    /// Deletes a key by writing a tombstone.
    pub fn delete(&self, key: &[u8]) -> Result<(), EngineError> {
        self.write(key, b"", true)
    }

    fn write(&self, key: &[u8], value: &[u8], tombstone: bool) -> Result<(), EngineError> {
        let mut inner = self.write_lock()?;

        let record_len = memtable::record_len(key.len(), value.len());
        if inner.active.approximate_size() + record_len > self.config.memtable_limit
            && !inner.active.is_empty()
        {
            if inner.frozen.is_some() {
                self.counters.write_stalls.fetch_add(1, Ordering::Relaxed);
                return Err(EngineError::WriteStall);
            }

            let seq = inner.next_wal_seq;
            inner.next_wal_seq += 1;
            let fresh = Memtable::open(&self.config.wal_dir, seq)?;
            let full = std::mem::replace(&mut inner.active, fresh);
            debug!(
                wal_seq = full.wal_seq(),
                size = full.approximate_size(),
                "memtable rotated"
            );
            inner.frozen = Some(full);

            let _ = self.flush_tx.send(FlushSignal::Flush);
        }

        if tombstone {
            inner.active.delete(key)?;
        } else {
            inner.active.put(key, value)?;
        }
        Ok(())
    }

    /// Point lookup across all tiers.
    ///
    /// `Ok(None)` covers both "never written" and "tombstoned". The read
    /// lock is dropped before any disk I/O so readers never block writers
    /// on the slow path.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        {
            let inner = self.read_lock()?;
            match inner.active.get(key) {
                MemtableGet::Put(value) => return Ok(Some(value)),
                MemtableGet::Tombstone => return Ok(None),
                MemtableGet::NotFound => {}
            }
            if let Some(frozen) = &inner.frozen {
                match frozen.get(key) {
                    MemtableGet::Put(value) => return Ok(Some(value)),
                    MemtableGet::Tombstone => return Ok(None),
                    MemtableGet::NotFound => {}
                }
            }
        }

        for table in list_tables(&self.config.sst_dir)? {
            let reader = match SstReader::open(&table.path) {
                Ok(reader) => reader,
                // Compaction may unlink a table between listing and open.
                Err(SstableError::Io(e)) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match reader.get(key)? {
                SstGet::Put(value) => return Ok(Some(value)),
                SstGet::Tombstone => return Ok(None),
                SstGet::NotFound => {}
            }
        }
        Ok(None)
    }

    /// Runs one compaction if enough tables have accumulated.
    ///
    /// Serialized by the compaction lock; merges every live table into one
    /// output a level up, reusing the newest input's sequence number, then
    /// unlinks the inputs.
    pub fn compact(&self) -> Result<bool, EngineError> {
        let _guard = self
            .compact_lock
            .lock()
            .map_err(|_| EngineError::Internal("compaction lock poisoned".into()))?;

        let tables = list_tables(&self.config.sst_dir)?;
        if tables.len() < self.config.compaction_min_tables.max(2) {
            return Ok(false);
        }

        let out_seq = tables[0].seq;
        let out_level = 1 + tables.iter().map(|t| t.level).max().unwrap_or(0);
        let output_path = self.config.sst_dir.join(table_file_name(out_level, out_seq));

        let inputs: Vec<PathBuf> = tables.iter().map(|t| t.path.clone()).collect();
        compact_tables(&inputs, &output_path)?;

        // The output (if any) is durable; the inputs can go.
        for path in &inputs {
            if let Err(e) = fs::remove_file(path)
                && e.kind() != io::ErrorKind::NotFound
            {
                return Err(e.into());
            }
        }

        self.counters.compactions.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Statistics snapshot for observability.
    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let frozen_pending = self.read_lock()?.frozen.is_some();
        Ok(EngineStats {
            frozen_pending,
            sstable_count: list_tables(&self.config.sst_dir)?.len(),
            flushes: self.counters.flushes.load(Ordering::Relaxed),
            compactions: self.counters.compactions.load(Ordering::Relaxed),
            write_stalls: self.counters.write_stalls.load(Ordering::Relaxed),
        })
    }

    /// Stops both workers, then flushes any remaining frozen memtable so
    /// no WAL segment outlives its data unnecessarily.
    pub fn close(&self) -> Result<(), EngineError> {
        let _ = self.flush_tx.send(FlushSignal::Shutdown);
        let _ = self.compact_shutdown_tx.send(());

        let handles: Vec<_> = {
            let mut workers = self
                .workers
                .lock()
                .map_err(|_| EngineError::Internal("worker registry poisoned".into()))?;
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }

        self.flush_once()?;
        info!("engine closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Flush
    // --------------------------------------------------------------------------------------------

    /// Flushes the frozen memtable, if any, into a new level-0 table.
    ///
    /// Returns `true` if a table was written.
    fn flush_once(&self) -> Result<bool, EngineError> {
        // Snapshot the frozen memtable and claim a table sequence number.
        let (records, wal_path, sst_seq) = {
            let mut inner = self.write_lock()?;
            let Some(frozen) = &inner.frozen else {
                return Ok(false);
            };
            let records = frozen.sorted_records()?;
            let wal_path = frozen.wal_path();
            let seq = inner.next_sst_seq;
            inner.next_sst_seq += 1;
            (records, wal_path, seq)
        };

        if !records.is_empty() {
            let path = self.config.sst_dir.join(table_file_name(0, sst_seq));
            SstWriter::new(&path).build(&records)?;
            debug!(table = %path.display(), records = records.len(), "frozen memtable flushed");
        }

        // The table is durable: release the frozen slot, then drop its WAL.
        {
            let mut inner = self.write_lock()?;
            inner.frozen = None;
        }
        fs::remove_file(&wal_path)?;

        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn spawn_workers(
        &self,
        flush_rx: Receiver<FlushSignal>,
        compact_shutdown_rx: Receiver<()>,
    ) -> Result<(), EngineError> {
        let mut workers = self
            .workers
            .lock()
            .map_err(|_| EngineError::Internal("worker registry poisoned".into()))?;

        let engine = self.clone();
        workers.push(
            thread::Builder::new()
                .name("lsm-flush".into())
                .spawn(move || run_flush_worker(&engine, &flush_rx))?,
        );

        let engine = self.clone();
        let interval = self.config.compaction_interval;
        workers.push(
            thread::Builder::new()
                .name("lsm-compact".into())
                .spawn(move || run_compaction_worker(&engine, interval, &compact_shutdown_rx))?,
        );
        Ok(())
    }

    fn read_lock(&self) -> Result<std::sync::RwLockReadGuard<'_, EngineInner>, EngineError> {
        self.inner
            .read()
            .map_err(|_| EngineError::Internal("engine lock poisoned".into()))
    }

    fn write_lock(&self) -> Result<std::sync::RwLockWriteGuard<'_, EngineInner>, EngineError> {
        self.inner
            .write()
            .map_err(|_| EngineError::Internal("engine lock poisoned".into()))
    }
}

// ------------------------------------------------------------------------------------------------
// Workers
// ------------------------------------------------------------------------------------------------

fn run_flush_worker(engine: &Engine, rx: &Receiver<FlushSignal>) {
    while let Ok(FlushSignal::Flush) = rx.recv() {
        let mut attempts = 0u32;
        loop {
            match engine.flush_once() {
                Ok(_) => break,
                Err(e) => {
                    attempts += 1;
                    error!(error = %e, attempts, "memtable flush failed");
                    if attempts >= FLUSH_MAX_RETRIES {
                        // Dropping the frozen memtable would lose
                        // acknowledged writes.
                        error!("flush failed persistently, aborting process");
                        std::process::abort();
                    }
                    thread::sleep(FLUSH_RETRY_BACKOFF);
                }
            }
        }
    }
    debug!("flush worker stopped");
}

fn run_compaction_worker(engine: &Engine, interval: Duration, shutdown_rx: &Receiver<()>) {
    let ticker = tick(interval);
    loop {
        crossbeam::select! {
            recv(ticker) -> _ => {
                if let Err(e) = engine.compact() {
                    warn!(error = %e, "background compaction failed");
                }
            }
            recv(shutdown_rx) -> _ => break,
        }
    }
    debug!("compaction worker stopped");
}

// ------------------------------------------------------------------------------------------------
// Table listing
// ------------------------------------------------------------------------------------------------

struct TableRef {
    path: PathBuf,
    level: u32,
    seq: u64,
}

/// Lists the tables in `dir`, freshest first: sequence descending, ties
/// broken toward the lower level (a compaction output never outranks the
/// level-0 input it shares a sequence number with).
fn list_tables(dir: &Path) -> Result<Vec<TableRef>, EngineError> {
    let mut tables = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(name) = path.file_name().and_then(|n| n.to_str())
            && let Some((level, seq)) = parse_table_name(name)
        {
            tables.push(TableRef { path, level, seq });
        }
    }
    tables.sort_by(|a, b| b.seq.cmp(&a.seq).then(a.level.cmp(&b.level)));
    Ok(tables)
}
