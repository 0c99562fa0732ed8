use std::path::Path;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::engine::{Engine, EngineConfig};
use crate::memtable::Memtable;

/// Initialize a tracing subscriber controlled by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Engine config rooted at `dir` with a tiny memtable and background
/// compaction effectively disabled, so tests control every transition.
pub fn test_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        wal_dir: dir.join("wal"),
        sst_dir: dir.join("sst"),
        memtable_limit: 256,
        compaction_interval: Duration::from_secs(3600),
        compaction_min_tables: 2,
    }
}

pub fn open_engine(dir: &Path) -> Engine {
    init_tracing();
    Engine::open(test_config(dir)).unwrap()
}

/// Rotates the active memtable by hand and flushes it synchronously,
/// leaving the engine with a fresh active table and one more SSTable.
pub fn force_flush(engine: &Engine) {
    {
        let mut inner = engine.inner.write().unwrap();
        assert!(inner.frozen.is_none(), "previous flush still pending");
        if inner.active.is_empty() {
            return;
        }
        let seq = inner.next_wal_seq;
        inner.next_wal_seq += 1;
        let fresh = Memtable::open(&engine.config.wal_dir, seq).unwrap();
        let full = std::mem::replace(&mut inner.active, fresh);
        inner.frozen = Some(full);
    }
    engine.flush_once().unwrap();
}

/// Waits until the frozen slot drains, panicking after two seconds.
pub fn wait_for_flush(engine: &Engine) {
    for _ in 0..200 {
        if !engine.stats().unwrap().frozen_pending {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("frozen memtable was never flushed");
}
