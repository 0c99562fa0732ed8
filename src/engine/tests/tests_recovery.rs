use super::helpers::{force_flush, open_engine, test_config};
use crate::engine::Engine;
use crate::memtable::Memtable;
use tempfile::TempDir;

/// Dropping the engine without closing it models a crash: the active
/// memtable's WAL brings everything back.
#[test]
fn test_crash_recovery_from_active_wal() {
    let tmp = TempDir::new().unwrap();
    {
        let engine = open_engine(tmp.path());
        engine.put(b"a", b"1").unwrap();
        engine.put(b"b", b"2").unwrap();
        engine.delete(b"a").unwrap();
        // No close: simulate a crash.
    }

    let engine = Engine::open(test_config(tmp.path())).unwrap();
    assert_eq!(engine.get(b"a").unwrap(), None);
    assert_eq!(engine.get(b"b").unwrap(), Some(b"2".to_vec()));
    engine.close().unwrap();
}

/// A frozen memtable whose flush never ran is recovered on open: its WAL
/// segment is replayed, flushed to a table, and deleted.
#[test]
fn test_recovery_flushes_orphaned_frozen_segment() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path());

    // Park a populated memtable in the frozen slot without waking the
    // flush worker, then "crash".
    {
        let mut inner = engine.inner.write().unwrap();
        let seq = inner.next_wal_seq;
        inner.next_wal_seq += 1;
        let mut parked = Memtable::open(&engine.config.wal_dir, seq).unwrap();
        parked.put(b"orphan", b"survives").unwrap();
        inner.frozen = Some(parked);
    }
    engine.put(b"active-key", b"also-survives").unwrap();
    drop(engine);

    let engine = Engine::open(test_config(tmp.path())).unwrap();
    assert_eq!(engine.get(b"orphan").unwrap(), Some(b"survives".to_vec()));
    assert_eq!(
        engine.get(b"active-key").unwrap(),
        Some(b"also-survives".to_vec())
    );

    // Exactly one WAL segment (the active one) should remain.
    let segments = std::fs::read_dir(&engine.config.wal_dir)
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .path()
                .extension()
                .and_then(|x| x.to_str())
                == Some("log")
        })
        .count();
    assert_eq!(segments, 1);
    engine.close().unwrap();
}

/// Flushed data does not depend on any WAL: tables alone carry it across
/// restarts.
#[test]
fn test_recovery_reads_existing_tables() {
    let tmp = TempDir::new().unwrap();
    {
        let engine = open_engine(tmp.path());
        engine.put(b"cold", b"data").unwrap();
        force_flush(&engine);
        engine.close().unwrap();
    }

    let engine = Engine::open(test_config(tmp.path())).unwrap();
    assert_eq!(engine.get(b"cold").unwrap(), Some(b"data".to_vec()));
    engine.close().unwrap();
}

/// Sequence counters resume above everything found on disk.
#[test]
fn test_sequence_counters_resume_after_reopen() {
    let tmp = TempDir::new().unwrap();
    {
        let engine = open_engine(tmp.path());
        engine.put(b"k1", b"v").unwrap();
        force_flush(&engine);
        engine.put(b"k2", b"v").unwrap();
        force_flush(&engine);
        engine.close().unwrap();
    }

    let engine = Engine::open(test_config(tmp.path())).unwrap();
    engine.put(b"k3", b"v").unwrap();
    super::helpers::force_flush(&engine);

    // Three distinct tables: no seq collision overwrote an older one.
    assert_eq!(engine.stats().unwrap().sstable_count, 3);
    for key in [b"k1".as_slice(), b"k2", b"k3"] {
        assert_eq!(engine.get(key).unwrap(), Some(b"v".to_vec()));
    }
    engine.close().unwrap();
}
