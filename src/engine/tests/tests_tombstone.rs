use super::helpers::{force_flush, open_engine};
use crate::sstable::{SstGet, SstReader};
use tempfile::TempDir;

#[test]
fn test_delete_in_memtable_masks_sstable_value() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path());

    engine.put(b"k", b"v1").unwrap();
    force_flush(&engine);

    engine.delete(b"k").unwrap();
    // The tombstone in the active memtable shadows the on-disk value.
    assert_eq!(engine.get(b"k").unwrap(), None);
    engine.close().unwrap();
}

#[test]
fn test_tombstone_in_newer_sstable_masks_older() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path());

    engine.put(b"k", b"v1").unwrap();
    force_flush(&engine);
    engine.delete(b"k").unwrap();
    force_flush(&engine);

    assert_eq!(engine.stats().unwrap().sstable_count, 2);
    assert_eq!(engine.get(b"k").unwrap(), None);
    engine.close().unwrap();
}

/// Put, flush, delete, flush, compact: the merged table must contain no
/// trace of the key, and the read still reports not-found.
#[test]
fn test_compaction_drops_tombstoned_key_entirely() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path());

    engine.put(b"k", b"v1").unwrap();
    engine.put(b"keep", b"stays").unwrap();
    force_flush(&engine);
    engine.delete(b"k").unwrap();
    force_flush(&engine);

    assert!(engine.compact().unwrap());
    assert_eq!(engine.stats().unwrap().sstable_count, 1);

    assert_eq!(engine.get(b"k").unwrap(), None);
    assert_eq!(engine.get(b"keep").unwrap(), Some(b"stays".to_vec()));

    // Inspect the merged table directly: no record for the deleted key.
    let dir = engine.config.sst_dir.clone();
    engine.close().unwrap();
    let table = std::fs::read_dir(&dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.extension().and_then(|e| e.to_str()) == Some("sst"))
        .expect("compacted table must exist");
    let reader = SstReader::open(&table).unwrap();
    assert_eq!(reader.get(b"k").unwrap(), SstGet::NotFound);
    let records: Vec<_> = reader.iter().collect::<Result<_, _>>().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key, b"keep");
}

/// Deleting every key then compacting leaves an empty table directory.
#[test]
fn test_compaction_of_fully_deleted_data_leaves_nothing() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path());

    engine.put(b"a", b"1").unwrap();
    engine.put(b"b", b"2").unwrap();
    force_flush(&engine);
    engine.delete(b"a").unwrap();
    engine.delete(b"b").unwrap();
    force_flush(&engine);

    assert!(engine.compact().unwrap());
    assert_eq!(engine.stats().unwrap().sstable_count, 0);
    assert_eq!(engine.get(b"a").unwrap(), None);
    engine.close().unwrap();
}

/// Compaction below the table threshold is a no-op.
#[test]
fn test_compaction_skipped_below_threshold() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path());

    engine.put(b"k", b"v").unwrap();
    force_flush(&engine);
    assert!(!engine.compact().unwrap());
    assert_eq!(engine.stats().unwrap().sstable_count, 1);
    engine.close().unwrap();
}
