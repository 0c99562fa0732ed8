use crate::memtable::{Memtable, MemtableGet};
use tempfile::TempDir;

/// Reopening the same WAL segment reconstructs the exact memtable state.
#[test]
fn test_reopen_restores_state() {
    let tmp = TempDir::new().unwrap();

    {
        let mut mem = Memtable::open(tmp.path(), 2).unwrap();
        mem.put(b"a", b"1").unwrap();
        mem.put(b"b", b"2").unwrap();
        mem.delete(b"a").unwrap();
        mem.put(b"c", b"3").unwrap();
    }

    let mem = Memtable::open(tmp.path(), 2).unwrap();
    assert_eq!(mem.get(b"a"), MemtableGet::Tombstone);
    assert_eq!(mem.get(b"b"), MemtableGet::Put(b"2".to_vec()));
    assert_eq!(mem.get(b"c"), MemtableGet::Put(b"3".to_vec()));
    assert_eq!(mem.len(), 3);
}

/// Replay must not re-append to the WAL: repeated reopens keep the file
/// byte-identical.
#[test]
fn test_replay_does_not_grow_wal() {
    let tmp = TempDir::new().unwrap();

    {
        let mut mem = Memtable::open(tmp.path(), 0).unwrap();
        for i in 0..20 {
            mem.put(format!("key{i}").as_bytes(), b"value").unwrap();
        }
    }

    let path = tmp.path().join("wal_000000.log");
    let len_before = std::fs::metadata(&path).unwrap().len();

    for _ in 0..3 {
        let mem = Memtable::open(tmp.path(), 0).unwrap();
        assert_eq!(mem.len(), 20);
    }

    assert_eq!(std::fs::metadata(&path).unwrap().len(), len_before);
}

/// Writes after recovery continue where the log left off.
#[test]
fn test_write_after_recovery() {
    let tmp = TempDir::new().unwrap();

    {
        let mut mem = Memtable::open(tmp.path(), 5).unwrap();
        mem.put(b"old", b"1").unwrap();
    }

    {
        let mut mem = Memtable::open(tmp.path(), 5).unwrap();
        mem.put(b"new", b"2").unwrap();
    }

    let mem = Memtable::open(tmp.path(), 5).unwrap();
    assert_eq!(mem.get(b"old"), MemtableGet::Put(b"1".to_vec()));
    assert_eq!(mem.get(b"new"), MemtableGet::Put(b"2".to_vec()));
}
