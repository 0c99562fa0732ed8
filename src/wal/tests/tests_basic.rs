use super::helpers::{fill_segment, init_tracing, reopen};
use crate::wal::{KvWal, RECORD_HEADER_SIZE, WalCommand, WalError, parse_segment_seq};
use tempfile::TempDir;

#[test]
fn test_append_and_recover_roundtrip() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let (mut wal, recovered) = KvWal::open(tmp.path(), 1).unwrap();
    assert!(recovered.is_empty());

    wal.append(b"alpha", b"1", WalCommand::Put).unwrap();
    wal.append(b"beta", b"2", WalCommand::Put).unwrap();
    wal.append(b"alpha", b"", WalCommand::Delete).unwrap();
    drop(wal);

    let (_, entries) = reopen(tmp.path(), 1);
    assert_eq!(entries.len(), 3);

    assert_eq!(entries[0].key, b"alpha");
    assert_eq!(entries[0].value, b"1");
    assert_eq!(entries[0].cmd, WalCommand::Put);
    assert_eq!(entries[0].lsn, 0);

    assert_eq!(entries[1].key, b"beta");
    assert_eq!(
        entries[1].lsn,
        (RECORD_HEADER_SIZE + b"alpha".len() + b"1".len()) as u64
    );

    assert_eq!(entries[2].cmd, WalCommand::Delete);
    assert!(entries[2].value.is_empty());
}

#[test]
fn test_recovery_is_idempotent() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    drop(fill_segment(tmp.path(), 3, 10));

    let (_, first) = reopen(tmp.path(), 3);
    let (_, second) = reopen(tmp.path(), 3);
    assert_eq!(first, second);
    assert_eq!(first.len(), 10);
}

#[test]
fn test_lsn_continues_across_reopen() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    drop(fill_segment(tmp.path(), 0, 2));

    let (mut wal, entries) = reopen(tmp.path(), 0);
    assert_eq!(entries.len(), 2);
    wal.append(b"late", b"entry", WalCommand::Put).unwrap();
    drop(wal);

    let (_, entries) = reopen(tmp.path(), 0);
    assert_eq!(entries.len(), 3);
    // Each LSN is the byte offset of its record.
    let mut expected = 0;
    for entry in &entries {
        assert_eq!(entry.lsn, expected);
        expected += (RECORD_HEADER_SIZE + entry.key.len() + entry.value.len()) as u64;
    }
}

#[test]
fn test_empty_segment_recovers_empty() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    drop(KvWal::open(tmp.path(), 7).unwrap());
    let (_, entries) = reopen(tmp.path(), 7);
    assert!(entries.is_empty());
}

#[test]
fn test_sequence_mismatch_rejected() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    drop(fill_segment(tmp.path(), 4, 1));

    // Renaming the segment to a different seq must fail header validation.
    std::fs::rename(
        tmp.path().join("wal_000004.log"),
        tmp.path().join("wal_000009.log"),
    )
    .unwrap();

    let err = KvWal::open(tmp.path(), 9).unwrap_err();
    assert!(matches!(err, WalError::InvalidHeader(_)));
}

#[test]
fn test_segment_name_parsing() {
    assert_eq!(parse_segment_seq("wal_000012.log"), Some(12));
    assert_eq!(parse_segment_seq("wal_7.log"), Some(7));
    assert_eq!(parse_segment_seq("level0_000012.sst"), None);
    assert_eq!(parse_segment_seq("wal_x.log"), None);
}
