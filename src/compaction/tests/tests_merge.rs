use crate::compaction::{MergeIter, compact_tables};
use crate::sstable::{Record, SstGet, SstReader, SstWriter, table_file_name};
use std::path::PathBuf;
use tempfile::TempDir;

fn put(key: &str, value: &str) -> Record {
    Record {
        key: key.as_bytes().to_vec(),
        value: value.as_bytes().to_vec(),
        tombstone: false,
    }
}

fn del(key: &str) -> Record {
    Record {
        key: key.as_bytes().to_vec(),
        value: Vec::new(),
        tombstone: true,
    }
}

fn build(dir: &std::path::Path, level: u32, seq: u64, records: &[Record]) -> PathBuf {
    let path = dir.join(table_file_name(level, seq));
    SstWriter::new(&path).build(records).unwrap();
    path
}

#[test]
fn test_merge_prefers_freshest_record() {
    let tmp = TempDir::new().unwrap();

    let old = build(tmp.path(), 0, 1, &[put("a", "old"), put("b", "old")]);
    let new = build(tmp.path(), 0, 2, &[put("a", "new"), put("c", "new")]);

    // Newest first.
    let readers = vec![SstReader::open(&new).unwrap(), SstReader::open(&old).unwrap()];
    let merged: Vec<Record> = MergeIter::new(&readers).collect::<Result<_, _>>().unwrap();

    assert_eq!(
        merged,
        vec![put("a", "new"), put("b", "old"), put("c", "new")]
    );
}

#[test]
fn test_compaction_drops_spent_tombstones() {
    let tmp = TempDir::new().unwrap();

    let older = build(tmp.path(), 0, 1, &[put("k", "v1"), put("keep", "x")]);
    let newer = build(tmp.path(), 0, 2, &[del("k")]);

    let output = tmp.path().join(table_file_name(1, 3));
    let outcome =
        compact_tables(&[newer.clone(), older.clone()], &output).unwrap();

    assert_eq!(outcome.output.as_deref(), Some(output.as_path()));
    assert_eq!(outcome.records, 1);
    assert_eq!(outcome.dropped_tombstones, 1);

    // The merged table holds no trace of the deleted key.
    let reader = SstReader::open(&output).unwrap();
    assert_eq!(reader.get(b"k").unwrap(), SstGet::NotFound);
    assert_eq!(reader.get(b"keep").unwrap(), SstGet::Put(b"x".to_vec()));
}

#[test]
fn test_compaction_of_only_tombstones_writes_nothing() {
    let tmp = TempDir::new().unwrap();

    let a = build(tmp.path(), 0, 1, &[put("x", "1")]);
    let b = build(tmp.path(), 0, 2, &[del("x")]);

    let output = tmp.path().join(table_file_name(1, 3));
    let outcome = compact_tables(&[b, a], &output).unwrap();

    assert!(outcome.output.is_none());
    assert!(!output.exists());
    assert_eq!(outcome.dropped_tombstones, 1);
}

#[test]
fn test_merge_across_three_generations() {
    let tmp = TempDir::new().unwrap();

    let g1 = build(tmp.path(), 0, 1, &[put("a", "1"), put("b", "1"), put("c", "1")]);
    let g2 = build(tmp.path(), 0, 2, &[put("b", "2"), del("c")]);
    let g3 = build(tmp.path(), 0, 3, &[put("c", "3"), put("d", "3")]);

    let output = tmp.path().join(table_file_name(1, 4));
    let outcome = compact_tables(&[g3, g2, g1], &output).unwrap();
    assert_eq!(outcome.records, 4);

    let reader = SstReader::open(&output).unwrap();
    assert_eq!(reader.get(b"a").unwrap(), SstGet::Put(b"1".to_vec()));
    assert_eq!(reader.get(b"b").unwrap(), SstGet::Put(b"2".to_vec()));
    // The g3 put of "c" outranks the g2 tombstone.
    assert_eq!(reader.get(b"c").unwrap(), SstGet::Put(b"3".to_vec()));
    assert_eq!(reader.get(b"d").unwrap(), SstGet::Put(b"3".to_vec()));
}
