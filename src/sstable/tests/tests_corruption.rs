use crate::sstable::{Record, SstReader, SstWriter, SstableError, table_file_name};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use tempfile::TempDir;

fn build_table(path: &std::path::Path, n: usize) {
    let records: Vec<Record> = (0..n)
        .map(|i| Record {
            key: format!("key{i:04}").into_bytes(),
            value: format!("value{i}").into_bytes(),
            tombstone: false,
        })
        .collect();
    SstWriter::new(path).build(&records).unwrap();
}

fn corrupt_at(path: &std::path::Path, pos: SeekFrom, bytes: &[u8]) {
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(pos).unwrap();
    file.write_all(bytes).unwrap();
    file.sync_all().unwrap();
}

#[test]
fn test_header_magic_mismatch_rejected() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join(table_file_name(0, 1));
    build_table(&path, 10);

    corrupt_at(&path, SeekFrom::Start(0), b"XXXX");

    let err = SstReader::open(&path).unwrap_err();
    // Magic damage also breaks the header checksum, either way it must not open.
    assert!(matches!(
        err,
        SstableError::ChecksumMismatch(_) | SstableError::Corrupt(_)
    ));
}

#[test]
fn test_footer_corruption_rejected() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join(table_file_name(0, 1));
    build_table(&path, 10);

    corrupt_at(&path, SeekFrom::End(-10), &[0xFF, 0xFF]);

    assert!(SstReader::open(&path).is_err());
}

#[test]
fn test_index_block_corruption_rejected() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join(table_file_name(0, 1));
    build_table(&path, 64);

    // The index block sits right before the 24-byte footer; flip bytes
    // inside it.
    corrupt_at(&path, SeekFrom::End(-40), &[0xAA, 0xBB, 0xCC]);

    let err = SstReader::open(&path).unwrap_err();
    assert!(matches!(
        err,
        SstableError::ChecksumMismatch("index") | SstableError::Corrupt(_)
    ));
}

#[test]
fn test_truncated_file_rejected() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join(table_file_name(0, 1));
    build_table(&path, 10);

    let len = std::fs::metadata(&path).unwrap().len();
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len / 2).unwrap();
    file.sync_all().unwrap();

    assert!(SstReader::open(&path).is_err());
}
