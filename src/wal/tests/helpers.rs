use tracing_subscriber::EnvFilter;

use crate::wal::{KvWal, WalCommand, WalEntry};
use std::path::Path;

/// Initialize a tracing subscriber controlled by `RUST_LOG`.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Opens segment `seq` under `dir` and appends `n` put records
/// `k<i> -> v<i>`.
pub fn fill_segment(dir: &Path, seq: u64, n: usize) -> KvWal {
    let (mut wal, recovered) = KvWal::open(dir, seq).unwrap();
    assert!(recovered.is_empty());
    for i in 0..n {
        wal.append(
            format!("k{i}").as_bytes(),
            format!("v{i}").as_bytes(),
            WalCommand::Put,
        )
        .unwrap();
    }
    wal
}

/// Reopens segment `seq` and returns the recovered records.
pub fn reopen(dir: &Path, seq: u64) -> (KvWal, Vec<WalEntry>) {
    KvWal::open(dir, seq).unwrap()
}
