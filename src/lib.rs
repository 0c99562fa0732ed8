//! # SisyphusDB
//!
//! A replicated, persistent key-value store: **Raft consensus** for
//! linearizable writes over an **LSM-tree** storage engine for durable,
//! write-optimized local state. Clients talk to any node; writes are
//! forwarded through the leader's log, reads are served locally with
//! tombstone semantics.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                          Store                             │
//! │                                                            │
//! │  put/delete ──► propose ──► RaftNode ──► peers (RPC)       │
//! │                   │            │                           │
//! │                   │       raft WAL (term/vote/commit/log)  │
//! │                   │            │                           │
//! │                   ▼        apply channel                   │
//! │               waiters ◄──── applier                        │
//! │                                │                           │
//! │                                ▼                           │
//! │  get ─────────────────────► Engine                         │
//! │          ┌──────────┐  ┌──────────┐  ┌──────────────┐      │
//! │          │  Active  │  │  Frozen  │  │   SSTables   │      │
//! │          │ memtable │  │ memtable │  │  (on disk)   │      │
//! │          │  + WAL   │  │  + WAL   │  │              │      │
//! │          └────┬─────┘  └────┬─────┘  └──────┬───────┘      │
//! │               │ rotate      │ flush         │ compact      │
//! │               └────────►    └───────►       │              │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`store`] | Replicated store — propose, wait, apply, local reads |
//! | [`raft`] | Consensus — elections, replication, commit, apply channel |
//! | [`engine`] | LSM engine — rotation, flush, compaction, read path |
//! | [`memtable`] | In-memory write buffer over an append-only arena |
//! | [`wal`] | Per-memtable KV write-ahead log |
//! | [`sstable`] | Immutable sorted tables with bloom filter and sparse index |
//! | [`compaction`] | K-way merge dropping spent tombstones |
//! | [`encoding`] | Crate-owned deterministic wire format |
//! | [`metrics`] | Atomic counters + Prometheus text rendering |
//!
//! ## Guarantees
//!
//! - **Durability** — every mutation hits a CRC-checked WAL and is fsynced
//!   before acknowledgement; consensus state (term, vote, commit, log) is
//!   persisted before any reply that depends on it.
//! - **Linearizable writes** — a write is acknowledged only after its log
//!   index commits on a majority and applies locally.
//! - **Local reads** — served from the reader's own LSM without a round
//!   trip through consensus; followers may briefly lag.
//! - **Crash recovery** — WAL segments, SSTables, and the consensus log
//!   reconstruct the exact acknowledged state; torn tails are tolerated
//!   and truncated.
//!
//! ## Quick start (single-node cluster)
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sisyphusdb::raft::TcpTransport;
//! use sisyphusdb::store::{Store, StoreConfig};
//!
//! let config = StoreConfig::new(0, Vec::new(), "/var/lib/sisyphus");
//! let transport = Arc::new(TcpTransport::new(Default::default()));
//! let store = Store::open(config, transport).unwrap();
//!
//! store.put("hello", "world").unwrap();
//! assert_eq!(store.get("hello").unwrap(), Some("world".to_string()));
//! store.delete("hello").unwrap();
//!
//! store.close().unwrap();
//! ```

#[cfg(feature = "api")]
pub mod api;
pub mod compaction;
pub mod encoding;
pub mod engine;
pub mod memtable;
pub mod metrics;
pub mod raft;
pub mod sstable;
pub mod store;
pub mod wal;
