use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{Receiver, unbounded};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

use crate::raft::transport::{
    AppendEntriesReply, AppendEntriesRequest, RaftTransport, VoteReply, VoteRequest,
};
use crate::raft::wal::LogEntry;
use crate::raft::{ApplyMsg, NodeId, RaftConfig, RaftNode};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A transport into the void: every call times out.
pub struct NoopTransport;

impl RaftTransport for NoopTransport {
    fn append_entries(&self, _: NodeId, _: &AppendEntriesRequest) -> Option<AppendEntriesReply> {
        None
    }

    fn request_vote(&self, _: NodeId, _: &VoteRequest) -> Option<VoteReply> {
        None
    }
}

/// A node whose tickers are parked (hour-long timeouts), so tests drive
/// its handlers directly and observe the apply channel.
pub struct PassiveNode {
    pub node: Arc<RaftNode>,
    pub apply_rx: Receiver<ApplyMsg>,
    _tmp: TempDir,
}

impl Drop for PassiveNode {
    fn drop(&mut self) {
        self.node.shutdown();
    }
}

pub fn passive_node(id: NodeId, peers: Vec<NodeId>) -> PassiveNode {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let config = RaftConfig {
        id,
        peers,
        wal_path: tmp.path().join(format!("raft_{id}.log")),
        election_timeout_min: Duration::from_secs(3600),
        election_timeout_max: Duration::from_secs(7200),
        heartbeat_interval: Duration::from_secs(3600),
        batch_max: 100,
    };
    let (apply_tx, apply_rx) = unbounded();
    let node = RaftNode::start(config, Arc::new(NoopTransport), apply_tx).unwrap();
    PassiveNode {
        node,
        apply_rx,
        _tmp: tmp,
    }
}

pub fn entries(specs: &[(u64, u64)]) -> Vec<LogEntry> {
    specs
        .iter()
        .map(|&(index, term)| LogEntry {
            index,
            term,
            command: format!("cmd-{index}").into_bytes(),
        })
        .collect()
}

/// Heartbeat/replication request from a fake leader.
pub fn append_req(
    term: u64,
    prev_log_index: u64,
    prev_log_term: u64,
    batch: Vec<LogEntry>,
    leader_commit: u64,
) -> AppendEntriesRequest {
    AppendEntriesRequest {
        term,
        leader_id: 99,
        prev_log_index,
        prev_log_term,
        entries: batch,
        leader_commit,
    }
}
