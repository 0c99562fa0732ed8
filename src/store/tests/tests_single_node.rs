use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use crate::raft::transport::{
    AppendEntriesReply, AppendEntriesRequest, RaftTransport, VoteReply, VoteRequest,
};
use crate::raft::NodeId;
use crate::store::{Store, StoreConfig, StoreError};

struct NoopTransport;

impl RaftTransport for NoopTransport {
    fn append_entries(&self, _: NodeId, _: &AppendEntriesRequest) -> Option<AppendEntriesReply> {
        None
    }

    fn request_vote(&self, _: NodeId, _: &VoteRequest) -> Option<VoteReply> {
        None
    }
}

fn single_node_config(root: &std::path::Path) -> StoreConfig {
    let mut config = StoreConfig::new(0, Vec::new(), root);
    config.election_timeout_min = Duration::from_millis(50);
    config.election_timeout_max = Duration::from_millis(100);
    config.heartbeat_interval = Duration::from_millis(20);
    config.propose_timeout = Duration::from_millis(500);
    config
}

fn wait_for_leader(store: &Store) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if store.is_leader() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("single node never became leader");
}

/// A cluster of one: propose, commit, apply, read back.
#[test]
fn test_single_node_put_get_delete() {
    let tmp = TempDir::new().unwrap();
    let store = Store::open(single_node_config(tmp.path()), Arc::new(NoopTransport)).unwrap();
    wait_for_leader(&store);

    store.put("k", "v1").unwrap();
    assert_eq!(store.get("k").unwrap(), Some("v1".to_string()));

    store.put("k", "v2").unwrap();
    assert_eq!(store.get("k").unwrap(), Some("v2".to_string()));

    store.delete("k").unwrap();
    assert_eq!(store.get("k").unwrap(), None);

    assert_eq!(store.leader(), Some(0));
    store.close().unwrap();
}

/// Committed commands survive a full restart: the consensus WAL re-feeds
/// the applier, and re-applying is idempotent.
#[test]
fn test_single_node_restart_recovers_data() {
    let tmp = TempDir::new().unwrap();
    {
        let store =
            Store::open(single_node_config(tmp.path()), Arc::new(NoopTransport)).unwrap();
        wait_for_leader(&store);
        store.put("a", "1").unwrap();
        store.put("b", "2").unwrap();
        store.delete("a").unwrap();
        store.close().unwrap();
    }

    let store = Store::open(single_node_config(tmp.path()), Arc::new(NoopTransport)).unwrap();
    wait_for_leader(&store);

    // Give the re-fed applier a moment to chew through the log.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if store.get("b").unwrap() == Some("2".to_string()) && store.get("a").unwrap().is_none() {
            break;
        }
        assert!(Instant::now() < deadline, "recovery never converged");
        std::thread::sleep(Duration::from_millis(10));
    }
    store.close().unwrap();
}

/// A node that cannot win an election refuses proposals as non-leader.
#[test]
fn test_follower_rejects_proposals() {
    let tmp = TempDir::new().unwrap();
    // Two phantom peers that never answer: no majority, never leader.
    let mut config = StoreConfig::new(0, vec![1, 2], tmp.path());
    config.propose_timeout = Duration::from_millis(200);
    let store = Store::open(config, Arc::new(NoopTransport)).unwrap();

    let err = store.put("k", "v").unwrap_err();
    assert!(matches!(err, StoreError::NotLeader));
    assert!(store.get("k").unwrap().is_none());
    store.close().unwrap();
}

/// With the applier stopped, a proposal commits in the log but nobody
/// signals the waiter: the caller gets a timeout, not a hang.
#[test]
fn test_proposal_timeout_without_applier() {
    let tmp = TempDir::new().unwrap();
    let store = Store::open(single_node_config(tmp.path()), Arc::new(NoopTransport)).unwrap();
    wait_for_leader(&store);
    store.put("warm", "up").unwrap();

    // Tear down the workers but keep proposing.
    store.close().unwrap();
    let err = store.put("late", "write").unwrap_err();
    assert!(matches!(err, StoreError::Timeout));
}
