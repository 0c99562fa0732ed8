//! # Replicated Store
//!
//! The glue between consensus and storage. A write is proposed to the
//! consensus module as an encoded [`Command`], a one-shot completion
//! channel is registered under the returned log index, and the caller
//! waits (bounded) for the applier to signal it. The applier — a single
//! thread — drains the apply channel in index order, decodes each command,
//! applies it to the local LSM engine (retrying write stalls with a short
//! backoff; the index is already committed, the apply is paused, never
//! lost), and wakes whichever waiter registered that index.
//!
//! Reads never touch consensus: they hit the local engine directly, so a
//! follower may serve a slightly stale value.
//!
//! Results for indexes with no registered waiter (commands proposed on
//! another node) are dropped. A waiter that times out removes its own
//! channel entry; a late signal to a removed entry is dropped silently.
//!
//! The store owns the applier thread and shuts it down explicitly in
//! [`Store::close`]; consensus itself only ever sees the apply channel,
//! never this type.

#[cfg(test)]
mod tests;

use std::{
    collections::HashMap,
    fs, io,
    path::PathBuf,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use crossbeam::channel::{Receiver, Sender, bounded, unbounded};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::engine::{Engine, EngineConfig, EngineError, EngineStats};
use crate::metrics::Metrics;
use crate::raft::{
    ApplyMsg, NodeId, RaftConfig, RaftError, RaftNode, RaftStatus, RaftTransport,
};

/// Backoff between applier retries while the engine reports a stall.
const STALL_RETRY_BACKOFF: Duration = Duration::from_millis(10);

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced to store callers.
#[derive(Debug, Error)]
pub enum StoreError {
    /// This node is not the leader; ask [`Store::leader`] and redirect.
    #[error("not leader")]
    NotLeader,

    /// The proposal was not applied within the wait deadline. The write
    /// may or may not have committed.
    #[error("timeout waiting for consensus")]
    Timeout,

    /// Storage engine failure.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Consensus failure other than leadership.
    #[error("raft error: {0}")]
    Raft(#[from] RaftError),

    /// Command serialization failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Replicated command
// ------------------------------------------------------------------------------------------------

const CMD_PUT: u8 = 1;
const CMD_DELETE: u8 = 2;

/// The replicated state-machine command. Consensus carries it as opaque
/// bytes; only the applier decodes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Set `key` to `value`.
    Put {
        /// Key to write.
        key: String,
        /// Value to store.
        value: String,
    },
    /// Remove `key` (a tombstone in the engine).
    Delete {
        /// Key to delete.
        key: String,
    },
}

impl Encode for Command {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            Command::Put { key, value } => {
                CMD_PUT.encode_to(buf)?;
                key.encode_to(buf)?;
                value.encode_to(buf)
            }
            Command::Delete { key } => {
                CMD_DELETE.encode_to(buf)?;
                key.encode_to(buf)
            }
        }
    }
}

impl Decode for Command {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut offset) = u8::decode_from(buf)?;
        match tag {
            CMD_PUT => {
                let (key, n) = String::decode_from(&buf[offset..])?;
                offset += n;
                let (value, n) = String::decode_from(&buf[offset..])?;
                offset += n;
                Ok((Command::Put { key, value }, offset))
            }
            CMD_DELETE => {
                let (key, n) = String::decode_from(&buf[offset..])?;
                offset += n;
                Ok((Command::Delete { key }, offset))
            }
            other => Err(EncodingError::InvalidTag {
                tag: u32::from(other),
                type_name: "Command",
            }),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Node-level configuration: identity, peers, and the storage root the
/// per-node directory layout hangs off.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// This node's id.
    pub node_id: NodeId,
    /// The other cluster members.
    pub peers: Vec<NodeId>,
    /// Root of the persisted layout (`wal/`, `data/`, `raft/`).
    pub storage_root: PathBuf,
    /// Memtable rotation threshold, bytes.
    pub memtable_limit: usize,
    /// Background compaction period.
    pub compaction_interval: Duration,
    /// How long a proposal waits for its index to apply.
    pub propose_timeout: Duration,
    /// Election timeout window, lower bound.
    pub election_timeout_min: Duration,
    /// Election timeout window, upper bound.
    pub election_timeout_max: Duration,
    /// Leader heartbeat period.
    pub heartbeat_interval: Duration,
}

impl StoreConfig {
    /// Production defaults for the given identity and storage root.
    pub fn new(node_id: NodeId, peers: Vec<NodeId>, storage_root: impl Into<PathBuf>) -> Self {
        Self {
            node_id,
            peers,
            storage_root: storage_root.into(),
            memtable_limit: 4 * 1024 * 1024,
            compaction_interval: Duration::from_secs(60),
            propose_timeout: Duration::from_secs(2),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(600),
            heartbeat_interval: Duration::from_millis(100),
        }
    }

    fn wal_dir(&self) -> PathBuf {
        self.storage_root
            .join("wal")
            .join(format!("wal_{}", self.node_id))
    }

    fn sst_dir(&self) -> PathBuf {
        self.storage_root
            .join("data")
            .join(format!("data_{}", self.node_id))
    }

    fn raft_wal_path(&self) -> PathBuf {
        self.storage_root
            .join("raft")
            .join(format!("raft_{}.log", self.node_id))
    }
}

// ------------------------------------------------------------------------------------------------
// Store
// ------------------------------------------------------------------------------------------------

type NotifyMap = Mutex<HashMap<u64, Sender<()>>>;

/// One replicated store node: consensus, LSM engine, applier, waiters.
pub struct Store {
    node_id: NodeId,
    engine: Engine,
    raft: Arc<RaftNode>,
    notify: Arc<NotifyMap>,
    metrics: Arc<Metrics>,
    propose_timeout: Duration,
    applier_shutdown_tx: Sender<()>,
    applier: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Store {
    /// Opens the engine, recovers and starts consensus, and spawns the
    /// applier. After a restart the apply loop re-delivers every committed
    /// entry; re-applying them to the engine is idempotent.
    pub fn open(
        config: StoreConfig,
        transport: Arc<dyn RaftTransport>,
    ) -> Result<Arc<Self>, StoreError> {
        fs::create_dir_all(config.storage_root.join("raft"))?;

        let engine = Engine::open(EngineConfig {
            wal_dir: config.wal_dir(),
            sst_dir: config.sst_dir(),
            memtable_limit: config.memtable_limit,
            compaction_interval: config.compaction_interval,
            compaction_min_tables: 4,
        })?;

        let (apply_tx, apply_rx) = unbounded();
        let raft = RaftNode::start(
            RaftConfig {
                id: config.node_id,
                peers: config.peers.clone(),
                wal_path: config.raft_wal_path(),
                election_timeout_min: config.election_timeout_min,
                election_timeout_max: config.election_timeout_max,
                heartbeat_interval: config.heartbeat_interval,
                batch_max: 100,
            },
            transport,
            apply_tx,
        )?;

        let (applier_shutdown_tx, applier_shutdown_rx) = bounded(1);
        let store = Arc::new(Self {
            node_id: config.node_id,
            engine,
            raft,
            notify: Arc::new(Mutex::new(HashMap::new())),
            metrics: Arc::new(Metrics::new()),
            propose_timeout: config.propose_timeout,
            applier_shutdown_tx,
            applier: Mutex::new(None),
        });

        let worker = Arc::clone(&store);
        let handle = thread::Builder::new()
            .name("store-applier".into())
            .spawn(move || worker.run_applier(&apply_rx, &applier_shutdown_rx))
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        *store
            .applier
            .lock()
            .map_err(|_| StoreError::Internal("applier handle lock poisoned".into()))? =
            Some(handle);

        info!(node_id = config.node_id, root = %config.storage_root.display(), "store opened");
        Ok(store)
    }

    /// Replicated write.
    pub fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.propose(Command::Put {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Replicated delete.
    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.propose(Command::Delete {
            key: key.to_string(),
        })
    }

    /// Local read; does not go through consensus, so followers may return
    /// slightly stale values. `Ok(None)` means absent or tombstoned.
    pub fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Metrics::inc(&self.metrics.gets);
        match self.engine.get(key.as_bytes())? {
            None => Ok(None),
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| StoreError::Internal("stored value is not UTF-8".into())),
        }
    }

    /// The leader this node currently believes in.
    pub fn leader(&self) -> Option<NodeId> {
        self.raft.leader()
    }

    /// Whether this node currently leads.
    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The consensus participant, for wiring up the inbound RPC server.
    pub fn raft_node(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    /// Consensus snapshot for observability.
    pub fn raft_status(&self) -> Result<RaftStatus, StoreError> {
        Ok(self.raft.status()?)
    }

    /// Engine snapshot for observability.
    pub fn engine_stats(&self) -> Result<EngineStats, StoreError> {
        Ok(self.engine.stats()?)
    }

    /// Shared metrics counters (the frontend also bumps these).
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Prometheus text for `GET /metrics`.
    pub fn metrics_text(&self) -> Result<String, StoreError> {
        let engine = self.engine.stats()?;
        let raft = self.raft.status()?;
        Ok(self.metrics.render(&engine, &raft))
    }

    /// Stops consensus, the applier, and the engine workers.
    pub fn close(&self) -> Result<(), StoreError> {
        self.raft.shutdown();
        let _ = self.applier_shutdown_tx.send(());
        if let Ok(mut applier) = self.applier.lock()
            && let Some(handle) = applier.take()
        {
            let _ = handle.join();
        }
        self.engine.close()?;
        info!(node_id = self.node_id, "store closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Propose / wait
    // --------------------------------------------------------------------------------------------

    fn propose(&self, command: Command) -> Result<(), StoreError> {
        let payload = encoding::encode_to_vec(&command)?;
        let (index, term) = self.raft.propose(payload).map_err(|e| match e {
            RaftError::NotLeader => {
                Metrics::inc(&self.metrics.not_leader);
                StoreError::NotLeader
            }
            other => StoreError::Raft(other),
        })?;

        // One-shot completion handle keyed by the log index.
        let (tx, rx) = bounded(1);
        {
            let mut notify = self.lock_notify()?;
            notify.insert(index, tx);
        }
        trace!(index, term, "proposal registered, waiting for apply");

        match rx.recv_timeout(self.propose_timeout) {
            Ok(()) => Ok(()),
            Err(_) => {
                // Remove our entry so a late apply signal is dropped.
                let mut notify = self.lock_notify()?;
                notify.remove(&index);
                Metrics::inc(&self.metrics.proposal_timeouts);
                warn!(index, term, "proposal timed out waiting for apply");
                Err(StoreError::Timeout)
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Applier
    // --------------------------------------------------------------------------------------------

    fn run_applier(&self, apply_rx: &Receiver<ApplyMsg>, shutdown_rx: &Receiver<()>) {
        loop {
            let msg = crossbeam::select! {
                recv(apply_rx) -> msg => match msg {
                    Ok(msg) => msg,
                    Err(_) => break, // consensus went away
                },
                recv(shutdown_rx) -> _ => break,
            };
            self.apply_one(&msg);

            // Wake the waiter for this index, if one is registered here.
            if let Ok(mut notify) = self.notify.lock()
                && let Some(tx) = notify.remove(&msg.index)
            {
                let _ = tx.try_send(());
            }
        }
        debug!("applier stopped");
    }

    fn apply_one(&self, msg: &ApplyMsg) {
        let command = match encoding::decode_from_slice::<Command>(&msg.command) {
            Ok((command, _)) => command,
            Err(e) => {
                // Skipping a committed entry would diverge this replica.
                error!(index = msg.index, error = %e, "undecodable committed command, aborting");
                std::process::abort();
            }
        };

        loop {
            let result = match &command {
                Command::Put { key, value } => self.engine.put(key.as_bytes(), value.as_bytes()),
                Command::Delete { key } => self.engine.delete(key.as_bytes()),
            };
            match result {
                Ok(()) => break,
                Err(EngineError::WriteStall) => {
                    // The index is committed; the apply is paused, not
                    // lost. Back off until the flush drains.
                    Metrics::inc(&self.metrics.stall_retries);
                    thread::sleep(STALL_RETRY_BACKOFF);
                }
                Err(e) => {
                    error!(index = msg.index, error = %e, "apply failed fatally");
                    std::process::abort();
                }
            }
        }

        match &command {
            Command::Put { key, .. } => {
                Metrics::inc(&self.metrics.puts_applied);
                trace!(index = msg.index, key = %key, "put applied");
            }
            Command::Delete { key } => {
                Metrics::inc(&self.metrics.deletes_applied);
                trace!(index = msg.index, key = %key, "delete applied");
            }
        }
    }

    fn lock_notify(&self) -> Result<std::sync::MutexGuard<'_, HashMap<u64, Sender<()>>>, StoreError>
    {
        self.notify
            .lock()
            .map_err(|_| StoreError::Internal("notify map lock poisoned".into()))
    }
}
