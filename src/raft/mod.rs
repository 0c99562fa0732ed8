//! # Consensus Module
//!
//! Leader-based replication of an opaque command log across a
//! fixed-membership cluster. Nodes move between Follower, Candidate, and
//! Leader; the leader appends client commands to its log, replicates them
//! in heartbeat-driven batches, and advances the commit index once a
//! majority holds them. Committed entries flow, in index order, out of the
//! apply channel — the module knows nothing about the state machine on the
//! other end.
//!
//! ## Log shape
//!
//! The in-memory log is gapless and 1-based; slot 0 holds a synthetic
//! sentinel with term 0 so `prev_log_term` derivation can always index it.
//!
//! ## Threads
//!
//! Three long-lived workers per node: the election ticker (checks the
//! randomized timeout), the heartbeat ticker (active only while Leader),
//! and the apply loop (drains newly committed entries to the channel).
//! Every outgoing RPC runs on its own short-lived thread so a slow peer
//! never delays the rest of the cluster.
//!
//! ## Locking & persistence
//!
//! One mutex guards all volatile state. It is held across RPC *handling*,
//! including the WAL writes that must land before a reply (vote grants,
//! term bumps, log appends), and released for the duration of every
//! outgoing network call. Persistence failures abort the process: silently
//! dropping acknowledged state would be worse.

pub mod transport;
pub mod wal;

#[cfg(test)]
mod tests;

pub use transport::{
    AppendEntriesReply, AppendEntriesRequest, Conflict, RaftTransport, TcpTransport, VoteReply,
    VoteRequest,
};
pub use wal::{HardState, LogEntry, RaftWal, RaftWalError};

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc, Condvar, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam::channel::Sender;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Node identifier within the static cluster membership.
pub type NodeId = u64;

/// How often the election ticker re-checks the timeout.
const ELECTION_TICK: Duration = Duration::from_millis(20);

/// How long the apply loop sleeps between shutdown checks while idle.
const APPLY_WAIT: Duration = Duration::from_millis(100);

// ------------------------------------------------------------------------------------------------
// Error & message types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by the consensus module.
#[derive(Debug, Error)]
pub enum RaftError {
    /// This node is not the leader; the caller should redirect.
    #[error("not leader")]
    NotLeader,

    /// Consensus WAL failure during startup.
    #[error("raft WAL error: {0}")]
    Wal(#[from] RaftWalError),

    /// Internal invariant violation (poisoned lock).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A committed entry handed to the state machine.
#[derive(Debug, Clone)]
pub struct ApplyMsg {
    /// Log index of the entry; strictly increasing on the channel.
    pub index: u64,
    /// Term the entry was proposed under.
    pub term: u64,
    /// The opaque command payload.
    pub command: Vec<u8>,
}

/// Role of a node within the current term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Passive replica; expects heartbeats.
    Follower,
    /// Campaigning for leadership.
    Candidate,
    /// Accepts proposals and drives replication.
    Leader,
}

/// Consensus configuration; timing defaults follow the usual 100 ms
/// heartbeat under a 300–600 ms randomized election window.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's id.
    pub id: NodeId,
    /// The other cluster members.
    pub peers: Vec<NodeId>,
    /// Path of the consensus WAL file.
    pub wal_path: PathBuf,
    /// Lower bound of the randomized election timeout.
    pub election_timeout_min: Duration,
    /// Upper bound of the randomized election timeout.
    pub election_timeout_max: Duration,
    /// Heartbeat / replication tick while Leader.
    pub heartbeat_interval: Duration,
    /// Max entries per AppendEntries batch.
    pub batch_max: usize,
}

impl RaftConfig {
    /// Standard timing for a node of the given cluster.
    pub fn new(id: NodeId, peers: Vec<NodeId>, wal_path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            peers,
            wal_path: wal_path.into(),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(600),
            heartbeat_interval: Duration::from_millis(100),
            batch_max: 100,
        }
    }
}

/// Observability snapshot of a node.
#[derive(Debug, Clone)]
pub struct RaftStatus {
    /// Current term.
    pub term: u64,
    /// Current role.
    pub role: Role,
    /// Known leader, if any.
    pub leader: Option<NodeId>,
    /// Highest committed index.
    pub commit_index: u64,
    /// Highest applied index.
    pub last_applied: u64,
    /// Last log index.
    pub last_log_index: u64,
}

// ------------------------------------------------------------------------------------------------
// Node state
// ------------------------------------------------------------------------------------------------

struct RaftState {
    current_term: u64,
    voted_for: Option<NodeId>,
    /// Gapless log with a sentinel at index 0.
    log: Vec<LogEntry>,
    commit_index: u64,
    last_applied: u64,
    role: Role,
    leader_id: Option<NodeId>,
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,
    last_reset: Instant,
    election_timeout: Duration,
    votes_received: u64,
}

impl RaftState {
    fn last_log_index(&self) -> u64 {
        (self.log.len() - 1) as u64
    }

    fn last_log_term(&self) -> u64 {
        self.log[self.log.len() - 1].term
    }

    fn hard_state(&self) -> HardState {
        HardState {
            term: self.current_term,
            vote: self.voted_for,
            commit: self.commit_index,
        }
    }
}

/// A consensus participant.
///
/// Created with [`RaftNode::start`]; lives until [`RaftNode::shutdown`]
/// or process exit.
pub struct RaftNode {
    config: RaftConfig,
    state: Mutex<RaftState>,
    apply_cond: Condvar,
    wal: RaftWal,
    transport: Arc<dyn RaftTransport>,
    apply_tx: Sender<ApplyMsg>,
    stop: AtomicBool,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl RaftNode {
    /// Recovers durable state from the consensus WAL and starts the
    /// election ticker, heartbeat ticker, and apply loop.
    ///
    /// The node depends only on `apply_tx` — never on the state machine
    /// behind it.
    pub fn start(
        config: RaftConfig,
        transport: Arc<dyn RaftTransport>,
        apply_tx: Sender<ApplyMsg>,
    ) -> Result<Arc<Self>, RaftError> {
        let wal = RaftWal::open(&config.wal_path)?;
        let (entries, hard) = wal.recover()?;

        let mut log = Vec::with_capacity(entries.len() + 1);
        log.push(LogEntry {
            index: 0,
            term: 0,
            command: Vec::new(),
        });
        log.extend(entries);

        let last_index = (log.len() - 1) as u64;
        let state = RaftState {
            current_term: hard.term,
            voted_for: hard.vote,
            log,
            commit_index: hard.commit.min(last_index),
            last_applied: 0,
            role: Role::Follower,
            leader_id: None,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            last_reset: Instant::now(),
            election_timeout: random_timeout(&config),
            votes_received: 0,
        };

        info!(
            id = config.id,
            term = hard.term,
            commit = state.commit_index,
            last_log_index = last_index,
            "raft node starting"
        );

        let node = Arc::new(Self {
            config,
            state: Mutex::new(state),
            apply_cond: Condvar::new(),
            wal,
            transport,
            apply_tx,
            stop: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        });
        node.spawn_workers()?;
        Ok(node)
    }

    // --------------------------------------------------------------------------------------------
    // Public API
    // --------------------------------------------------------------------------------------------

    /// Proposes a command. Leader-only; appends to the local log, persists
    /// it, and returns `(index, term)` without waiting for replication —
    /// commitment is observed through the apply channel.
    pub fn propose(&self, command: Vec<u8>) -> Result<(u64, u64), RaftError> {
        let mut st = self.lock()?;
        if st.role != Role::Leader {
            return Err(RaftError::NotLeader);
        }

        let entry = LogEntry {
            index: st.last_log_index() + 1,
            term: st.current_term,
            command,
        };
        st.log.push(entry.clone());
        self.must_append_log(&[entry.clone()]);

        // A lone node is its own majority; otherwise this is a no-op and
        // commitment waits for append replies.
        self.advance_commit(&mut st);

        trace!(index = entry.index, term = entry.term, "command proposed");
        Ok((entry.index, entry.term))
    }

    /// The leader this node currently believes in, if any.
    pub fn leader(&self) -> Option<NodeId> {
        self.lock().ok().and_then(|st| st.leader_id)
    }

    /// Whether this node is currently the leader.
    pub fn is_leader(&self) -> bool {
        self.lock().map(|st| st.role == Role::Leader).unwrap_or(false)
    }

    /// This node's id.
    pub fn id(&self) -> NodeId {
        self.config.id
    }

    /// Snapshot of the node's consensus state for observability.
    pub fn status(&self) -> Result<RaftStatus, RaftError> {
        let st = self.lock()?;
        Ok(RaftStatus {
            term: st.current_term,
            role: st.role,
            leader: st.leader_id,
            commit_index: st.commit_index,
            last_applied: st.last_applied,
            last_log_index: st.last_log_index(),
        })
    }

    /// Stops the workers and waits for them. In-flight RPC threads finish
    /// on their own.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.apply_cond.notify_all();
        let handles: Vec<_> = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(_) => return,
        };
        for handle in handles {
            let _ = handle.join();
        }
        debug!(id = self.config.id, "raft node stopped");
    }

    // --------------------------------------------------------------------------------------------
    // RPC handlers (called by the transport server and by tests)
    // --------------------------------------------------------------------------------------------

    /// AppendEntries receiver.
    pub fn handle_append_entries(&self, req: &AppendEntriesRequest) -> AppendEntriesReply {
        let Ok(mut st) = self.lock() else {
            return AppendEntriesReply {
                term: 0,
                success: false,
                conflict: None,
            };
        };

        // 1. Stale leader: reject with our term, no hints.
        if req.term < st.current_term {
            return AppendEntriesReply {
                term: st.current_term,
                success: false,
                conflict: None,
            };
        }

        // 2. Adopt the leader's term and authority.
        st.current_term = req.term;
        st.role = Role::Follower;
        st.voted_for = None;
        st.leader_id = Some(req.leader_id);
        st.last_reset = Instant::now();
        self.must_persist_hard_state(&st);
        let term = st.current_term;

        // 3. Our log is too short to check prev: fast-forward the leader
        //    to our end.
        let last = st.last_log_index();
        if req.prev_log_index > last {
            return AppendEntriesReply {
                term,
                success: false,
                conflict: Some(Conflict {
                    index: last + 1,
                    term: None,
                }),
            };
        }

        // 4. Term mismatch at prev: report the conflicting term and its
        //    earliest index so the leader can skip the whole term.
        let local_prev_term = st.log[req.prev_log_index as usize].term;
        if local_prev_term != req.prev_log_term {
            let mut conflict_index = req.prev_log_index;
            while conflict_index > 1 && st.log[(conflict_index - 1) as usize].term == local_prev_term
            {
                conflict_index -= 1;
            }
            return AppendEntriesReply {
                term,
                success: false,
                conflict: Some(Conflict {
                    index: conflict_index,
                    term: Some(local_prev_term),
                }),
            };
        }

        // 5. Merge: append into empty slots, truncate-and-append on term
        //    conflicts, skip exact duplicates.
        let mut changed = false;
        for (i, entry) in req.entries.iter().enumerate() {
            let index = req.prev_log_index + 1 + i as u64;
            if index <= st.last_log_index() {
                if st.log[index as usize].term != entry.term {
                    st.log.truncate(index as usize);
                    st.log.push(entry.clone());
                    changed = true;
                }
            } else {
                st.log.push(entry.clone());
                changed = true;
            }
        }

        // 6. Persist the batch if anything moved.
        if changed {
            self.must_append_log(&req.entries);
        }

        // 7. Advance commit to what the leader has proven durable here.
        if req.leader_commit > st.commit_index {
            let last_new = req.prev_log_index + req.entries.len() as u64;
            st.commit_index = req.leader_commit.min(last_new);
            self.must_persist_hard_state(&st);
            self.apply_cond.notify_all();
        }

        // 8. Accept.
        AppendEntriesReply {
            term,
            success: true,
            conflict: None,
        }
    }

    /// RequestVote receiver.
    pub fn handle_request_vote(&self, req: &VoteRequest) -> VoteReply {
        let Ok(mut st) = self.lock() else {
            return VoteReply {
                term: 0,
                vote_granted: false,
            };
        };

        if req.term < st.current_term {
            return VoteReply {
                term: st.current_term,
                vote_granted: false,
            };
        }

        let mut dirty = false;
        if req.term > st.current_term {
            st.current_term = req.term;
            st.role = Role::Follower;
            st.voted_for = None;
            st.leader_id = None;
            dirty = true;
        }

        let up_to_date = req.last_log_term > st.last_log_term()
            || (req.last_log_term == st.last_log_term()
                && req.last_log_index >= st.last_log_index());
        let grant = up_to_date
            && (st.voted_for.is_none() || st.voted_for == Some(req.candidate_id));

        if grant {
            st.voted_for = Some(req.candidate_id);
            st.last_reset = Instant::now();
            dirty = true;
        }
        if dirty {
            self.must_persist_hard_state(&st);
        }

        trace!(
            candidate = req.candidate_id,
            term = req.term,
            grant,
            "vote request handled"
        );
        VoteReply {
            term: st.current_term,
            vote_granted: grant,
        }
    }

    // --------------------------------------------------------------------------------------------
    // Elections
    // --------------------------------------------------------------------------------------------

    fn run_election_ticker(self: &Arc<Self>) {
        while !self.stop.load(Ordering::Acquire) {
            thread::sleep(ELECTION_TICK);

            let mut won_alone = false;
            let campaign = {
                let Ok(mut st) = self.lock() else { return };
                if st.role != Role::Leader && st.last_reset.elapsed() >= st.election_timeout {
                    // Become candidate for the next term.
                    st.current_term += 1;
                    st.role = Role::Candidate;
                    st.voted_for = Some(self.config.id);
                    st.leader_id = None;
                    st.votes_received = 1;
                    st.last_reset = Instant::now();
                    st.election_timeout = random_timeout(&self.config);
                    self.must_persist_hard_state(&st);

                    info!(
                        id = self.config.id,
                        term = st.current_term,
                        "election timeout, campaigning"
                    );

                    if st.votes_received >= self.majority() {
                        // Single-node cluster: own vote is the majority.
                        self.become_leader(&mut st);
                        won_alone = true;
                        None
                    } else {
                        Some(VoteRequest {
                            term: st.current_term,
                            candidate_id: self.config.id,
                            last_log_index: st.last_log_index(),
                            last_log_term: st.last_log_term(),
                        })
                    }
                } else {
                    None
                }
            };
            if won_alone {
                self.broadcast_append_entries();
            }

            if let Some(request) = campaign {
                for &peer in &self.config.peers {
                    let node = Arc::clone(self);
                    let request = request.clone();
                    let _ = thread::Builder::new().name("raft-vote".into()).spawn(
                        move || {
                            if let Some(reply) = node.transport.request_vote(peer, &request) {
                                node.on_vote_reply(request.term, &reply);
                            }
                        },
                    );
                }
            }
        }
    }

    fn on_vote_reply(self: &Arc<Self>, election_term: u64, reply: &VoteReply) {
        let became_leader = {
            let Ok(mut st) = self.lock() else { return };

            if reply.term > st.current_term {
                self.step_down(&mut st, reply.term);
                return;
            }
            if st.role != Role::Candidate
                || st.current_term != election_term
                || !reply.vote_granted
            {
                return;
            }

            st.votes_received += 1;
            if st.votes_received >= self.majority() {
                self.become_leader(&mut st);
                true
            } else {
                false
            }
        };

        if became_leader {
            // Assert authority immediately instead of waiting a tick.
            self.broadcast_append_entries();
        }
    }

    /// Leader bookkeeping once a majority of votes is in.
    fn become_leader(self: &Arc<Self>, st: &mut RaftState) {
        st.role = Role::Leader;
        st.leader_id = Some(self.config.id);
        let next = st.last_log_index() + 1;
        for &peer in &self.config.peers {
            st.next_index.insert(peer, next);
            st.match_index.insert(peer, 0);
        }
        info!(id = self.config.id, term = st.current_term, "won election");
    }

    // --------------------------------------------------------------------------------------------
    // Replication
    // --------------------------------------------------------------------------------------------

    fn run_heartbeat_ticker(self: &Arc<Self>) {
        while !self.stop.load(Ordering::Acquire) {
            thread::sleep(self.config.heartbeat_interval);
            if self.is_leader() {
                self.broadcast_append_entries();
            }
        }
    }

    /// Fans one replication round out to every peer, one thread per RPC.
    fn broadcast_append_entries(self: &Arc<Self>) {
        for &peer in &self.config.peers {
            let node = Arc::clone(self);
            let _ = thread::Builder::new()
                .name("raft-append".into())
                .spawn(move || node.replicate_to(peer));
        }
    }

    fn replicate_to(self: &Arc<Self>, peer: NodeId) {
        let request = {
            let Ok(st) = self.lock() else { return };
            if st.role != Role::Leader {
                return;
            }

            let last = st.last_log_index();
            let next = st
                .next_index
                .get(&peer)
                .copied()
                .unwrap_or(last + 1)
                .clamp(1, last + 1);
            let prev_log_index = next - 1;
            let prev_log_term = st.log[prev_log_index as usize].term;

            let end = last.min(prev_log_index + self.config.batch_max as u64);
            let entries = if next <= end {
                st.log[next as usize..=end as usize].to_vec()
            } else {
                Vec::new()
            };

            AppendEntriesRequest {
                term: st.current_term,
                leader_id: self.config.id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: st.commit_index,
            }
        };

        // The state lock is never held across the network call.
        let Some(reply) = self.transport.append_entries(peer, &request) else {
            return;
        };
        self.on_append_reply(peer, &request, &reply);
    }

    fn on_append_reply(
        &self,
        peer: NodeId,
        request: &AppendEntriesRequest,
        reply: &AppendEntriesReply,
    ) {
        let Ok(mut st) = self.lock() else { return };

        if reply.term > st.current_term {
            self.step_down(&mut st, reply.term);
            return;
        }
        if st.role != Role::Leader || st.current_term != request.term {
            return;
        }

        if reply.success {
            // matchIndex only ever moves forward.
            let new_match = request.prev_log_index + request.entries.len() as u64;
            if new_match > st.match_index.get(&peer).copied().unwrap_or(0) {
                st.match_index.insert(peer, new_match);
                st.next_index.insert(peer, new_match + 1);
            }
            self.advance_commit(&mut st);
        } else if let Some(conflict) = reply.conflict {
            let next = match conflict.term {
                // Follower's log is shorter; jump straight to its end.
                None => conflict.index,
                Some(conflict_term) => {
                    // If we hold that term, resume right after our last
                    // entry of it; otherwise skip the term entirely.
                    let mut found = None;
                    for i in (1..=st.last_log_index()).rev() {
                        if st.log[i as usize].term == conflict_term {
                            found = Some(i + 1);
                            break;
                        }
                    }
                    found.unwrap_or(conflict.index)
                }
            };
            st.next_index.insert(peer, next.max(1));
            debug!(peer, next, "fast backtracking after rejected append");
        }
    }

    /// Leader-side commit rule: the largest N above the current commit
    /// index with `log[N].term == current_term` and a majority of
    /// `match_index ≥ N` (the leader counts itself).
    fn advance_commit(&self, st: &mut RaftState) {
        let mut n = st.last_log_index();
        while n > st.commit_index {
            if st.log[n as usize].term == st.current_term {
                let replicas = 1 + self
                    .config
                    .peers
                    .iter()
                    .filter(|&&peer| st.match_index.get(&peer).copied().unwrap_or(0) >= n)
                    .count() as u64;
                if replicas >= self.majority() {
                    st.commit_index = n;
                    self.must_persist_hard_state(st);
                    self.apply_cond.notify_all();
                    trace!(commit = n, "commit index advanced");
                    break;
                }
            }
            n -= 1;
        }
    }

    // --------------------------------------------------------------------------------------------
    // Apply loop
    // --------------------------------------------------------------------------------------------

    fn run_apply_loop(&self) {
        let Ok(mut st) = self.lock() else { return };
        loop {
            while st.last_applied >= st.commit_index {
                if self.stop.load(Ordering::Acquire) {
                    return;
                }
                let Ok((guard, _)) = self.apply_cond.wait_timeout(st, APPLY_WAIT) else {
                    return;
                };
                st = guard;
            }

            let batch: Vec<LogEntry> = ((st.last_applied + 1)..=st.commit_index)
                .map(|i| st.log[i as usize].clone())
                .collect();
            st.last_applied = st.commit_index;
            drop(st);

            for entry in batch {
                let msg = ApplyMsg {
                    index: entry.index,
                    term: entry.term,
                    command: entry.command,
                };
                if self.apply_tx.send(msg).is_err() {
                    // The state machine went away; nothing left to do.
                    return;
                }
            }

            let Ok(guard) = self.lock() else { return };
            st = guard;
        }
    }

    // --------------------------------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------------------------------

    fn spawn_workers(self: &Arc<Self>) -> Result<(), RaftError> {
        let mut workers = self
            .workers
            .lock()
            .map_err(|_| RaftError::Internal("worker registry poisoned".into()))?;

        let node = Arc::clone(self);
        workers.push(
            thread::Builder::new()
                .name("raft-election".into())
                .spawn(move || node.run_election_ticker())
                .map_err(|e| RaftError::Internal(e.to_string()))?,
        );

        let node = Arc::clone(self);
        workers.push(
            thread::Builder::new()
                .name("raft-heartbeat".into())
                .spawn(move || node.run_heartbeat_ticker())
                .map_err(|e| RaftError::Internal(e.to_string()))?,
        );

        let node = Arc::clone(self);
        workers.push(
            thread::Builder::new()
                .name("raft-apply".into())
                .spawn(move || node.run_apply_loop())
                .map_err(|e| RaftError::Internal(e.to_string()))?,
        );
        Ok(())
    }

    /// Observed a higher term: revert to follower and persist before
    /// anything else happens under that term.
    fn step_down(&self, st: &mut RaftState, term: u64) {
        warn!(
            id = self.config.id,
            old_term = st.current_term,
            new_term = term,
            "stepping down"
        );
        st.current_term = term;
        st.role = Role::Follower;
        st.voted_for = None;
        st.leader_id = None;
        self.must_persist_hard_state(st);
    }

    /// Votes needed to win (cluster majority, self included).
    fn majority(&self) -> u64 {
        (self.config.peers.len() as u64 + 1) / 2 + 1
    }

    fn lock(&self) -> Result<MutexGuard<'_, RaftState>, RaftError> {
        self.state
            .lock()
            .map_err(|_| RaftError::Internal("raft state lock poisoned".into()))
    }

    /// Log persistence that must not fail: an fsync error here means
    /// acknowledged entries could vanish, so the process dies instead.
    fn must_append_log(&self, entries: &[LogEntry]) {
        if let Err(e) = self.wal.append_entries(entries) {
            error!(error = %e, "raft log persistence failed, aborting");
            std::process::abort();
        }
    }

    /// Hard-state persistence with the same fatality rule.
    fn must_persist_hard_state(&self, st: &RaftState) {
        if let Err(e) = self.wal.persist_hard_state(&st.hard_state()) {
            error!(error = %e, "hard state persistence failed, aborting");
            std::process::abort();
        }
    }
}

fn random_timeout(config: &RaftConfig) -> Duration {
    let min = config.election_timeout_min.as_millis() as u64;
    let max = config.election_timeout_max.as_millis() as u64;
    Duration::from_millis(rand::rng().random_range(min..=max))
}
