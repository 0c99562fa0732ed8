//! Peer RPC transport.
//!
//! Two calls exist between peers: `AppendEntries` and `RequestVote`, both
//! strict request/reply. The [`RaftTransport`] trait is the seam the
//! consensus module talks through, so tests can wire nodes together in
//! process while production uses [`TcpTransport`].
//!
//! Failure model: a timeout or any transport error is "no reply" — the
//! caller changes no state and simply retries on its next tick. Calls
//! carry a hard deadline (500 ms by default); connections are reused per
//! peer and dropped on the first error.
//!
//! Wire format: one frame per message, `[len u32][payload][crc u32]`, the
//! payload being an [`encoding`]-serialized [`RpcMessage`].

use std::{
    collections::HashMap,
    io::{Read, Write},
    net::{TcpListener, TcpStream, ToSocketAddrs},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use crc32fast::Hasher as Crc32;
use tracing::{debug, info, trace, warn};

use crate::encoding::{self, Decode, Encode, EncodingError, decode_vec, encode_slice};
use crate::raft::wal::LogEntry;
use crate::raft::{NodeId, RaftNode};

/// Hard deadline for one outgoing RPC.
pub const RPC_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound for one RPC frame; a batch of 100 entries stays far below.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Message types
// ------------------------------------------------------------------------------------------------

/// Log replication / heartbeat request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesRequest {
    /// Leader's term.
    pub term: u64,
    /// Leader's node id, so followers can redirect clients.
    pub leader_id: NodeId,
    /// Index of the entry immediately before the batch.
    pub prev_log_index: u64,
    /// Term of that entry.
    pub prev_log_term: u64,
    /// Entries to replicate; empty for a pure heartbeat.
    pub entries: Vec<LogEntry>,
    /// Leader's commit index.
    pub leader_commit: u64,
}

/// Fast-backtracking hint attached to a log-consistency rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conflict {
    /// Where the leader should resume probing.
    pub index: u64,
    /// Term of the conflicting entry, or `None` when the follower's log is
    /// simply too short.
    pub term: Option<u64>,
}

/// Reply to [`AppendEntriesRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesReply {
    /// Receiver's current term, for the leader to step down on.
    pub term: u64,
    /// Whether the entries were accepted.
    pub success: bool,
    /// Backtracking hint; present only on log-consistency rejections,
    /// never on stale-term rejections.
    pub conflict: Option<Conflict>,
}

/// Leader election vote request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteRequest {
    /// Candidate's term.
    pub term: u64,
    /// Candidate requesting the vote.
    pub candidate_id: NodeId,
    /// Index of the candidate's last log entry.
    pub last_log_index: u64,
    /// Term of the candidate's last log entry.
    pub last_log_term: u64,
}

/// Reply to [`VoteRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteReply {
    /// Receiver's current term.
    pub term: u64,
    /// Whether the vote was granted.
    pub vote_granted: bool,
}

/// Everything that can cross the wire, discriminated by a tag byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcMessage {
    /// AppendEntries request.
    AppendRequest(AppendEntriesRequest),
    /// AppendEntries reply.
    AppendReply(AppendEntriesReply),
    /// RequestVote request.
    VoteRequest(VoteRequest),
    /// RequestVote reply.
    VoteReply(VoteReply),
}

// ------------------------------------------------------------------------------------------------
// Wire encoding
// ------------------------------------------------------------------------------------------------

impl Encode for AppendEntriesRequest {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.term.encode_to(buf)?;
        self.leader_id.encode_to(buf)?;
        self.prev_log_index.encode_to(buf)?;
        self.prev_log_term.encode_to(buf)?;
        encode_slice(&self.entries, buf)?;
        self.leader_commit.encode_to(buf)
    }
}

impl Decode for AppendEntriesRequest {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (term, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (leader_id, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (prev_log_index, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (prev_log_term, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (entries, n) = decode_vec::<LogEntry>(&buf[offset..])?;
        offset += n;
        let (leader_commit, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            },
            offset,
        ))
    }
}

impl Encode for Conflict {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.index.encode_to(buf)?;
        self.term.encode_to(buf)
    }
}

impl Decode for Conflict {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (index, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (term, n) = <Option<u64>>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { index, term }, offset))
    }
}

impl Encode for AppendEntriesReply {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.term.encode_to(buf)?;
        self.success.encode_to(buf)?;
        self.conflict.encode_to(buf)
    }
}

impl Decode for AppendEntriesReply {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (term, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (success, n) = bool::decode_from(&buf[offset..])?;
        offset += n;
        let (conflict, n) = <Option<Conflict>>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                term,
                success,
                conflict,
            },
            offset,
        ))
    }
}

impl Encode for VoteRequest {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.term.encode_to(buf)?;
        self.candidate_id.encode_to(buf)?;
        self.last_log_index.encode_to(buf)?;
        self.last_log_term.encode_to(buf)
    }
}

impl Decode for VoteRequest {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (term, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (candidate_id, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (last_log_index, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (last_log_term, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            },
            offset,
        ))
    }
}

impl Encode for VoteReply {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.term.encode_to(buf)?;
        self.vote_granted.encode_to(buf)
    }
}

impl Decode for VoteReply {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (term, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (vote_granted, n) = bool::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { term, vote_granted }, offset))
    }
}

impl Encode for RpcMessage {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            RpcMessage::AppendRequest(m) => {
                1u8.encode_to(buf)?;
                m.encode_to(buf)
            }
            RpcMessage::AppendReply(m) => {
                2u8.encode_to(buf)?;
                m.encode_to(buf)
            }
            RpcMessage::VoteRequest(m) => {
                3u8.encode_to(buf)?;
                m.encode_to(buf)
            }
            RpcMessage::VoteReply(m) => {
                4u8.encode_to(buf)?;
                m.encode_to(buf)
            }
        }
    }
}

impl Decode for RpcMessage {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut offset) = u8::decode_from(buf)?;
        macro_rules! variant {
            ($ty:ty, $ctor:expr) => {{
                let (m, n) = <$ty>::decode_from(&buf[offset..])?;
                offset += n;
                Ok(($ctor(m), offset))
            }};
        }
        match tag {
            1 => variant!(AppendEntriesRequest, RpcMessage::AppendRequest),
            2 => variant!(AppendEntriesReply, RpcMessage::AppendReply),
            3 => variant!(VoteRequest, RpcMessage::VoteRequest),
            4 => variant!(VoteReply, RpcMessage::VoteReply),
            other => Err(EncodingError::InvalidTag {
                tag: u32::from(other),
                type_name: "RpcMessage",
            }),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Transport trait
// ------------------------------------------------------------------------------------------------

/// The capability the consensus module replicates and campaigns through.
///
/// `None` means "no reply": the peer was unreachable, the call timed out,
/// or the reply was garbled. The caller must treat all three identically.
pub trait RaftTransport: Send + Sync {
    /// Sends an AppendEntries request and waits for the reply.
    fn append_entries(
        &self,
        peer: NodeId,
        request: &AppendEntriesRequest,
    ) -> Option<AppendEntriesReply>;

    /// Sends a RequestVote request and waits for the reply.
    fn request_vote(&self, peer: NodeId, request: &VoteRequest) -> Option<VoteReply>;
}

// ------------------------------------------------------------------------------------------------
// TCP transport
// ------------------------------------------------------------------------------------------------

/// Connection-reusing TCP transport over a static peer list.
pub struct TcpTransport {
    addrs: HashMap<NodeId, String>,
    conns: Mutex<HashMap<NodeId, TcpStream>>,
    timeout: Duration,
}

impl TcpTransport {
    /// Builds a transport for the given `id -> address` map.
    pub fn new(addrs: HashMap<NodeId, String>) -> Self {
        Self {
            addrs,
            conns: Mutex::new(HashMap::new()),
            timeout: RPC_TIMEOUT,
        }
    }

    fn call(&self, peer: NodeId, request: RpcMessage) -> Option<RpcMessage> {
        let mut stream = self.checkout(peer)?;

        let result = write_frame(&mut stream, &request)
            .ok()
            .and_then(|()| read_frame(&mut stream).ok());

        match result {
            Some(reply) => {
                // Healthy connection, keep it for the next tick.
                if let Ok(mut conns) = self.conns.lock() {
                    conns.insert(peer, stream);
                }
                Some(reply)
            }
            None => {
                trace!(peer, "RPC failed, dropping connection");
                None
            }
        }
    }

    /// Takes the cached connection for `peer` or dials a new one.
    fn checkout(&self, peer: NodeId) -> Option<TcpStream> {
        if let Ok(mut conns) = self.conns.lock()
            && let Some(stream) = conns.remove(&peer)
        {
            return Some(stream);
        }

        let addr = self.addrs.get(&peer)?;
        let sockaddr = addr.to_socket_addrs().ok()?.next()?;
        let stream = TcpStream::connect_timeout(&sockaddr, self.timeout).ok()?;
        stream.set_read_timeout(Some(self.timeout)).ok()?;
        stream.set_write_timeout(Some(self.timeout)).ok()?;
        stream.set_nodelay(true).ok()?;
        debug!(peer, %addr, "peer connection established");
        Some(stream)
    }
}

impl RaftTransport for TcpTransport {
    fn append_entries(
        &self,
        peer: NodeId,
        request: &AppendEntriesRequest,
    ) -> Option<AppendEntriesReply> {
        match self.call(peer, RpcMessage::AppendRequest(request.clone()))? {
            RpcMessage::AppendReply(reply) => Some(reply),
            other => {
                warn!(peer, ?other, "unexpected reply kind to AppendEntries");
                None
            }
        }
    }

    fn request_vote(&self, peer: NodeId, request: &VoteRequest) -> Option<VoteReply> {
        match self.call(peer, RpcMessage::VoteRequest(request.clone()))? {
            RpcMessage::VoteReply(reply) => Some(reply),
            other => {
                warn!(peer, ?other, "unexpected reply kind to RequestVote");
                None
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// RPC server
// ------------------------------------------------------------------------------------------------

/// Serves inbound peer RPCs, one thread per connection, dispatching into
/// the node's handlers. Runs until process exit — consensus has no
/// external cancellation.
pub fn serve(
    listener: TcpListener,
    node: Arc<RaftNode>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("raft-rpc-accept".into())
        .spawn(move || {
            info!(addr = ?listener.local_addr().ok(), "raft RPC server listening");
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let node = Arc::clone(&node);
                let _ = thread::Builder::new()
                    .name("raft-rpc-conn".into())
                    .spawn(move || serve_connection(stream, &node));
            }
        })
}

fn serve_connection(mut stream: TcpStream, node: &RaftNode) {
    let _ = stream.set_nodelay(true);
    loop {
        let request = match read_frame(&mut stream) {
            Ok(request) => request,
            Err(e) => {
                // Peer closed or garbled the stream; it will redial.
                trace!(error = ?e, "inbound connection ended");
                return;
            }
        };
        let reply = match request {
            RpcMessage::AppendRequest(req) => {
                RpcMessage::AppendReply(node.handle_append_entries(&req))
            }
            RpcMessage::VoteRequest(req) => RpcMessage::VoteReply(node.handle_request_vote(&req)),
            other => {
                warn!(?other, "peer sent a reply frame as a request");
                return;
            }
        };
        if write_frame(&mut stream, &reply).is_err() {
            return;
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Framing
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
enum FrameError {
    Io(std::io::Error),
    Garbled,
}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        FrameError::Io(e)
    }
}

fn write_frame(stream: &mut TcpStream, message: &RpcMessage) -> Result<(), FrameError> {
    let payload = encoding::encode_to_vec(message).map_err(|_| FrameError::Garbled)?;
    let len_bytes = (payload.len() as u32).to_le_bytes();

    let mut hasher = Crc32::new();
    hasher.update(&payload);

    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&len_bytes);
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&hasher.finalize().to_le_bytes());

    stream.write_all(&frame)?;
    Ok(())
}

fn read_frame(stream: &mut TcpStream) -> Result<RpcMessage, FrameError> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(FrameError::Garbled);
    }

    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload)?;
    let mut crc_bytes = [0u8; 4];
    stream.read_exact(&mut crc_bytes)?;

    let mut hasher = Crc32::new();
    hasher.update(&payload);
    if hasher.finalize() != u32::from_le_bytes(crc_bytes) {
        return Err(FrameError::Garbled);
    }

    let (message, _) = encoding::decode_from_slice::<RpcMessage>(&payload)
        .map_err(|_| FrameError::Garbled)?;
    Ok(message)
}
