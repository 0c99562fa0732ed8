//! Cluster node binary.
//!
//! Starts one SisyphusDB node: the replicated store, the inbound peer RPC
//! server, and the HTTP frontend. Membership is static — the peer list is
//! fixed at process start and a node's id is its position in that list.
//!
//! ```text
//! sisyphus-server --id 0 \
//!     --peers kv-0:5001,kv-1:5001,kv-2:5001 \
//!     --port 5001 --http 8001 \
//!     --peer-template http://kv-{id}:8001 \
//!     --storage Storage
//! ```
//!
//! A JSON config file (`--config node.json`) may supply any of the same
//! settings; explicit flags win.

use std::collections::HashMap;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use sisyphusdb::api::{ApiContext, serve_http};
use sisyphusdb::raft::{TcpTransport, transport};
use sisyphusdb::store::{Store, StoreConfig};

struct Flags {
    id: u64,
    peers: Vec<String>,
    rpc_port: u16,
    http_port: u16,
    peer_template: String,
    storage_root: PathBuf,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            id: 0,
            peers: vec!["127.0.0.1:5001".to_string()],
            rpc_port: 5001,
            http_port: 8001,
            peer_template: "http://kv-{id}:8001".to_string(),
            storage_root: PathBuf::from("Storage"),
        }
    }
}

fn usage() -> ! {
    eprintln!(
        "usage: sisyphus-server [--config FILE] [--id N] [--peers a:p,b:p,...] \
         [--port RPC_PORT] [--http HTTP_PORT] [--peer-template URL] [--storage DIR]"
    );
    exit(1);
}

fn parse_flags() -> Flags {
    let mut flags = Flags::default();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut iter = args.iter();

    // First pass for --config so explicit flags can override it.
    let mut pairs: Vec<(String, String)> = Vec::new();
    while let Some(flag) = iter.next() {
        let Some(value) = iter.next() else { usage() };
        if flag == "--config" {
            apply_config_file(value, &mut flags);
        } else {
            pairs.push((flag.clone(), value.clone()));
        }
    }

    for (flag, value) in pairs {
        match flag.as_str() {
            "--id" => flags.id = value.parse().unwrap_or_else(|_| usage()),
            "--peers" => flags.peers = value.split(',').map(str::to_string).collect(),
            "--port" => flags.rpc_port = value.parse().unwrap_or_else(|_| usage()),
            "--http" => flags.http_port = value.parse().unwrap_or_else(|_| usage()),
            "--peer-template" => flags.peer_template = value,
            "--storage" => flags.storage_root = PathBuf::from(value),
            _ => usage(),
        }
    }
    flags
}

fn apply_config_file(path: &str, flags: &mut Flags) {
    let text = std::fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("cannot read config {path}: {e}");
        exit(1);
    });
    let value: serde_json::Value = serde_json::from_str(&text).unwrap_or_else(|e| {
        eprintln!("cannot parse config {path}: {e}");
        exit(1);
    });

    if let Some(id) = value.get("id").and_then(|v| v.as_u64()) {
        flags.id = id;
    }
    if let Some(peers) = value.get("peers").and_then(|v| v.as_array()) {
        flags.peers = peers
            .iter()
            .filter_map(|p| p.as_str().map(str::to_string))
            .collect();
    }
    if let Some(port) = value.get("rpc_port").and_then(|v| v.as_u64()) {
        flags.rpc_port = port as u16;
    }
    if let Some(port) = value.get("http_port").and_then(|v| v.as_u64()) {
        flags.http_port = port as u16;
    }
    if let Some(template) = value.get("peer_template").and_then(|v| v.as_str()) {
        flags.peer_template = template.to_string();
    }
    if let Some(root) = value.get("storage_root").and_then(|v| v.as_str()) {
        flags.storage_root = PathBuf::from(root);
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let flags = parse_flags();
    if flags.id as usize >= flags.peers.len() {
        eprintln!(
            "node id {} out of range for a {}-node peer list",
            flags.id,
            flags.peers.len()
        );
        exit(1);
    }

    // A node's id is its index in the peer list; skip our own slot.
    let mut addrs = HashMap::new();
    let mut peers = Vec::new();
    for (i, addr) in flags.peers.iter().enumerate() {
        let peer = i as u64;
        if peer != flags.id {
            addrs.insert(peer, addr.clone());
            peers.push(peer);
        }
    }

    let store = Store::open(
        StoreConfig::new(flags.id, peers, flags.storage_root.clone()),
        Arc::new(TcpTransport::new(addrs)),
    )
    .unwrap_or_else(|e| {
        eprintln!("failed to open store: {e}");
        exit(1);
    });

    let rpc_listener = TcpListener::bind(("0.0.0.0", flags.rpc_port))?;
    let _rpc = transport::serve(rpc_listener, Arc::clone(store.raft_node()))?;

    serve_http(
        ApiContext {
            store,
            peer_url_template: flags.peer_template,
        },
        flags.http_port,
    )
    .await
}
