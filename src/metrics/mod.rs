//! Operation counters and Prometheus text rendering.
//!
//! Plain `AtomicU64` counters with relaxed ordering — observability wants
//! cheap eventual consistency, not synchronization. The frontend's
//! `GET /metrics` renders them in the Prometheus text exposition format
//! together with a point-in-time snapshot of engine and consensus state.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::engine::EngineStats;
use crate::raft::{RaftStatus, Role};

/// Shared counters for one node.
#[derive(Debug)]
pub struct Metrics {
    /// Committed put commands applied to the local engine.
    pub puts_applied: AtomicU64,
    /// Committed delete commands applied to the local engine.
    pub deletes_applied: AtomicU64,
    /// Local reads served.
    pub gets: AtomicU64,
    /// Proposals rejected because this node is not the leader.
    pub not_leader: AtomicU64,
    /// Proposals whose waiter timed out.
    pub proposal_timeouts: AtomicU64,
    /// Applier retries caused by write stalls.
    pub stall_retries: AtomicU64,
    /// HTTP requests by endpoint.
    pub http_get: AtomicU64,
    pub http_put: AtomicU64,
    pub http_delete: AtomicU64,
    started: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// All counters at zero, uptime clock started.
    pub fn new() -> Self {
        Self {
            puts_applied: AtomicU64::new(0),
            deletes_applied: AtomicU64::new(0),
            gets: AtomicU64::new(0),
            not_leader: AtomicU64::new(0),
            proposal_timeouts: AtomicU64::new(0),
            stall_retries: AtomicU64::new(0),
            http_get: AtomicU64::new(0),
            http_put: AtomicU64::new(0),
            http_delete: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// Bump a counter.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Renders everything in Prometheus text exposition format.
    pub fn render(&self, engine: &EngineStats, raft: &RaftStatus) -> String {
        let mut out = String::new();
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        let counters: [(&str, &str, u64); 9] = [
            ("sisyphus_puts_applied_total", "Committed puts applied locally", load(&self.puts_applied)),
            ("sisyphus_deletes_applied_total", "Committed deletes applied locally", load(&self.deletes_applied)),
            ("sisyphus_gets_total", "Local reads served", load(&self.gets)),
            ("sisyphus_not_leader_total", "Proposals rejected as non-leader", load(&self.not_leader)),
            ("sisyphus_proposal_timeouts_total", "Proposals that timed out waiting for apply", load(&self.proposal_timeouts)),
            ("sisyphus_stall_retries_total", "Applier retries due to write stalls", load(&self.stall_retries)),
            ("sisyphus_http_get_total", "HTTP GET /get requests", load(&self.http_get)),
            ("sisyphus_http_put_total", "HTTP PUT /put requests", load(&self.http_put)),
            ("sisyphus_http_delete_total", "HTTP DELETE /delete requests", load(&self.http_delete)),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {value}");
        }

        let gauges: [(&str, &str, u64); 9] = [
            ("sisyphus_engine_sstables", "SSTables on disk", engine.sstable_count as u64),
            ("sisyphus_engine_flushes_total", "Memtable flushes", engine.flushes),
            ("sisyphus_engine_compactions_total", "Compaction runs", engine.compactions),
            ("sisyphus_engine_write_stalls_total", "Writes rejected by stall", engine.write_stalls),
            ("sisyphus_raft_term", "Current consensus term", raft.term),
            ("sisyphus_raft_commit_index", "Highest committed log index", raft.commit_index),
            ("sisyphus_raft_last_applied", "Highest applied log index", raft.last_applied),
            ("sisyphus_raft_is_leader", "1 when this node leads", u64::from(raft.role == Role::Leader)),
            ("sisyphus_uptime_seconds", "Seconds since the node started", self.started.elapsed().as_secs()),
        ];
        for (name, help, value) in gauges {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} gauge");
            let _ = writeln!(out, "{name} {value}");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::RaftStatus;

    fn sample_status() -> RaftStatus {
        RaftStatus {
            term: 3,
            role: Role::Leader,
            leader: Some(0),
            commit_index: 7,
            last_applied: 7,
            last_log_index: 7,
        }
    }

    #[test]
    fn test_render_contains_all_series() {
        let metrics = Metrics::new();
        Metrics::inc(&metrics.gets);
        Metrics::inc(&metrics.gets);

        let engine = EngineStats {
            frozen_pending: false,
            sstable_count: 2,
            flushes: 4,
            compactions: 1,
            write_stalls: 0,
        };
        let text = metrics.render(&engine, &sample_status());

        assert!(text.contains("sisyphus_gets_total 2"));
        assert!(text.contains("sisyphus_engine_sstables 2"));
        assert!(text.contains("sisyphus_raft_is_leader 1"));
        assert!(text.contains("# TYPE sisyphus_raft_term gauge"));
    }
}
