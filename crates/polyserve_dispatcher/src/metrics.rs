//! Pool and dispatcher counters, plus the snapshot types served on
//! `/_/metrics`, `/_/stats` and the SSE stream.
//!
//! Counters are lock-free atomics with a single logical writer each;
//! snapshots read everything at once.

use polyserve_protocol::WorkerStatus;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Cumulative counters, owned by the pool.
#[derive(Debug, Default)]
pub struct Counters {
    /// Requests that entered the worker stage.
    pub total_requests: AtomicU64,
    /// Terminal non-2xx outcomes (errors and non-2xx app responses).
    pub total_errors: AtomicU64,
    /// Requests short-circuited by a proxy rule.
    pub proxied_requests: AtomicU64,
    /// Worker-stage requests dispatched but not yet accounted on a worker.
    pub pending_requests: AtomicI64,
    pub workers_spawned: AtomicU64,
    pub workers_reaped: AtomicU64,
}

impl Counters {
    #[inline]
    pub fn inc_total_requests(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_total_errors(&self) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_proxied_requests(&self) {
        self.proxied_requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_pending(&self) {
        self.pending_requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn dec_pending(&self) {
        self.pending_requests.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_workers_spawned(&self) {
        self.workers_spawned.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_workers_reaped(&self) {
        self.workers_reaped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of pool-level gauges and counters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMetrics {
    /// Workers currently serving a request.
    pub active_workers: usize,
    /// Workers ready and waiting.
    pub idle_workers: usize,
    pub spawning_workers: usize,
    pub draining_workers: usize,
    pub pending_requests: i64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub proxied_requests: u64,
    pub workers_spawned: u64,
    pub workers_reaped: u64,
    /// Seconds since the pool started.
    pub uptime: u64,
}

/// Per-worker view for `/_/stats`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    /// Milliseconds since the worker was created.
    pub age: u64,
    /// Milliseconds since the worker last finished a request.
    pub idle: u64,
    pub request_count: u64,
    pub status: WorkerStatus,
}

/// The `/_/stats` and SSE payload.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub pool: PoolMetrics,
    pub workers: BTreeMap<String, WorkerStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_roundtrip() {
        let counters = Counters::default();
        counters.inc_total_requests();
        counters.inc_total_requests();
        counters.inc_total_errors();
        counters.inc_pending();
        counters.dec_pending();

        assert_eq!(counters.total_requests.load(Ordering::Relaxed), 2);
        assert_eq!(counters.total_errors.load(Ordering::Relaxed), 1);
        assert_eq!(counters.pending_requests.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let snapshot = PoolMetrics {
            active_workers: 1,
            idle_workers: 2,
            spawning_workers: 0,
            draining_workers: 0,
            pending_requests: 0,
            total_requests: 3,
            total_errors: 0,
            proxied_requests: 0,
            workers_spawned: 3,
            workers_reaped: 0,
            uptime: 10,
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["activeWorkers"], 1);
        assert_eq!(json["idleWorkers"], 2);
        assert_eq!(json["totalRequests"], 3);
        assert_eq!(json["uptime"], 10);
    }
}
