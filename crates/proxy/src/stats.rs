//! Origin statistics and pool counters.
//!
//! All values are plain atomics. They are gauges and counters for
//! observability and admission decisions, not synchronization points;
//! consistency across fields is eventual.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Mutable per-origin gauges. Written by the connection pool, read by the
/// load balancer.
#[derive(Debug, Default)]
pub struct ServerStats {
    open_connections: AtomicI64,
    active_requests: AtomicI64,
    successive_failures: AtomicU64,
    total_failures: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_connections(&self) -> i64 {
        self.open_connections.load(Ordering::Relaxed)
    }

    pub fn inc_open_connections(&self) {
        self.open_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_open_connections(&self) {
        self.open_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_requests(&self) -> i64 {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub fn inc_active_requests(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active_requests(&self) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record one failed connect attempt.
    pub fn note_connect_failure(&self) {
        self.successive_failures.fetch_add(1, Ordering::Relaxed);
        self.total_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn successive_failures(&self) -> u64 {
        self.successive_failures.load(Ordering::Relaxed)
    }

    /// Called by the load balancer once an origin answers again.
    pub fn reset_successive_failures(&self) {
        self.successive_failures.store(0, Ordering::Relaxed);
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            open_connections: self.open_connections(),
            active_requests: self.active_requests(),
            successive_failures: self.successive_failures(),
            total_failures: self.total_failures(),
        }
    }
}

/// Point-in-time copy of [`ServerStats`] for export.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ServerStatsSnapshot {
    pub open_connections: i64,
    pub active_requests: i64,
    pub successive_failures: u64,
    pub total_failures: u64,
}

/// Metric counters for one per-server pool.
#[derive(Debug, Default)]
pub struct PoolCounters {
    request_conn: AtomicU64,
    reuse_conn: AtomicU64,
    create_new_conn: AtomicU64,
    create_conn_succeeded: AtomicU64,
    create_conn_failed: AtomicU64,
    conn_taken_from_pool_not_open: AtomicU64,
    max_conns_per_host_exceeded: AtomicU64,
}

macro_rules! counter {
    ($inc:ident, $get:ident) => {
        pub fn $inc(&self) {
            self.$get.fetch_add(1, Ordering::Relaxed);
        }

        pub fn $get(&self) -> u64 {
            self.$get.load(Ordering::Relaxed)
        }
    };
}

impl PoolCounters {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(inc_request_conn, request_conn);
    counter!(inc_reuse_conn, reuse_conn);
    counter!(inc_create_new_conn, create_new_conn);
    counter!(inc_create_conn_succeeded, create_conn_succeeded);
    counter!(inc_create_conn_failed, create_conn_failed);
    counter!(inc_conn_taken_from_pool_not_open, conn_taken_from_pool_not_open);
    counter!(inc_max_conns_per_host_exceeded, max_conns_per_host_exceeded);

    pub fn snapshot(&self) -> PoolCountersSnapshot {
        PoolCountersSnapshot {
            request_conn: self.request_conn(),
            reuse_conn: self.reuse_conn(),
            create_new_conn: self.create_new_conn(),
            create_conn_succeeded: self.create_conn_succeeded(),
            create_conn_failed: self.create_conn_failed(),
            conn_taken_from_pool_not_open: self.conn_taken_from_pool_not_open(),
            max_conns_per_host_exceeded: self.max_conns_per_host_exceeded(),
        }
    }
}

/// Point-in-time copy of [`PoolCounters`] for export.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolCountersSnapshot {
    pub request_conn: u64,
    pub reuse_conn: u64,
    pub create_new_conn: u64,
    pub create_conn_succeeded: u64,
    pub create_conn_failed: u64,
    pub conn_taken_from_pool_not_open: u64,
    pub max_conns_per_host_exceeded: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_failure_updates_both_counters() {
        let stats = ServerStats::new();
        stats.note_connect_failure();
        stats.note_connect_failure();
        assert_eq!(stats.successive_failures(), 2);
        assert_eq!(stats.total_failures(), 2);

        stats.reset_successive_failures();
        assert_eq!(stats.successive_failures(), 0);
        assert_eq!(stats.total_failures(), 2);
    }

    #[test]
    fn test_gauges_go_up_and_down() {
        let stats = ServerStats::new();
        stats.inc_open_connections();
        stats.inc_open_connections();
        stats.dec_open_connections();
        assert_eq!(stats.open_connections(), 1);
    }

    #[test]
    fn test_counter_snapshot() {
        let counters = PoolCounters::new();
        counters.inc_request_conn();
        counters.inc_reuse_conn();
        counters.inc_request_conn();

        let snap = counters.snapshot();
        assert_eq!(snap.request_conn, 2);
        assert_eq!(snap.reuse_conn, 1);
        assert_eq!(snap.create_new_conn, 0);
    }
}
