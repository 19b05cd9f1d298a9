//! Counters and snapshots for the monitoring layer

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::conn::manager::ConnectionState;

/// Lock-free gateway counters
#[derive(Debug, Default)]
pub struct StatsRegistry {
    total_executed: AtomicU64,
    total_failed: AtomicU64,
    total_retries: AtomicU64,
    total_rate_limited: AtomicU64,
    total_queue_timeouts: AtomicU64,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_executed(&self) {
        self.total_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.total_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.total_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.total_rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_timeout(&self) {
        self.total_queue_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_executed(&self) -> u64 {
        self.total_executed.load(Ordering::Relaxed)
    }

    pub fn total_failed(&self) -> u64 {
        self.total_failed.load(Ordering::Relaxed)
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn total_rate_limited(&self) -> u64 {
        self.total_rate_limited.load(Ordering::Relaxed)
    }

    pub fn total_queue_timeouts(&self) -> u64 {
        self.total_queue_timeouts.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of the gateway, assembled by
/// [`crate::core::DatabaseGateway::stats`]
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub connection_state: ConnectionState,
    pub queue_length: usize,
    pub active_count: usize,
    pub circuit_breaker_open: bool,
    pub cooldown_remaining_ms: u64,
    pub total_queries_executed: u64,
    pub total_queries_failed: u64,
    pub total_retries: u64,
    pub total_rate_limited: u64,
    pub total_queue_timeouts: u64,
}

/// Tri-state health report for the external monitoring layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum HealthReport {
    Healthy { detail: String },
    Cooldown { remaining_ms: u64, detail: String },
    Unhealthy { detail: String },
}
