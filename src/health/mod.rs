//! Background connection health monitoring
//!
//! A fixed-interval task that probes the live connection and invalidates it
//! on failure, so the next caller reconnects cleanly instead of discovering
//! breakage mid-request. Probes are skipped while real query traffic is
//! succeeding.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::conn::manager::ConnectionManager;

/// Health monitor configuration
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// Whether the background task runs at all
    pub enabled: bool,

    /// Interval between probes
    pub interval: Duration,

    /// Skip the probe if a query succeeded this recently
    pub grace: Duration,

    /// Timeout for the probe itself
    pub probe_timeout: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            grace: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

/// Periodically verifies the managed connection is still live
pub struct HealthMonitor {
    manager: Arc<ConnectionManager>,
    config: HealthMonitorConfig,
}

impl HealthMonitor {
    pub fn new(manager: Arc<ConnectionManager>, config: HealthMonitorConfig) -> Self {
        Self { manager, config }
    }

    /// Start the background task; it exits on the shutdown signal
    pub fn start(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !self.config.enabled {
                info!("health monitor disabled");
                return;
            }

            info!(
                interval_ms = self.config.interval.as_millis() as u64,
                "health monitor started"
            );

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("health monitor stopping");
                        return;
                    }
                    _ = sleep(self.config.interval) => {}
                }

                if let Some(last) = self.manager.last_success() {
                    if last.elapsed() < self.config.grace {
                        debug!("recent query activity, skipping health probe");
                        continue;
                    }
                }

                self.check_once().await;
            }
        })
    }

    /// Probe the live connection once; invalidate it on failure
    pub async fn check_once(&self) {
        let Some(conn) = self.manager.current() else {
            debug!("no live connection, nothing to probe");
            return;
        };

        let started = Instant::now();
        match timeout(self.config.probe_timeout, conn.probe()).await {
            Ok(Ok(())) => {
                debug!(
                    latency_ms = started.elapsed().as_millis() as u64,
                    "health probe ok"
                );
            }
            Ok(Err(e)) => {
                warn!(error = %e, "health probe failed, invalidating connection");
                self.manager.invalidate();
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.probe_timeout.as_millis() as u64,
                    "health probe timed out, invalidating connection"
                );
                self.manager.invalidate();
            }
        }
    }
}
