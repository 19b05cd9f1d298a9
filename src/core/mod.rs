//! The gateway shared by all callers
//!
//! One `DatabaseGateway` is constructed at process start and passed by
//! reference — every component (connection manager, breaker, scheduler,
//! retry policy, health monitor, stats) lives inside it; there is no global
//! state.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::conn::circuit::CircuitBreaker;
use crate::conn::manager::{ConnectConfig, ConnectionManager, SharedConnection};
use crate::conn::retry::{RetryConfig, RetryPolicy};
use crate::driver::{ConnectOptions, DatabaseDriver};
use crate::error::{ErrorClass, GatewayError};
use crate::health::{HealthMonitor, HealthMonitorConfig};
use crate::sched::{Scheduler, SchedulerConfig};
use crate::stats::{HealthReport, StatsRegistry, StatsSnapshot};

/// Priority used for health probes so a saturated queue cannot starve them
const PROBE_PRIORITY: i32 = 100;

/// Resilient access point for a single logical database connection
pub struct DatabaseGateway {
    config: Arc<Config>,
    manager: Arc<ConnectionManager>,
    breaker: Arc<CircuitBreaker>,
    scheduler: Scheduler,
    retry: RetryPolicy,
    stats: Arc<StatsRegistry>,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl DatabaseGateway {
    /// Wire every component from the configuration.
    ///
    /// The connection itself is created lazily on first use unless
    /// `gateway.eager_connect` is set and [`DatabaseGateway::init`] is called.
    pub fn new(config: Config, driver: Arc<dyn DatabaseDriver>) -> Self {
        let config = Arc::new(config);

        let connect_config = ConnectConfig {
            url: config.database.url.clone(),
            options: ConnectOptions {
                application_name: config.database.options.get("application_name").cloned(),
                params: config.database.options.clone(),
            },
            connect_timeout: Duration::from_millis(config.database.connect_timeout_ms),
            probe_timeout: Duration::from_millis(config.database.probe_timeout_ms),
            max_attempts: config.database.max_connect_attempts,
            backoff_base: Duration::from_millis(config.database.connect_backoff_base_ms),
            backoff_cap: Duration::from_millis(config.database.connect_backoff_cap_ms),
        };
        let manager = Arc::new(ConnectionManager::new(driver, connect_config));

        let breaker = Arc::new(CircuitBreaker::new(Duration::from_millis(
            config.gateway.circuit_breaker_cooldown_ms,
        )));

        let scheduler = Scheduler::new(SchedulerConfig {
            max_concurrent: config.gateway.max_concurrent,
            queue_timeout: Duration::from_millis(config.gateway.queue_timeout_ms),
            queue_warn_threshold: config.gateway.queue_warn_threshold,
            queue_critical_threshold: config.gateway.queue_critical_threshold,
        });

        let stats = Arc::new(StatsRegistry::new());

        let retry = RetryPolicy::new(
            RetryConfig {
                max_attempts: config.gateway.max_retry_attempts,
                per_attempt_timeout: Duration::from_millis(config.gateway.per_attempt_timeout_ms),
                backoff_base: Duration::from_millis(config.gateway.backoff_base_ms),
                backoff_cap: Duration::from_millis(config.gateway.backoff_cap_ms),
                slow_query_threshold: Duration::from_millis(config.gateway.slow_query_threshold_ms),
            },
            Arc::clone(&manager),
            Arc::clone(&stats),
        );

        let (shutdown_tx, _) = broadcast::channel(1);

        info!(
            url = %config.database.url,
            max_concurrent = config.gateway.max_concurrent,
            "database gateway created"
        );

        Self {
            config,
            manager,
            breaker,
            scheduler,
            retry,
            stats,
            monitor_handle: Mutex::new(None),
            shutdown_tx,
        }
    }

    /// Start the health monitor and, if configured, connect eagerly
    pub async fn init(&self) -> Result<(), GatewayError> {
        if self.config.gateway.eager_connect {
            self.manager.guarantee().await?;
        }

        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&self.manager),
            HealthMonitorConfig {
                enabled: self.config.gateway.health_check_enabled,
                interval: Duration::from_millis(self.config.gateway.health_check_interval_ms),
                grace: Duration::from_millis(self.config.gateway.health_check_grace_ms),
                probe_timeout: Duration::from_millis(self.config.database.probe_timeout_ms),
            },
        ));
        let handle = monitor.start(self.shutdown_tx.subscribe());
        *lock(&self.monitor_handle) = Some(handle);

        info!("database gateway initialized");
        Ok(())
    }

    /// Primary entry point: run `op` against a live connection.
    ///
    /// Higher priority runs sooner; equal priorities run in submission order.
    pub async fn submit<T, F, Fut>(
        &self,
        priority: i32,
        name: &str,
        op: F,
    ) -> Result<T, GatewayError>
    where
        F: Fn(SharedConnection) -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let queue_timeout = Duration::from_millis(self.config.gateway.queue_timeout_ms);
        self.submit_with_timeout(priority, queue_timeout, name, op)
            .await
    }

    /// [`DatabaseGateway::submit`] with an explicit queue timeout
    pub async fn submit_with_timeout<T, F, Fut>(
        &self,
        priority: i32,
        queue_timeout: Duration,
        name: &str,
        op: F,
    ) -> Result<T, GatewayError>
    where
        F: Fn(SharedConnection) -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        // Fail fast during a cooldown without touching the connection.
        if self.breaker.is_open() {
            let retry_after = self.breaker.remaining();
            self.stats.record_rate_limited();
            debug!(
                query = name,
                retry_after_ms = retry_after.as_millis() as u64,
                "submission rejected: circuit breaker open"
            );
            return Err(GatewayError::RateLimitExceeded { retry_after });
        }

        let outcome = self
            .scheduler
            .run_with_timeout(priority, queue_timeout, async {
                let conn = self.manager.guarantee().await?;
                self.retry.execute(name, conn, op).await
            })
            .await;

        match outcome {
            Ok(value) => {
                self.stats.record_executed();
                Ok(value)
            }
            Err(e) if e.class() == ErrorClass::RateLimit => {
                self.breaker.trip();
                self.stats.record_rate_limited();
                self.stats.record_failed();
                let retry_after = self.breaker.remaining();
                warn!(
                    query = name,
                    cooldown_ms = retry_after.as_millis() as u64,
                    "database reported connection limit exceeded, gating new work"
                );
                Err(GatewayError::RateLimitExceeded { retry_after })
            }
            Err(e) => {
                if matches!(e, GatewayError::QueueTimeout { .. }) {
                    self.stats.record_queue_timeout();
                }
                self.stats.record_failed();
                Err(e)
            }
        }
    }

    /// Escape hatch: the live handle, bypassing breaker and scheduler.
    ///
    /// No concurrency accounting or retry applies to whatever the caller
    /// does with it. Use sparingly.
    pub async fn raw_connection(&self) -> Result<SharedConnection, GatewayError> {
        self.manager.guarantee().await
    }

    /// Point-in-time snapshot for the monitoring layer
    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            connection_state: self.manager.state(),
            queue_length: self.scheduler.queue_len(),
            active_count: self.scheduler.active_count(),
            circuit_breaker_open: self.breaker.is_open(),
            cooldown_remaining_ms: self.breaker.remaining().as_millis() as u64,
            total_queries_executed: self.stats.total_executed(),
            total_queries_failed: self.stats.total_failed(),
            total_retries: self.stats.total_retries(),
            total_rate_limited: self.stats.total_rate_limited(),
            total_queue_timeouts: self.stats.total_queue_timeouts(),
        }
    }

    /// Drive a real probe through the full pipeline and report tri-state
    /// health for the external monitoring endpoint
    pub async fn health_check(&self) -> HealthReport {
        if self.breaker.is_open() {
            let remaining = self.breaker.remaining();
            return HealthReport::Cooldown {
                remaining_ms: remaining.as_millis() as u64,
                detail: format!(
                    "rate-limit cooldown active, retry after {}s",
                    remaining.as_secs().max(1)
                ),
            };
        }

        let result = self
            .submit(PROBE_PRIORITY, "health_probe", |conn| async move {
                conn.probe().await.map_err(GatewayError::from)
            })
            .await;

        match result {
            Ok(()) => HealthReport::Healthy {
                detail: "database reachable".to_string(),
            },
            Err(GatewayError::RateLimitExceeded { retry_after }) => HealthReport::Cooldown {
                remaining_ms: retry_after.as_millis() as u64,
                detail: format!(
                    "rate-limit cooldown active, retry after {}s",
                    retry_after.as_secs().max(1)
                ),
            },
            Err(e) => HealthReport::Unhealthy {
                detail: e.to_string(),
            },
        }
    }

    /// Stop new submissions, drain in-flight tasks (bounded), stop the
    /// monitor, and release the connection
    pub async fn shutdown(&self) {
        info!("gateway shutdown requested");
        let _ = self.shutdown_tx.send(());

        self.scheduler
            .shutdown(Duration::from_millis(self.config.gateway.shutdown_grace_ms))
            .await;

        if let Some(handle) = lock(&self.monitor_handle).take() {
            let _ = handle.await;
        }

        self.manager.disconnect().await;
        info!("gateway shutdown complete");
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
