//! Connection lifecycle management with single-flight reconnection
//!
//! Exactly one logical connection handle exists at a time, and at most one
//! (re)connection sequence is ever in flight. Concurrent callers of
//! [`ConnectionManager::guarantee`] during a sequence all receive that one
//! sequence's outcome, so a flapping link never fans out into a stampede of
//! connect attempts.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::driver::{ConnectOptions, DatabaseConnection, DatabaseDriver};
use crate::error::GatewayError;

/// The live handle shared with operations
pub type SharedConnection = Arc<dyn DatabaseConnection>;

type ConnectOutcome = Result<SharedConnection, GatewayError>;

/// Observable lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Settings for (re)connection sequences
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Connection URL, passed opaquely to the driver
    pub url: String,

    /// Options forwarded to the driver
    pub options: ConnectOptions,

    /// Hard timeout for one connect attempt
    pub connect_timeout: Duration,

    /// Timeout for the verification probe (shorter than connect)
    pub probe_timeout: Duration,

    /// Attempts per sequence before failing all waiters
    pub max_attempts: u32,

    /// Base delay between failed attempts
    pub backoff_base: Duration,

    /// Cap on the exponential backoff
    pub backoff_cap: Duration,
}

impl ConnectConfig {
    /// Defaults for the given URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            options: ConnectOptions::default(),
            connect_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(8),
        }
    }
}

enum Phase {
    Disconnected,
    /// A sequence is in flight; waiters subscribe for its outcome
    Connecting(broadcast::Sender<ConnectOutcome>),
    Connected(SharedConnection),
}

/// Owner of the single logical connection handle
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    driver: Arc<dyn DatabaseDriver>,
    config: ConnectConfig,
    phase: Mutex<Phase>,
    consecutive_failures: AtomicU32,
    connect_sequences: AtomicU64,
    last_success: RwLock<Option<Instant>>,
    closed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(driver: Arc<dyn DatabaseDriver>, config: ConnectConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                driver,
                config,
                phase: Mutex::new(Phase::Disconnected),
                consecutive_failures: AtomicU32::new(0),
                connect_sequences: AtomicU64::new(0),
                last_success: RwLock::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Return a live, probed connection handle, (re)connecting if needed.
    ///
    /// If a sequence is already in flight, awaits its shared outcome instead
    /// of starting a second one. The sequence itself runs on a spawned task,
    /// so it completes even if every waiter is cancelled.
    pub async fn guarantee(&self) -> Result<SharedConnection, GatewayError> {
        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(GatewayError::ShutdownInProgress);
            }

            enum Action {
                Ready(SharedConnection),
                Wait(broadcast::Receiver<ConnectOutcome>),
                Fly(broadcast::Receiver<ConnectOutcome>),
            }

            let action = {
                let mut phase = self.inner.lock_phase();
                match &*phase {
                    Phase::Connected(conn) => Action::Ready(Arc::clone(conn)),
                    Phase::Connecting(tx) => Action::Wait(tx.subscribe()),
                    Phase::Disconnected => {
                        let (tx, rx) = broadcast::channel(1);
                        *phase = Phase::Connecting(tx.clone());
                        let inner = Arc::clone(&self.inner);
                        tokio::spawn(async move {
                            let outcome = inner.run_connect_sequence().await;
                            inner.publish_outcome(&tx, outcome);
                        });
                        Action::Fly(rx)
                    }
                }
            };

            match action {
                Action::Ready(conn) => {
                    // Cheap liveness check before handing the handle out.
                    match timeout(self.inner.config.probe_timeout, conn.probe()).await {
                        Ok(Ok(())) => return Ok(conn),
                        Ok(Err(e)) => {
                            debug!(error = %e, "cached connection failed liveness probe");
                        }
                        Err(_) => {
                            debug!("liveness probe timed out on cached connection");
                        }
                    }
                    self.invalidate();
                    // Fall through: the next iteration starts a fresh sequence.
                }
                Action::Wait(mut rx) | Action::Fly(mut rx) => {
                    return match rx.recv().await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(GatewayError::NotYetConnected),
                    };
                }
            }
        }
    }

    /// Drop the current handle so the next caller reconnects cleanly.
    ///
    /// Has no effect while a connection sequence is in flight — an attempt
    /// is never interrupted.
    pub fn invalidate(&self) {
        let mut phase = self.inner.lock_phase();
        if matches!(&*phase, Phase::Connecting(_)) {
            debug!("invalidate ignored: connection attempt in flight");
            return;
        }
        if let Phase::Connected(conn) = std::mem::replace(&mut *phase, Phase::Disconnected) {
            drop(phase);
            warn!("connection invalidated; next caller will reconnect");
            dispose(conn);
        }
    }

    /// Current handle without a probe, if one exists
    pub fn current(&self) -> Option<SharedConnection> {
        match &*self.inner.lock_phase() {
            Phase::Connected(conn) => Some(Arc::clone(conn)),
            _ => None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        match &*self.inner.lock_phase() {
            Phase::Disconnected => ConnectionState::Disconnected,
            Phase::Connecting(_) => ConnectionState::Connecting,
            Phase::Connected(_) => ConnectionState::Connected,
        }
    }

    /// Record successful query activity (consulted by the health monitor)
    pub fn note_success(&self) {
        if let Ok(mut last) = self.inner.last_success.write() {
            *last = Some(Instant::now());
        }
    }

    pub fn last_success(&self) -> Option<Instant> {
        self.inner.last_success.read().ok().and_then(|last| *last)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Number of connect sequences started since construction
    pub fn connect_sequences(&self) -> u64 {
        self.inner.connect_sequences.load(Ordering::Relaxed)
    }

    /// Release the connection and refuse further `guarantee()` calls
    pub async fn disconnect(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let conn = {
            let mut phase = self.inner.lock_phase();
            if matches!(&*phase, Phase::Connecting(_)) {
                // The in-flight sequence sees `closed` and disposes its result.
                None
            } else if let Phase::Connected(conn) =
                std::mem::replace(&mut *phase, Phase::Disconnected)
            {
                Some(conn)
            } else {
                None
            }
        };
        if let Some(conn) = conn {
            if let Err(e) = conn.disconnect().await {
                debug!(error = %e, "error while releasing connection");
            }
            info!("database connection released");
        }
    }
}

impl ManagerInner {
    fn lock_phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Transition out of Connecting and wake every waiter with the outcome
    fn publish_outcome(&self, tx: &broadcast::Sender<ConnectOutcome>, outcome: ConnectOutcome) {
        let mut phase = self.lock_phase();
        if self.closed.load(Ordering::Acquire) {
            *phase = Phase::Disconnected;
            drop(phase);
            if let Ok(conn) = &outcome {
                dispose(Arc::clone(conn));
            }
            let _ = tx.send(Err(GatewayError::ShutdownInProgress));
            return;
        }
        *phase = match &outcome {
            Ok(conn) => Phase::Connected(Arc::clone(conn)),
            Err(_) => Phase::Disconnected,
        };
        drop(phase);
        let _ = tx.send(outcome);
    }

    async fn run_connect_sequence(&self) -> ConnectOutcome {
        self.connect_sequences.fetch_add(1, Ordering::Relaxed);
        let mut backoff = self.config.backoff_base;
        let mut last_err = GatewayError::NotYetConnected;

        for attempt in 1..=self.config.max_attempts {
            match self.try_connect_once(attempt).await {
                Ok(conn) => {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    info!(attempt, "database connection established");
                    return Ok(conn);
                }
                Err(e) => {
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        attempt,
                        consecutive_failures = failures,
                        error = %e,
                        "connection attempt failed"
                    );
                    last_err = e;
                    if attempt < self.config.max_attempts {
                        sleep(backoff).await;
                        backoff = (backoff * 2).min(self.config.backoff_cap);
                    }
                }
            }
        }

        error!(
            attempts = self.config.max_attempts,
            error = %last_err,
            "unable to establish database connection"
        );
        Err(last_err)
    }

    async fn try_connect_once(&self, attempt: u32) -> ConnectOutcome {
        debug!(attempt, url = %self.config.url, "connecting to database");

        let conn = match timeout(
            self.config.connect_timeout,
            self.driver.connect(&self.config.url, &self.config.options),
        )
        .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(GatewayError::ConnectTimeout {
                    elapsed_ms: self.config.connect_timeout.as_millis() as u64,
                })
            }
        };

        // Verify with a separate, shorter-timeout probe before publishing.
        match timeout(self.config.probe_timeout, conn.probe()).await {
            Ok(Ok(())) => Ok(conn),
            Ok(Err(e)) => {
                dispose(conn);
                Err(GatewayError::ProbeFailed {
                    detail: e.to_string(),
                })
            }
            Err(_) => {
                dispose(conn);
                Err(GatewayError::ProbeFailed {
                    detail: format!(
                        "probe timed out after {}ms",
                        self.config.probe_timeout.as_millis()
                    ),
                })
            }
        }
    }
}

/// Best-effort async disposal of a dead or half-built handle
fn dispose(conn: SharedConnection) {
    tokio::spawn(async move {
        let _ = conn.disconnect().await;
    });
}
