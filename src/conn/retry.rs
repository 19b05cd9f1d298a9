//! Retry policy: per-attempt timeouts, classification, capped backoff
//!
//! Wraps one logical query. Retryable failures invalidate the connection and
//! back off with jitter; fatal and rate-limit failures propagate untouched.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::conn::manager::{ConnectionManager, SharedConnection};
use crate::error::GatewayError;
use crate::stats::StatsRegistry;

/// Retry tunables
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts before giving up on retryable errors
    pub max_attempts: u32,

    /// Hard execution timeout per attempt
    pub per_attempt_timeout: Duration,

    /// Base delay before the second attempt
    pub backoff_base: Duration,

    /// Cap on the exponential backoff
    pub backoff_cap: Duration,

    /// Successful queries slower than this are logged
    pub slow_query_threshold: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            per_attempt_timeout: Duration::from_secs(15),
            backoff_base: Duration::from_millis(200),
            backoff_cap: Duration::from_secs(5),
            slow_query_threshold: Duration::from_secs(1),
        }
    }
}

/// Executes operations against the managed connection with retries
pub struct RetryPolicy {
    config: RetryConfig,
    manager: Arc<ConnectionManager>,
    stats: Arc<StatsRegistry>,
}

impl RetryPolicy {
    pub fn new(
        config: RetryConfig,
        manager: Arc<ConnectionManager>,
        stats: Arc<StatsRegistry>,
    ) -> Self {
        Self {
            config,
            manager,
            stats,
        }
    }

    /// Run `op` until it succeeds, fails fatally, or attempts run out.
    ///
    /// The caller supplies the first connection handle (already guaranteed);
    /// later attempts re-guarantee so they run against a fresh handle.
    ///
    /// An attempt abandoned on timeout stops being polled locally, but no
    /// cancel is sent to the server — it may still complete there.
    pub async fn execute<T, F, Fut>(
        &self,
        name: &str,
        conn: SharedConnection,
        op: F,
    ) -> Result<T, GatewayError>
    where
        F: Fn(SharedConnection) -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut conn = conn;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if attempt > 1 {
                self.stats.record_retry();
                conn = self.manager.guarantee().await?;
            }

            let started = Instant::now();
            let result = match timeout(self.config.per_attempt_timeout, op(Arc::clone(&conn))).await
            {
                Ok(result) => result,
                Err(_) => Err(GatewayError::QueryTimeout {
                    name: name.to_string(),
                    attempt,
                    elapsed_ms: self.config.per_attempt_timeout.as_millis() as u64,
                }),
            };

            match result {
                Ok(value) => {
                    let elapsed = started.elapsed();
                    self.manager.note_success();
                    if attempt > 1 {
                        info!(query = name, attempt, "query succeeded after retry");
                    }
                    if elapsed >= self.config.slow_query_threshold {
                        warn!(
                            query = name,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "slow query"
                        );
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => {
                    self.manager.invalidate();
                    if attempt >= self.config.max_attempts {
                        warn!(query = name, attempts = attempt, error = %e, "retries exhausted");
                        return Err(GatewayError::RetriesExhausted {
                            name: name.to_string(),
                            attempts: attempt,
                            source: Box::new(e),
                        });
                    }
                    let delay = self.backoff_delay(attempt);
                    debug!(
                        query = name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, backing off"
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// `min(base · 2^(attempt−1), cap)` with ±25% jitter
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self
            .config
            .backoff_base
            .saturating_mul(2u32.saturating_pow(exp));
        let capped = raw.min(self.config.backoff_cap);
        let factor = rand::thread_rng().gen_range(0.75..=1.25);
        capped.mul_f64(factor)
    }
}
