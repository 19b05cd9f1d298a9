//! Error taxonomy for the gateway
//!
//! Every failure surfaced by this crate is one of these variants, so callers
//! can branch on classification instead of string-matching driver messages.

use std::time::Duration;

use crate::driver::DriverError;

/// Errors produced by the gateway pipeline
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// No live connection exists yet and none could be provided in time
    #[error("not yet connected to the database")]
    NotYetConnected,

    #[error("timed out establishing a connection after {elapsed_ms}ms")]
    ConnectTimeout { elapsed_ms: u64 },

    /// The post-connect liveness probe failed or timed out
    #[error("connection probe failed: {detail}")]
    ProbeFailed { detail: String },

    /// A single query attempt exceeded its execution timeout
    #[error("query '{name}' timed out after {elapsed_ms}ms (attempt {attempt})")]
    QueryTimeout {
        name: String,
        attempt: u32,
        elapsed_ms: u64,
    },

    #[error("transient network failure: {detail}")]
    TransientNetwork { detail: String },

    /// The database reported its connection limit; the circuit breaker is
    /// (or is about to be) open for the cooldown window
    #[error("database connection limit exceeded; retry after {}s", .retry_after.as_secs())]
    RateLimitExceeded { retry_after: Duration },

    /// The task waited in the queue past its deadline and never started
    #[error("task waited {}ms in the queue without starting", .waited.as_millis())]
    QueueTimeout { waited: Duration },

    /// Constraint violation, syntax error, permission error — never retried
    #[error("fatal query error: {detail}")]
    FatalQuery { detail: String },

    #[error("gateway is shutting down")]
    ShutdownInProgress,

    /// All retry attempts were consumed; wraps the last attempt's error
    #[error("query '{name}' failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        name: String,
        attempts: u32,
        #[source]
        source: Box<GatewayError>,
    },
}

/// How the retry policy and circuit breaker treat an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Invalidate the connection, back off, try again
    Retryable,
    /// Trips the circuit breaker; surfaces immediately, never retried
    RateLimit,
    /// Surfaces immediately, never retried
    Fatal,
}

impl GatewayError {
    /// Classify this error for retry/breaker decisions
    pub fn class(&self) -> ErrorClass {
        match self {
            GatewayError::NotYetConnected
            | GatewayError::ConnectTimeout { .. }
            | GatewayError::ProbeFailed { .. }
            | GatewayError::QueryTimeout { .. }
            | GatewayError::TransientNetwork { .. } => ErrorClass::Retryable,
            GatewayError::RateLimitExceeded { .. } => ErrorClass::RateLimit,
            GatewayError::QueueTimeout { .. }
            | GatewayError::FatalQuery { .. }
            | GatewayError::ShutdownInProgress
            | GatewayError::RetriesExhausted { .. } => ErrorClass::Fatal,
        }
    }

    /// Whether the retry policy may run another attempt after this error
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}

impl From<DriverError> for GatewayError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::ConnectionLimit(_) => GatewayError::RateLimitExceeded {
                // The breaker fills in the real cooldown when it trips.
                retry_after: Duration::ZERO,
            },
            DriverError::NotConnected(_) => GatewayError::NotYetConnected,
            // Driver-level timeouts classify with the transient family: the
            // caller contract is binary ready/not-ready.
            DriverError::Timeout(detail) => GatewayError::TransientNetwork { detail },
            DriverError::TransientNetwork(detail) => GatewayError::TransientNetwork { detail },
            DriverError::Fatal(detail) => GatewayError::FatalQuery { detail },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(GatewayError::NotYetConnected.is_retryable());
        assert!(GatewayError::ConnectTimeout { elapsed_ms: 10_000 }.is_retryable());
        assert!(GatewayError::TransientNetwork {
            detail: "connection reset by peer".to_string()
        }
        .is_retryable());
        assert!(GatewayError::QueryTimeout {
            name: "list_users".to_string(),
            attempt: 1,
            elapsed_ms: 15_000,
        }
        .is_retryable());
    }

    #[test]
    fn test_fatal_classification() {
        assert_eq!(
            GatewayError::FatalQuery {
                detail: "syntax error at or near SELEC".to_string()
            }
            .class(),
            ErrorClass::Fatal
        );
        assert_eq!(GatewayError::ShutdownInProgress.class(), ErrorClass::Fatal);
        assert_eq!(
            GatewayError::QueueTimeout {
                waited: Duration::from_millis(50)
            }
            .class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn test_rate_limit_classification() {
        let err = GatewayError::RateLimitExceeded {
            retry_after: Duration::from_secs(60),
        };
        assert_eq!(err.class(), ErrorClass::RateLimit);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_exhaustion_wraps_last_error() {
        let err = GatewayError::RetriesExhausted {
            name: "load_report".to_string(),
            attempts: 3,
            source: Box::new(GatewayError::TransientNetwork {
                detail: "broken pipe".to_string(),
            }),
        };
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert!(err.to_string().contains("after 3 attempts"));
        assert!(err.to_string().contains("broken pipe"));
    }

    #[test]
    fn test_driver_error_mapping() {
        let mapped: GatewayError =
            DriverError::ConnectionLimit("too many connections".to_string()).into();
        assert_eq!(mapped.class(), ErrorClass::RateLimit);

        let mapped: GatewayError = DriverError::Fatal("permission denied".to_string()).into();
        assert_eq!(mapped.class(), ErrorClass::Fatal);

        let mapped: GatewayError = DriverError::Timeout("statement timeout".to_string()).into();
        assert!(mapped.is_retryable());
    }
}
