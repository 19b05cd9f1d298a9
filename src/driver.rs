//! Protocol-agnostic driver seam
//!
//! The gateway never speaks a wire protocol itself. It requires only that
//! the driver can open a connection, answer a cheap liveness probe, close,
//! and surface distinguishable error signals so the classifier in
//! [`crate::error`] can branch correctly.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

/// Errors a driver implementation must distinguish between
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    /// The database refused the connection because its own cap is reached
    #[error("connection limit exceeded: {0}")]
    ConnectionLimit(String),

    /// The handle is not (or no longer) connected
    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("driver operation timed out: {0}")]
    Timeout(String),

    /// Resets, broken pipes, and other recoverable link failures
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    /// Constraint violations, syntax errors, permission errors
    #[error("fatal database error: {0}")]
    Fatal(String),
}

/// Options forwarded verbatim to [`DatabaseDriver::connect`]
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Reported to the server where the protocol supports it
    pub application_name: Option<String>,
    /// Driver-specific key/value parameters
    pub params: HashMap<String, String>,
}

/// Factory for logical connections
#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    /// Open a new connection to `url`.
    ///
    /// The gateway enforces its own connect timeout around this call; the
    /// driver does not need one of its own.
    async fn connect(
        &self,
        url: &str,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn DatabaseConnection>, DriverError>;
}

/// A live logical connection handle
///
/// Deliberately has no `cancel()`: a query abandoned on timeout may still
/// complete server-side. That matches the documented caller contract.
#[async_trait]
pub trait DatabaseConnection: Send + Sync {
    /// Cheap no-op statement verifying the connection is live
    async fn probe(&self) -> Result<(), DriverError>;

    /// Release the connection gracefully
    async fn disconnect(&self) -> Result<(), DriverError>;
}
