//! dbgate - resilient database gateway with circuit breaking and priority scheduling
//!
//! Sits between application code and a relational database reached over an
//! unreliable, rate-limited link. Every logical query either completes
//! against a live connection or fails with a clearly classified error, and
//! in-flight concurrency never exceeds the configured cap.

pub mod config;
pub mod conn;
pub mod core;
pub mod driver;
pub mod error;
pub mod health;
pub mod sched;
pub mod stats;
pub mod testing;

pub use crate::config::Config;
pub use crate::conn::manager::{ConnectionState, SharedConnection};
pub use crate::core::DatabaseGateway;
pub use crate::driver::{ConnectOptions, DatabaseConnection, DatabaseDriver, DriverError};
pub use crate::error::{ErrorClass, GatewayError};
pub use crate::stats::{HealthReport, StatsSnapshot};
