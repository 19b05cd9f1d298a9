//! Test support: a scriptable in-memory driver
//!
//! Used by this crate's unit and integration tests. Kept public so
//! applications can exercise their own wiring without a real database.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::driver::{ConnectOptions, DatabaseConnection, DatabaseDriver, DriverError};

/// In-memory driver with scriptable failures and call counters
#[derive(Clone)]
pub struct MockDriver {
    inner: Arc<MockDriverInner>,
}

struct MockDriverInner {
    connect_calls: AtomicU64,
    probe_calls: AtomicU64,
    disconnect_calls: AtomicU64,
    next_id: AtomicU64,
    connect_delay: Mutex<Duration>,
    /// Errors returned by upcoming `connect()` calls, in order
    connect_script: Mutex<VecDeque<DriverError>>,
    /// When false, every probe on every live connection fails
    probe_healthy: AtomicBool,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockDriverInner {
                connect_calls: AtomicU64::new(0),
                probe_calls: AtomicU64::new(0),
                disconnect_calls: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
                connect_delay: Mutex::new(Duration::ZERO),
                connect_script: Mutex::new(VecDeque::new()),
                probe_healthy: AtomicBool::new(true),
            }),
        }
    }

    /// Delay every `connect()` call, e.g. to widen single-flight race windows
    pub fn set_connect_delay(&self, delay: Duration) {
        *lock(&self.inner.connect_delay) = delay;
    }

    /// Queue errors for the next `connect()` calls; later calls succeed again
    pub fn fail_next_connects<I>(&self, errors: I)
    where
        I: IntoIterator<Item = DriverError>,
    {
        lock(&self.inner.connect_script).extend(errors);
    }

    /// Control whether probes on live connections succeed
    pub fn set_probe_healthy(&self, healthy: bool) {
        self.inner.probe_healthy.store(healthy, Ordering::Release);
    }

    pub fn connect_calls(&self) -> u64 {
        self.inner.connect_calls.load(Ordering::Relaxed)
    }

    pub fn probe_calls(&self) -> u64 {
        self.inner.probe_calls.load(Ordering::Relaxed)
    }

    pub fn disconnect_calls(&self) -> u64 {
        self.inner.disconnect_calls.load(Ordering::Relaxed)
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatabaseDriver for MockDriver {
    async fn connect(
        &self,
        _url: &str,
        _options: &ConnectOptions,
    ) -> Result<Arc<dyn DatabaseConnection>, DriverError> {
        self.inner.connect_calls.fetch_add(1, Ordering::Relaxed);

        let delay = *lock(&self.inner.connect_delay);
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = lock(&self.inner.connect_script).pop_front() {
            return Err(err);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(MockConnection {
            id,
            driver: Arc::clone(&self.inner),
        }))
    }
}

/// Connection handle produced by [`MockDriver`]
pub struct MockConnection {
    id: u64,
    driver: Arc<MockDriverInner>,
}

impl MockConnection {
    /// Stable identifier, unique per connect call
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl DatabaseConnection for MockConnection {
    async fn probe(&self) -> Result<(), DriverError> {
        self.driver.probe_calls.fetch_add(1, Ordering::Relaxed);
        if self.driver.probe_healthy.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(DriverError::NotConnected("probe failed".to_string()))
        }
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        self.driver.disconnect_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_connect_failures() {
        let driver = MockDriver::new();
        driver.fail_next_connects([DriverError::TransientNetwork("reset".to_string())]);

        let first = driver.connect("mock://db", &ConnectOptions::default()).await;
        assert!(first.is_err());

        let second = driver.connect("mock://db", &ConnectOptions::default()).await;
        assert!(second.is_ok());
        assert_eq!(driver.connect_calls(), 2);
    }

    #[tokio::test]
    async fn test_probe_health_toggle() {
        let driver = MockDriver::new();
        let conn = driver
            .connect("mock://db", &ConnectOptions::default())
            .await
            .unwrap();

        assert!(conn.probe().await.is_ok());

        driver.set_probe_healthy(false);
        assert!(conn.probe().await.is_err());
        assert_eq!(driver.probe_calls(), 2);
    }
}
