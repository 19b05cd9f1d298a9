//! End-to-end tests of the gateway pipeline
//!
//! These drive the public `DatabaseGateway` surface against the in-memory
//! mock driver and verify the scheduling, single-flight, breaker, and retry
//! behavior callers depend on.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dbgate::driver::DriverError;
use dbgate::stats::HealthReport;
use dbgate::testing::MockDriver;
use dbgate::{Config, ConnectionState, DatabaseGateway, GatewayError};

fn test_config(max_concurrent: usize) -> Config {
    let mut config = Config::new("mock://primary");
    config.gateway.max_concurrent = max_concurrent;
    config.gateway.queue_timeout_ms = 2_000;
    config.gateway.per_attempt_timeout_ms = 1_000;
    config.gateway.max_retry_attempts = 3;
    config.gateway.backoff_base_ms = 5;
    config.gateway.backoff_cap_ms = 20;
    config.gateway.circuit_breaker_cooldown_ms = 300;
    config.gateway.health_check_enabled = false;
    config.gateway.shutdown_grace_ms = 2_000;
    config.database.connect_backoff_base_ms = 5;
    config.database.connect_backoff_cap_ms = 20;
    config
}

#[tokio::test]
async fn test_peak_concurrency_and_batching() {
    let driver = MockDriver::new();
    let gateway = Arc::new(DatabaseGateway::new(test_config(10), Arc::new(driver)));

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();

    let mut handles = Vec::new();
    for i in 0..25 {
        let gateway = Arc::clone(&gateway);
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        handles.push(tokio::spawn(async move {
            gateway
                .submit(0, &format!("op_{i}"), |_conn| {
                    let current = Arc::clone(&current);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    let elapsed = started.elapsed();
    // 25 tasks of 20ms at concurrency 10 is ~3 batches, nowhere near serial.
    assert!(peak.load(Ordering::SeqCst) <= 10);
    assert!(elapsed >= Duration::from_millis(60), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(400), "elapsed {elapsed:?}");

    let snapshot = gateway.stats();
    assert_eq!(snapshot.total_queries_executed, 25);
    assert_eq!(snapshot.active_count, 0);
}

#[tokio::test]
async fn test_concurrent_submissions_share_one_connect_sequence() {
    let driver = MockDriver::new();
    driver.set_connect_delay(Duration::from_millis(50));
    let gateway = Arc::new(DatabaseGateway::new(
        test_config(10),
        Arc::new(driver.clone()),
    ));

    let mut handles = Vec::new();
    for i in 0..8 {
        let gateway = Arc::clone(&gateway);
        handles.push(tokio::spawn(async move {
            gateway
                .submit(0, &format!("op_{i}"), |_conn| async { Ok(()) })
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    assert_eq!(driver.connect_calls(), 1);
}

#[tokio::test]
async fn test_breaker_cooldown_blocks_and_then_clears() {
    let driver = MockDriver::new();
    let gateway = DatabaseGateway::new(test_config(4), Arc::new(driver.clone()));

    // Warm up a connection, then report a rate limit.
    gateway
        .submit(0, "warmup", |_conn| async { Ok(()) })
        .await
        .unwrap();

    let tripped_at = Instant::now();
    let result: Result<(), _> = gateway
        .submit(0, "burst", |_conn| async {
            Err(GatewayError::RateLimitExceeded {
                retry_after: Duration::ZERO,
            })
        })
        .await;
    assert!(matches!(
        result,
        Err(GatewayError::RateLimitExceeded { .. })
    ));

    // During the cooldown: fail fast, operations never run, driver untouched.
    let connects_before = driver.connect_calls();
    let probes_before = driver.probe_calls();
    let ran = Arc::new(AtomicU32::new(0));

    while tripped_at.elapsed() < Duration::from_millis(200) {
        let ran = Arc::clone(&ran);
        let result: Result<(), _> = gateway
            .submit(0, "blocked", move |_conn| {
                let ran = Arc::clone(&ran);
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        match result {
            Err(GatewayError::RateLimitExceeded { retry_after }) => {
                assert!(retry_after > Duration::ZERO);
            }
            other => panic!("expected cooldown rejection, got {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
    }

    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(driver.connect_calls(), connects_before);
    assert_eq!(driver.probe_calls(), probes_before);

    // After the cooldown, submissions proceed normally again.
    tokio::time::sleep(Duration::from_millis(150)).await;
    gateway
        .submit(0, "after_cooldown", |_conn| async { Ok(()) })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_priority_bands_with_fifo_ties() {
    let driver = MockDriver::new();
    let gateway = Arc::new(DatabaseGateway::new(test_config(1), Arc::new(driver)));

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    // Occupy the single slot so the next submissions must queue.
    let blocker = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            gateway
                .submit(0, "blocker", |_conn| async {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok(())
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut handles = Vec::new();
    for (label, priority) in [("a", 1), ("b", 5), ("c", 1)] {
        let gateway = Arc::clone(&gateway);
        let order = Arc::clone(&order);
        handles.push(tokio::spawn(async move {
            gateway
                .submit(priority, label, move |_conn| {
                    let order = Arc::clone(&order);
                    async move {
                        order.lock().unwrap().push(label);
                        Ok(())
                    }
                })
                .await
        }));
        // Deterministic submission order
        tokio::time::sleep(Duration::from_millis(40)).await;
    }

    blocker.await.unwrap().unwrap();
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    assert_eq!(*order.lock().unwrap(), vec!["b", "a", "c"]);
}

#[tokio::test]
async fn test_queue_timeout_never_starts_the_operation() {
    let driver = MockDriver::new();
    let gateway = Arc::new(DatabaseGateway::new(test_config(1), Arc::new(driver)));

    let blocker = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            gateway
                .submit(0, "blocker", |_conn| async {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    Ok(())
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    let ran = Arc::new(AtomicU32::new(0));
    let ran_clone = Arc::clone(&ran);
    let result: Result<(), _> = gateway
        .submit_with_timeout(0, Duration::from_millis(50), "doomed", move |_conn| {
            let ran = Arc::clone(&ran_clone);
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

    assert!(matches!(result, Err(GatewayError::QueueTimeout { .. })));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(gateway.stats().total_queue_timeouts, 1);

    blocker.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_transient_failures_are_invisible_when_retries_suffice() {
    let driver = MockDriver::new();
    let gateway = DatabaseGateway::new(test_config(4), Arc::new(driver.clone()));

    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_clone = Arc::clone(&attempts);
    let result = gateway
        .submit(0, "flaky", move |_conn| {
            let attempts = Arc::clone(&attempts_clone);
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(GatewayError::TransientNetwork {
                        detail: "connection reset".to_string(),
                    })
                } else {
                    Ok("result")
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), "result");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let snapshot = gateway.stats();
    assert_eq!(snapshot.total_queries_executed, 1);
    assert_eq!(snapshot.total_queries_failed, 0);
    assert_eq!(snapshot.total_retries, 2);
}

#[tokio::test]
async fn test_exhausted_retries_surface_attempt_count() {
    let driver = MockDriver::new();
    let gateway = DatabaseGateway::new(test_config(4), Arc::new(driver));

    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_clone = Arc::clone(&attempts);
    let result: Result<(), _> = gateway
        .submit(0, "hopeless", move |_conn| {
            let attempts = Arc::clone(&attempts_clone);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError::TransientNetwork {
                    detail: "broken pipe".to_string(),
                })
            }
        })
        .await;

    match result {
        Err(GatewayError::RetriesExhausted { attempts: n, .. }) => assert_eq!(n, 3),
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_connect_failures_fail_all_waiters_with_classified_error() {
    let driver = MockDriver::new();
    driver.fail_next_connects([
        DriverError::TransientNetwork("refused".to_string()),
        DriverError::TransientNetwork("refused".to_string()),
        DriverError::TransientNetwork("refused".to_string()),
    ]);
    let gateway = DatabaseGateway::new(test_config(4), Arc::new(driver.clone()));

    let result: Result<(), _> = gateway.submit(0, "first", |_conn| async { Ok(()) }).await;
    assert!(result.is_err());

    // The next submission reconnects cleanly.
    let result = gateway.submit(0, "second", |_conn| async { Ok(()) }).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_health_check_reports_cooldown_then_healthy() {
    let driver = MockDriver::new();
    let gateway = DatabaseGateway::new(test_config(4), Arc::new(driver));

    let result: Result<(), _> = gateway
        .submit(0, "burst", |_conn| async {
            Err(GatewayError::RateLimitExceeded {
                retry_after: Duration::ZERO,
            })
        })
        .await;
    assert!(result.is_err());

    match gateway.health_check().await {
        HealthReport::Cooldown {
            remaining_ms,
            detail,
        } => {
            assert!(remaining_ms > 0);
            assert!(detail.contains("cooldown"));
        }
        other => panic!("expected cooldown report, got {other:?}"),
    }

    // After the cooldown a real probe drives through the full pipeline.
    tokio::time::sleep(Duration::from_millis(350)).await;
    match gateway.health_check().await {
        HealthReport::Healthy { .. } => {}
        other => panic!("expected healthy report, got {other:?}"),
    }
}

#[tokio::test]
async fn test_health_check_reports_unreachable_database() {
    let driver = MockDriver::new();
    driver.set_probe_healthy(false);
    let gateway = DatabaseGateway::new(test_config(4), Arc::new(driver));

    match gateway.health_check().await {
        HealthReport::Unhealthy { detail } => assert!(!detail.is_empty()),
        other => panic!("expected unhealthy report, got {other:?}"),
    }
}

#[tokio::test]
async fn test_graceful_shutdown_drains_in_flight_work() {
    let driver = MockDriver::new();
    let gateway = Arc::new(DatabaseGateway::new(
        test_config(2),
        Arc::new(driver.clone()),
    ));
    gateway.init().await.unwrap();

    let slow = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            gateway
                .submit(0, "slow", |_conn| async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok("done")
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    gateway.shutdown().await;

    // The in-flight task completed despite the shutdown.
    assert_eq!(slow.await.unwrap().unwrap(), "done");

    // New work is refused and the handle was released.
    let late: Result<(), _> = gateway.submit(0, "late", |_conn| async { Ok(()) }).await;
    assert!(matches!(late, Err(GatewayError::ShutdownInProgress)));
    assert_eq!(gateway.stats().connection_state, ConnectionState::Disconnected);
    assert!(driver.disconnect_calls() >= 1);
}
