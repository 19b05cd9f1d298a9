//! Example demonstrating gateway usage against the in-memory mock driver
//!
//! This example shows how to:
//! 1. Configure the gateway
//! 2. Submit prioritized queries
//! 3. Observe circuit breaker behavior during a rate-limit cooldown
//! 4. Monitor gateway statistics and health

use std::sync::Arc;
use std::time::Duration;

use dbgate::testing::MockDriver;
use dbgate::{Config, DatabaseGateway, GatewayError};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Configure the gateway
    let mut config = Config::new("mock://demo-db");
    config.gateway.max_concurrent = 4;
    config.gateway.max_retry_attempts = 3;
    config.gateway.circuit_breaker_cooldown_ms = 2_000;
    config.gateway.health_check_interval_ms = 5_000;
    config.validate()?;

    let driver = MockDriver::new();
    let gateway = Arc::new(DatabaseGateway::new(config, Arc::new(driver)));
    gateway.init().await?;

    // Submit a batch of prioritized queries
    let mut handles = Vec::new();
    for i in 0..10 {
        let gateway = Arc::clone(&gateway);
        let priority = if i % 5 == 0 { 10 } else { 0 };
        handles.push(tokio::spawn(async move {
            gateway
                .submit(priority, &format!("query_{i}"), |_conn| async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(i)
                })
                .await
        }));
    }
    for handle in handles {
        match handle.await? {
            Ok(i) => info!("query_{} completed", i),
            Err(e) => warn!("query failed: {}", e),
        }
    }

    // Simulate the database reporting its connection limit
    let result: Result<(), _> = gateway
        .submit(0, "burst", |_conn| async {
            Err(GatewayError::RateLimitExceeded {
                retry_after: Duration::ZERO,
            })
        })
        .await;
    warn!("burst query: {:?}", result);

    // Submissions now fail fast until the cooldown elapses
    let blocked: Result<(), _> = gateway.submit(0, "during_cooldown", |_conn| async { Ok(()) }).await;
    warn!("during cooldown: {:?}", blocked);

    println!("\n=== STATISTICS ===\n");
    let snapshot = gateway.stats();
    println!("  State:            {:?}", snapshot.connection_state);
    println!("  Queue length:     {}", snapshot.queue_length);
    println!("  Active:           {}", snapshot.active_count);
    println!("  Breaker open:     {}", snapshot.circuit_breaker_open);
    println!("  Cooldown left:    {}ms", snapshot.cooldown_remaining_ms);
    println!("  Executed:         {}", snapshot.total_queries_executed);
    println!("  Failed:           {}", snapshot.total_queries_failed);
    println!("  Retries:          {}", snapshot.total_retries);
    println!("  Rate limited:     {}", snapshot.total_rate_limited);

    // Wait out the cooldown, then verify recovery end to end
    info!("waiting for the cooldown to elapse...");
    tokio::time::sleep(Duration::from_millis(2_100)).await;

    println!("\n=== HEALTH ===\n");
    println!("  {:?}", gateway.health_check().await);

    gateway.shutdown().await;
    Ok(())
}
