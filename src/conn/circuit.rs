//! Circuit breaker for rate-limit cooldowns
//!
//! Unlike a failure-counting breaker, this one has exactly two states:
//! tripped (cooling down) and not. It trips only when the error classifier
//! sees a connection-limit-exceeded signature, and it heals itself lazily on
//! the first check past the deadline — no background timer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Gate that fails fast during a database-reported overload
pub struct CircuitBreaker {
    /// Monotonic microseconds when the cooldown ends (0 = not tripped)
    open_until_us: AtomicU64,

    /// Times the breaker has tripped since construction
    trip_count: AtomicU64,

    /// Cooldown applied by [`CircuitBreaker::trip`]
    cooldown: Duration,

    /// Anchor instant for monotonic time
    epoch: Instant,
}

impl CircuitBreaker {
    /// Create a breaker with the given cooldown
    pub fn new(cooldown: Duration) -> Self {
        Self {
            open_until_us: AtomicU64::new(0),
            trip_count: AtomicU64::new(0),
            cooldown,
            epoch: Instant::now(),
        }
    }

    /// Open the breaker for the configured cooldown
    pub fn trip(&self) {
        self.trip_for(self.cooldown);
    }

    /// Open the breaker for a specific cooldown
    pub fn trip_for(&self, cooldown: Duration) {
        let open_until = self.now_us() + micros(cooldown);
        self.open_until_us.store(open_until, Ordering::Release);
        self.trip_count.fetch_add(1, Ordering::Relaxed);
        warn!(
            cooldown_ms = cooldown.as_millis() as u64,
            "circuit breaker tripped"
        );
    }

    /// Whether new work must be rejected right now.
    ///
    /// A breaker found past its deadline clears itself before answering.
    pub fn is_open(&self) -> bool {
        let open_until = self.open_until_us.load(Ordering::Acquire);
        if open_until == 0 {
            return false;
        }
        if self.now_us() < open_until {
            return true;
        }
        // Cooldown elapsed: self-heal, but never clobber a newer trip.
        if self
            .open_until_us
            .compare_exchange(open_until, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            info!("circuit breaker cooldown elapsed, resuming submissions");
        }
        self.is_open()
    }

    /// Time left until the cooldown ends (zero when not tripped)
    pub fn remaining(&self) -> Duration {
        let open_until = self.open_until_us.load(Ordering::Acquire);
        if open_until == 0 {
            return Duration::ZERO;
        }
        let now = self.now_us();
        if now >= open_until {
            return Duration::ZERO;
        }
        Duration::from_micros(open_until - now)
    }

    /// Times the breaker has tripped since construction
    pub fn trip_count(&self) -> u64 {
        self.trip_count.load(Ordering::Relaxed)
    }

    /// Force the breaker closed (manual recovery)
    pub fn reset(&self) {
        self.open_until_us.store(0, Ordering::Release);
    }

    fn now_us(&self) -> u64 {
        micros(self.epoch.elapsed())
    }
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}
