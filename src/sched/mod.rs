//! Priority scheduling module
//!
//! This module provides:
//! - Bounded-concurrency execution with an inline fast path
//! - Priority-ordered queueing, FIFO among equal priorities
//! - Per-task queue timeouts and observational backpressure

pub mod scheduler;

pub use scheduler::{Scheduler, SchedulerConfig, SlotGuard};
