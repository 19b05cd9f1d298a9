//! Bounded-concurrency priority scheduler
//!
//! The scheduler is the throttling point of the gateway: `max_concurrent` is
//! set below the database's own connection cap, so overload shows up here as
//! queueing rather than as refused connections server-side.
//!
//! Tasks settle exactly once. A queued task either receives a slot grant and
//! runs on its submitter's own async task, or its deadline fires first and it
//! is rejected without ever starting — `oneshot` semantics make the two
//! outcomes mutually exclusive.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Notify};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::GatewayError;

/// Scheduler tunables
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Peak in-flight tasks
    pub max_concurrent: usize,

    /// Default deadline for queued tasks
    pub queue_timeout: Duration,

    /// Queue length that triggers a warning log
    pub queue_warn_threshold: usize,

    /// Queue length that triggers an error log
    pub queue_critical_threshold: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            queue_timeout: Duration::from_secs(30),
            queue_warn_threshold: 50,
            queue_critical_threshold: 200,
        }
    }
}

/// A task waiting for an execution slot
struct QueuedTask {
    priority: i32,
    seq: u64,
    submitted_at: Instant,
    grant_tx: oneshot::Sender<SlotGuard>,
}

// Max-heap order: highest priority first, earliest submission among equals.
impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

struct SchedState {
    queue: BinaryHeap<QueuedTask>,
    active: usize,
    shutting_down: bool,
}

struct SchedInner {
    config: SchedulerConfig,
    state: Mutex<SchedState>,
    seq: AtomicU64,
    /// Signals the shutdown waiter when `active` reaches zero
    idle: Notify,
    total_submitted: AtomicU64,
    total_queued: AtomicU64,
    peak_queue_depth: AtomicU64,
}

/// Bounded-concurrency, priority-ordered task gate
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedInner>,
}

/// RAII execution slot: dropping it returns capacity and re-drains the queue
pub struct SlotGuard {
    inner: Arc<SchedInner>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        {
            let mut state = self.inner.lock_state();
            state.active = state.active.saturating_sub(1);
        }
        SchedInner::drain(&self.inner);
    }
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SchedInner {
                config,
                state: Mutex::new(SchedState {
                    queue: BinaryHeap::new(),
                    active: 0,
                    shutting_down: false,
                }),
                seq: AtomicU64::new(0),
                idle: Notify::new(),
                total_submitted: AtomicU64::new(0),
                total_queued: AtomicU64::new(0),
                peak_queue_depth: AtomicU64::new(0),
            }),
        }
    }

    /// Run `fut` under the concurrency cap with the default queue timeout
    pub async fn run<T, F>(&self, priority: i32, fut: F) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        self.run_with_timeout(priority, self.inner.config.queue_timeout, fut)
            .await
    }

    /// Run `fut` under the concurrency cap with an explicit queue timeout
    pub async fn run_with_timeout<T, F>(
        &self,
        priority: i32,
        queue_timeout: Duration,
        fut: F,
    ) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        let slot = self.acquire(priority, queue_timeout).await?;
        let result = fut.await;
        drop(slot);
        result
    }

    /// Obtain an execution slot, queueing behind higher-priority work.
    ///
    /// Fast path: with free capacity and an empty queue the slot is taken
    /// inline, so the caller's future proceeds on the same tick.
    pub async fn acquire(
        &self,
        priority: i32,
        queue_timeout: Duration,
    ) -> Result<SlotGuard, GatewayError> {
        self.inner.total_submitted.fetch_add(1, Ordering::Relaxed);

        let grant_rx = {
            let mut state = self.inner.lock_state();
            if state.shutting_down {
                return Err(GatewayError::ShutdownInProgress);
            }
            if state.active < self.inner.config.max_concurrent && state.queue.is_empty() {
                state.active += 1;
                return Ok(SlotGuard {
                    inner: Arc::clone(&self.inner),
                });
            }

            let (grant_tx, grant_rx) = oneshot::channel();
            let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
            state.queue.push(QueuedTask {
                priority,
                seq,
                submitted_at: Instant::now(),
                grant_tx,
            });
            let depth = state.queue.len();
            drop(state);

            self.inner.total_queued.fetch_add(1, Ordering::Relaxed);
            self.inner
                .peak_queue_depth
                .fetch_max(depth as u64, Ordering::Relaxed);
            self.observe_backpressure(depth);
            grant_rx
        };

        // A slot may have freed while we were enqueueing.
        SchedInner::drain(&self.inner);

        match timeout(queue_timeout, grant_rx).await {
            Ok(Ok(slot)) => Ok(slot),
            // Grant sender dropped: the queue was cleared at shutdown.
            Ok(Err(_)) => Err(GatewayError::ShutdownInProgress),
            Err(_) => {
                debug!(
                    priority,
                    waited_ms = queue_timeout.as_millis() as u64,
                    "task abandoned after queue timeout"
                );
                Err(GatewayError::QueueTimeout {
                    waited: queue_timeout,
                })
            }
        }
    }

    /// Tasks currently executing
    pub fn active_count(&self) -> usize {
        self.inner.lock_state().active
    }

    /// Tasks queued and still waiting (abandoned entries excluded)
    pub fn queue_len(&self) -> usize {
        self.inner
            .lock_state()
            .queue
            .iter()
            .filter(|task| !task.grant_tx.is_closed())
            .count()
    }

    /// Tasks that ever had to queue (fast-path submissions excluded)
    pub fn total_queued(&self) -> u64 {
        self.inner.total_queued.load(Ordering::Relaxed)
    }

    pub fn total_submitted(&self) -> u64 {
        self.inner.total_submitted.load(Ordering::Relaxed)
    }

    pub fn peak_queue_depth(&self) -> u64 {
        self.inner.peak_queue_depth.load(Ordering::Relaxed)
    }

    /// Stop accepting work, reject queued tasks, and wait (bounded) for
    /// in-flight tasks to settle
    pub async fn shutdown(&self, grace: Duration) {
        let abandoned = {
            let mut state = self.inner.lock_state();
            state.shutting_down = true;
            std::mem::take(&mut state.queue)
        };
        let rejected = abandoned.len();
        // Dropping the grant senders wakes every queued waiter.
        drop(abandoned);
        if rejected > 0 {
            info!(rejected, "rejected queued tasks at shutdown");
        }

        let deadline = Instant::now() + grace;
        loop {
            let notified = self.inner.idle.notified();
            if self.active_count() == 0 {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || timeout(remaining, notified).await.is_err() {
                warn!(
                    active = self.active_count(),
                    "shutdown grace period expired with tasks still running"
                );
                return;
            }
        }
        debug!("scheduler drained");
    }

    fn observe_backpressure(&self, depth: usize) {
        let config = &self.inner.config;
        if depth >= config.queue_critical_threshold {
            error!(
                queue_length = depth,
                threshold = config.queue_critical_threshold,
                "queue length critical"
            );
        } else if depth >= config.queue_warn_threshold {
            warn!(
                queue_length = depth,
                threshold = config.queue_warn_threshold,
                "queue length elevated"
            );
        }
    }
}

impl SchedInner {
    fn lock_state(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Grant slots to queued tasks while capacity allows.
    ///
    /// Invoked after every enqueue and every slot release — an explicit
    /// re-woken loop, so a task settling immediately pulls the next one in.
    fn drain(inner: &Arc<SchedInner>) {
        loop {
            let task = {
                let mut state = inner.lock_state();
                if state.active >= inner.config.max_concurrent {
                    return;
                }
                loop {
                    match state.queue.pop() {
                        None => {
                            if state.active == 0 {
                                inner.idle.notify_one();
                            }
                            return;
                        }
                        Some(task) if task.grant_tx.is_closed() => {
                            // Waiter already gave up (queue timeout); discard
                            // without consuming a slot.
                            continue;
                        }
                        Some(task) => {
                            state.active += 1;
                            break task;
                        }
                    }
                }
            };

            let waited_ms = task.submitted_at.elapsed().as_millis() as u64;
            let guard = SlotGuard {
                inner: Arc::clone(inner),
            };
            match task.grant_tx.send(guard) {
                Ok(()) => {
                    debug!(priority = task.priority, waited_ms, "task granted execution slot");
                }
                Err(unclaimed) => {
                    // Lost the race with the waiter's deadline; dropping the
                    // guard returns the slot.
                    drop(unclaimed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    fn scheduler(max_concurrent: usize) -> Scheduler {
        Scheduler::new(SchedulerConfig {
            max_concurrent,
            queue_timeout: Duration::from_secs(5),
            queue_warn_threshold: 50,
            queue_critical_threshold: 200,
        })
    }

    #[tokio::test]
    async fn test_fast_path_never_queues() {
        let sched = scheduler(4);

        for _ in 0..4 {
            let result = sched.run(0, async { Ok::<_, GatewayError>(1) }).await;
            assert_eq!(result.unwrap(), 1);
        }

        assert_eq!(sched.total_submitted(), 4);
        assert_eq!(sched.total_queued(), 0);
        assert_eq!(sched.peak_queue_depth(), 0);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_cap() {
        let sched = scheduler(4);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let sched = sched.clone();
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                sched
                    .run(0, async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        sleep(Duration::from_millis(20)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, GatewayError>(())
                    })
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(sched.active_count(), 0);
    }

    #[tokio::test]
    async fn test_priority_order_with_fifo_ties() {
        let sched = scheduler(1);

        // Occupy the single slot so the next submissions must queue.
        let blocker = sched.acquire(0, Duration::from_secs(1)).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for (label, priority) in [("a", 1), ("b", 5), ("c", 1)] {
            let sched = sched.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                sched
                    .run(priority, async move {
                        order.lock().unwrap().push(label);
                        Ok::<_, GatewayError>(())
                    })
                    .await
            }));
            // Make the submission order deterministic.
            sleep(Duration::from_millis(10)).await;
        }

        drop(blocker);
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(*order.lock().unwrap(), vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn test_queue_timeout_rejects_unstarted_task() {
        let sched = scheduler(1);
        let blocker = sched.acquire(0, Duration::from_secs(1)).await.unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        let result = sched
            .run_with_timeout(0, Duration::from_millis(50), async move {
                ran_clone.fetch_add(1, Ordering::SeqCst);
                Ok::<_, GatewayError>(())
            })
            .await;

        assert!(matches!(result, Err(GatewayError::QueueTimeout { .. })));
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        // The slot is still held and reusable.
        drop(blocker);
        assert!(sched.run(0, async { Ok::<_, GatewayError>(()) }).await.is_ok());
    }

    #[tokio::test]
    async fn test_queued_task_runs_after_release() {
        let sched = scheduler(1);
        let blocker = sched.acquire(0, Duration::from_secs(1)).await.unwrap();

        let sched_clone = sched.clone();
        let queued = tokio::spawn(async move {
            sched_clone
                .run(0, async { Ok::<_, GatewayError>("ran") })
                .await
        });

        sleep(Duration::from_millis(20)).await;
        assert_eq!(sched.queue_len(), 1);

        drop(blocker);
        assert_eq!(queued.await.unwrap().unwrap(), "ran");
        assert_eq!(sched.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_and_queued_tasks() {
        let sched = scheduler(1);
        let blocker = sched.acquire(0, Duration::from_secs(1)).await.unwrap();

        let sched_clone = sched.clone();
        let queued = tokio::spawn(async move {
            sched_clone
                .run(0, async { Ok::<_, GatewayError>(()) })
                .await
        });
        sleep(Duration::from_millis(20)).await;

        let sched_clone = sched.clone();
        let shutdown = tokio::spawn(async move {
            sched_clone.shutdown(Duration::from_secs(1)).await;
        });
        sleep(Duration::from_millis(20)).await;

        // Queued task was rejected by the queue clear.
        assert!(matches!(
            queued.await.unwrap(),
            Err(GatewayError::ShutdownInProgress)
        ));

        // New submissions are refused outright.
        assert!(matches!(
            sched.run(0, async { Ok::<_, GatewayError>(()) }).await,
            Err(GatewayError::ShutdownInProgress)
        ));

        // Shutdown completes once the in-flight slot is released.
        drop(blocker);
        shutdown.await.unwrap();
        assert_eq!(sched.active_count(), 0);
    }
}
