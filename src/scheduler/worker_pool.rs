//! Worker pool for processing tasks from the queue pair.
//!
//! Each worker is a sequential loop: wait for the next entry under strict
//! priority, execute it remotely, commit the outcome, pause, repeat. Running
//! several workers against the same queue pair scales throughput; each pop
//! is consumed by exactly one worker.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Graceful shutdown through a cancellation token with a bounded grace period
//! - Local execution deadline per task
//! - Periodic recovery sweep for entries whose worker died mid-task
//! - Pool statistics tracking
//!
//! # Failure handling
//!
//! Every per-task failure (bad entry, sandbox error, deadline) becomes an
//! `error` result; nothing is retried. Queue or store failures are logged and
//! the loop moves on to the next iteration.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ExecutionError, QueueError};
use crate::execution::{Executor, RemoteOutcome};
use crate::metrics::MetricsCollector;
use crate::store::ResultStore;

use super::queue::{Dequeued, QueuePair};
use super::task::{ErrorKind, InvalidEntry, Language, Outcome, QueueClass, Task};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Queue operation failed.
    #[error("Queue operation failed: {0}")]
    Queue(#[from] QueueError),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// The configuration cannot be run safely.
    #[error("Invalid worker pool configuration: {0}")]
    InvalidConfig(String),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker loops to spawn.
    pub num_workers: usize,
    /// How long to block on each queue per dequeue attempt.
    pub queue_wait: Duration,
    /// Pause after each processed task, bounding the request rate per worker.
    pub task_pause: Duration,
    /// Deadline for one sandbox call.
    pub execution_timeout: Duration,
    /// How long shutdown waits for in-flight tasks.
    pub shutdown_timeout: Duration,
    /// Age after which an unacknowledged entry is requeued. Must exceed
    /// `execution_timeout + task_pause`, or a live worker's entry could be
    /// handed out twice.
    pub recovery_grace: Duration,
    /// How often the recovery sweep runs.
    pub sweep_interval: Duration,
    /// Pause after a failed dequeue.
    pub error_backoff: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            queue_wait: Duration::from_secs(1),
            task_pause: Duration::from_millis(1000),
            execution_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            recovery_grace: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Sets the per-queue dequeue wait.
    pub fn with_queue_wait(mut self, wait: Duration) -> Self {
        self.queue_wait = wait;
        self
    }

    /// Sets the pause between tasks.
    pub fn with_task_pause(mut self, pause: Duration) -> Self {
        self.task_pause = pause;
        self
    }

    /// Sets the execution deadline.
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the recovery grace period.
    pub fn with_recovery_grace(mut self, grace: Duration) -> Self {
        self.recovery_grace = grace;
        self
    }

    /// Sets the recovery sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Sets the pause after a failed dequeue.
    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Checks that the recovery sweep cannot requeue an entry whose worker
    /// is still within its deadline.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` describing the first violation.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.num_workers == 0 {
            return Err(PoolError::InvalidConfig(
                "at least one worker is required".to_string(),
            ));
        }
        if self.execution_timeout.is_zero() {
            return Err(PoolError::InvalidConfig(
                "execution timeout must be positive".to_string(),
            ));
        }
        let busiest = self.execution_timeout + self.task_pause;
        if self.recovery_grace <= busiest {
            return Err(PoolError::InvalidConfig(format!(
                "recovery grace {:?} must exceed execution timeout plus task pause ({:?})",
                self.recovery_grace, busiest
            )));
        }
        Ok(())
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently processing a task.
    pub active_workers: usize,
    /// Tasks committed with status `completed`.
    pub tasks_completed: u64,
    /// Tasks committed with status `error`.
    pub tasks_failed: u64,
    /// Average time from dequeue to commit.
    pub average_task_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of tasks processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.tasks_completed + self.tasks_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.tasks_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record(&self, success: bool, duration: Duration) {
        if success {
            self.tasks_completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.tasks_failed.fetch_add(1, Ordering::SeqCst);
        }
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) -> u64 {
        self.active_workers.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn decrement_active(&self) -> u64 {
        self.active_workers.fetch_sub(1, Ordering::SeqCst) - 1
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.tasks_completed.load(Ordering::SeqCst);
        let failed = self.tasks_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total = completed + failed;
        let average_duration = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            tasks_completed: completed,
            tasks_failed: failed,
            average_task_duration: average_duration,
        }
    }
}

/// Worker pool that runs worker loops against a shared queue pair.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<dyn QueuePair>,
    store: Arc<dyn ResultStore>,
    executor: Arc<dyn Executor>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a new worker pool. Nothing runs until [`WorkerPool::start`].
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<dyn QueuePair>,
        store: Arc<dyn ResultStore>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            config,
            queue,
            store,
            executor,
            cancel: CancellationToken::new(),
            handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            metrics: MetricsCollector::new(),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all workers and the recovery sweeper.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running,
    /// or `PoolError::InvalidConfig` if the configuration fails
    /// [`WorkerPoolConfig::validate`].
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }
        self.config.validate()?;

        // Hand back anything a previous process left mid-task.
        match self.queue.recover(self.config.recovery_grace).await {
            Ok(recovered) => {
                if recovered > 0 {
                    info!(recovered = recovered, "Recovered tasks from processing lists");
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to recover processing tasks");
            }
        }

        self.cancel = CancellationToken::new();

        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("worker-{}", i),
                queue: Arc::clone(&self.queue),
                store: Arc::clone(&self.store),
                executor: Arc::clone(&self.executor),
                cancel: self.cancel.clone(),
                queue_wait: self.config.queue_wait,
                task_pause: self.config.task_pause,
                execution_timeout: self.config.execution_timeout,
                error_backoff: self.config.error_backoff,
                stats: Arc::clone(&self.stats),
                metrics: self.metrics.clone(),
            };

            self.handles.push(tokio::spawn(worker.run()));
        }

        self.handles.push(tokio::spawn(run_sweeper(
            Arc::clone(&self.queue),
            self.config.recovery_grace,
            self.config.sweep_interval,
            self.cancel.clone(),
            self.metrics.clone(),
        )));

        self.is_running.store(true, Ordering::SeqCst);
        self.metrics.update_workers(self.config.num_workers);
        info!(num_workers = self.config.num_workers, "Worker pool started");

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers stop at the top of their loop; a task already dequeued runs
    /// to its commit first.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");
        self.cancel.cancel();

        let handles: Vec<_> = self.handles.drain(..).collect();
        let drained = tokio::time::timeout(
            self.config.shutdown_timeout,
            futures::future::join_all(handles),
        )
        .await;

        self.is_running.store(false, Ordering::SeqCst);
        self.metrics.update_workers(0);

        match drained {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!(error = %e, "Worker task panicked during shutdown");
                    }
                }
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    /// Returns a reference to the queue pair.
    pub fn queue(&self) -> &Arc<dyn QueuePair> {
        &self.queue
    }
}

/// Periodically requeues stale processing entries and refreshes queue depth
/// gauges until cancelled.
async fn run_sweeper(
    queue: Arc<dyn QueuePair>,
    grace: Duration,
    interval: Duration,
    cancel: CancellationToken,
    metrics: MetricsCollector,
) {
    let mut ticker = tokio::time::interval(interval);
    // The pool already swept on start.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match queue.recover(grace).await {
            Ok(0) => {}
            Ok(recovered) => info!(recovered = recovered, "Requeued stale tasks"),
            Err(e) => warn!(error = %e, "Recovery sweep failed"),
        }

        for class in QueueClass::PRIORITY_ORDER {
            if let Ok(depth) = queue.len(class).await {
                metrics.update_queue_depth(class.queue_key(), depth);
            }
        }
    }

    debug!("Recovery sweeper stopped");
}

/// A single worker loop.
struct Worker {
    /// Unique identifier for this worker.
    id: String,
    queue: Arc<dyn QueuePair>,
    store: Arc<dyn ResultStore>,
    executor: Arc<dyn Executor>,
    cancel: CancellationToken,
    queue_wait: Duration,
    task_pause: Duration,
    execution_timeout: Duration,
    error_backoff: Duration,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    /// Main worker loop.
    ///
    /// Idle while waiting on the queues, processing while a task is in
    /// hand; terminates when cancellation is observed between tasks.
    async fn run(self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            if self.cancel.is_cancelled() {
                info!(worker_id = %self.id, "Worker received shutdown signal");
                break;
            }

            let next = tokio::select! {
                _ = self.cancel.cancelled() => continue,
                next = self.queue.dequeue_next(self.queue_wait) => next,
            };

            match next {
                Ok(Some(entry)) => {
                    self.process_entry(entry).await;
                    self.pause(self.task_pause).await;
                }
                Ok(None) => {
                    // Both queues were polled for the full wait.
                    debug!(worker_id = %self.id, "No tasks available");
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to dequeue task");
                    self.pause(self.error_backoff).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Sleeps for `duration` unless cancelled first.
    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    async fn process_entry(&self, entry: Dequeued) {
        let started = Instant::now();
        let in_progress = self.stats.increment_active();
        self.metrics.update_tasks_in_progress(in_progress as usize);

        self.handle_entry(&entry, started).await;

        let in_progress = self.stats.decrement_active();
        self.metrics.update_tasks_in_progress(in_progress as usize);
    }

    async fn handle_entry(&self, entry: &Dequeued, started: Instant) {
        let task = match Task::parse_entry(&entry.payload) {
            Ok(task) => task,
            Err(InvalidEntry {
                task_id: Some(task_id),
                error,
            }) => {
                warn!(
                    worker_id = %self.id,
                    queue = %entry.class,
                    task_id = %task_id,
                    error = %error,
                    "Rejected invalid task"
                );
                let outcome = Outcome::failed(error.to_string(), ErrorKind::Validation);
                self.commit(entry, &task_id, outcome, started).await;
                return;
            }
            Err(InvalidEntry {
                task_id: None,
                error,
            }) => {
                error!(
                    worker_id = %self.id,
                    queue = %entry.class,
                    error = %error,
                    "Dropping queue entry without a task id"
                );
                self.ack(entry).await;
                return;
            }
        };

        info!(
            worker_id = %self.id,
            queue = %entry.class,
            task_id = %task.task_id,
            language = %task.language,
            "Processing task"
        );

        let outcome = self.execute(&task).await;
        self.commit(entry, &task.task_id, outcome, started).await;
    }

    /// Runs the task remotely under the configured deadline and normalizes
    /// every result, including failures, into an outcome.
    async fn execute(&self, task: &Task) -> Outcome {
        let started = Instant::now();
        let limit = self.execution_timeout;

        let result = match tokio::time::timeout(limit, self.executor.execute(task)).await {
            Ok(result) => result,
            Err(_) => Err(ExecutionError::Timeout(limit)),
        };

        let outcome = match result {
            Ok(RemoteOutcome::Ran { output }) => Outcome::Completed { output },
            Ok(RemoteOutcome::NotRan { error_message }) => {
                Outcome::failed(error_message, ErrorKind::Remote)
            }
            Err(e) => {
                warn!(
                    worker_id = %self.id,
                    task_id = %task.task_id,
                    error = %e,
                    "Sandbox execution failed"
                );
                let kind = if e.is_timeout() {
                    ErrorKind::Timeout
                } else {
                    ErrorKind::Remote
                };
                Outcome::failed(e.to_string(), kind)
            }
        };

        self.metrics.record_sandbox_request(
            language_label(&task.language),
            outcome.kind_label(),
            started.elapsed().as_secs_f64(),
        );

        outcome
    }

    /// Commits the outcome and acknowledges the entry.
    ///
    /// If the commit fails the entry stays unacknowledged, so the recovery
    /// sweep will hand it to a worker again after the grace period.
    async fn commit(&self, entry: &Dequeued, task_id: &str, outcome: Outcome, started: Instant) {
        let kind = outcome.kind_label();

        match self.store.commit(task_id, outcome, entry.class).await {
            Ok(record) => {
                self.ack(entry).await;

                let duration = started.elapsed();
                self.stats.record(record.is_success(), duration);
                self.metrics.record_task(
                    entry.class.as_str(),
                    &record.status.to_string(),
                    duration.as_secs_f64(),
                );

                info!(
                    worker_id = %self.id,
                    queue = %entry.class,
                    task_id = %task_id,
                    outcome = kind,
                    duration_ms = duration.as_millis() as u64,
                    "Task processed"
                );
            }
            Err(e) => {
                error!(
                    worker_id = %self.id,
                    queue = %entry.class,
                    task_id = %task_id,
                    error = %e,
                    "Failed to commit result"
                );
            }
        }
    }

    async fn ack(&self, entry: &Dequeued) {
        if let Err(e) = self.queue.ack(entry).await {
            warn!(
                worker_id = %self.id,
                queue = %entry.class,
                error = %e,
                "Failed to acknowledge queue entry"
            );
        }
    }
}

/// Metric label for a language; unknown names are folded together.
fn language_label(language: &Language) -> &str {
    match language {
        Language::Other(_) => "other",
        known => known.as_str(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;
    use crate::error::StoreError;
    use crate::scheduler::memory::MemoryQueuePair;
    use crate::scheduler::task::{ResultRecord, ResultStatus};
    use crate::store::MemoryResultStore;

    /// Executor answering by task code, optionally slowly, recording calls.
    #[derive(Default)]
    struct ScriptedExecutor {
        replies: HashMap<String, Result<RemoteOutcome, String>>,
        delay: Option<Duration>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedExecutor {
        fn reply(mut self, code: &str, output: &str) -> Self {
            self.replies.insert(
                code.to_string(),
                Ok(RemoteOutcome::Ran {
                    output: output.to_string(),
                }),
            );
            self
        }

        fn reject(mut self, code: &str, message: &str) -> Self {
            self.replies
                .insert(code.to_string(), Err(message.to_string()));
            self
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        async fn calls(&self) -> Vec<String> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        async fn execute(&self, task: &Task) -> Result<RemoteOutcome, ExecutionError> {
            self.calls.lock().await.push(task.task_id.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match self.replies.get(&task.code) {
                Some(Ok(outcome)) => Ok(outcome.clone()),
                Some(Err(message)) => Err(ExecutionError::RequestFailed(message.clone())),
                None => Ok(RemoteOutcome::NotRan {
                    error_message: format!("{} runtime is unknown", task.language),
                }),
            }
        }
    }

    /// Store whose commits always fail.
    struct BrokenStore;

    #[async_trait]
    impl ResultStore for BrokenStore {
        async fn mark_pending(&self, _: &str) -> Result<(), StoreError> {
            Ok(())
        }
        async fn clear_pending(&self, _: &str) -> Result<(), StoreError> {
            Ok(())
        }
        async fn commit(
            &self,
            _: &str,
            _: Outcome,
            _: QueueClass,
        ) -> Result<ResultRecord, StoreError> {
            Err(StoreError::ConnectionFailed("connection refused".to_string()))
        }
        async fn get(&self, _: &str) -> Result<Option<ResultRecord>, StoreError> {
            Ok(None)
        }
        async fn is_pending(&self, _: &str) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn recent(&self, _: QueueClass, _: usize) -> Result<Vec<ResultRecord>, StoreError> {
            Ok(Vec::new())
        }
    }

    fn fast_config() -> WorkerPoolConfig {
        WorkerPoolConfig::new(1)
            .with_queue_wait(Duration::from_millis(20))
            .with_task_pause(Duration::from_millis(5))
            .with_shutdown_timeout(Duration::from_secs(5))
            .with_sweep_interval(Duration::from_secs(60))
    }

    struct Harness {
        queue: Arc<MemoryQueuePair>,
        store: Arc<MemoryResultStore>,
        executor: Arc<ScriptedExecutor>,
        pool: WorkerPool,
    }

    fn harness(config: WorkerPoolConfig, executor: ScriptedExecutor) -> Harness {
        let queue = Arc::new(MemoryQueuePair::new());
        let store = Arc::new(MemoryResultStore::default());
        let executor = Arc::new(executor);
        let pool = WorkerPool::new(
            config,
            queue.clone() as Arc<dyn QueuePair>,
            store.clone() as Arc<dyn ResultStore>,
            executor.clone() as Arc<dyn Executor>,
        );
        Harness {
            queue,
            store,
            executor,
            pool,
        }
    }

    async fn wait_for(store: &MemoryResultStore, task_id: &str) -> ResultRecord {
        for _ in 0..200 {
            if let Some(record) = store.get(task_id).await.unwrap() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no result for {} within 2s", task_id);
    }

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();

        assert_eq!(config.num_workers, 1);
        assert_eq!(config.queue_wait, Duration::from_secs(1));
        assert_eq!(config.task_pause, Duration::from_millis(1000));
        assert_eq!(config.execution_timeout, Duration::from_secs(30));
        assert_eq!(config.recovery_grace, Duration::from_secs(300));
    }

    #[test]
    fn test_worker_pool_config_builder() {
        let config = WorkerPoolConfig::new(8)
            .with_queue_wait(Duration::from_secs(2))
            .with_task_pause(Duration::ZERO)
            .with_execution_timeout(Duration::from_secs(5))
            .with_shutdown_timeout(Duration::from_secs(120))
            .with_recovery_grace(Duration::from_secs(10))
            .with_sweep_interval(Duration::from_secs(5))
            .with_error_backoff(Duration::from_millis(250));

        assert_eq!(config.num_workers, 8);
        assert_eq!(config.queue_wait, Duration::from_secs(2));
        assert_eq!(config.task_pause, Duration::ZERO);
        assert_eq!(config.execution_timeout, Duration::from_secs(5));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(120));
        assert_eq!(config.recovery_grace, Duration::from_secs(10));
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.error_backoff, Duration::from_millis(250));
    }

    #[test]
    fn test_config_validation() {
        assert!(WorkerPoolConfig::default().validate().is_ok());

        let overlapping = WorkerPoolConfig::default()
            .with_execution_timeout(Duration::from_secs(300))
            .with_recovery_grace(Duration::from_secs(300));
        assert!(matches!(
            overlapping.validate(),
            Err(PoolError::InvalidConfig(_))
        ));

        // The pause counts too: 29s + 1s is not strictly below 30s.
        let with_pause = WorkerPoolConfig::default()
            .with_execution_timeout(Duration::from_secs(29))
            .with_task_pause(Duration::from_secs(1))
            .with_recovery_grace(Duration::from_secs(30));
        assert!(with_pause.validate().is_err());

        assert!(WorkerPoolConfig::new(0).validate().is_err());
        assert!(WorkerPoolConfig::default()
            .with_execution_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let config = fast_config().with_recovery_grace(Duration::from_secs(1));
        let mut h = harness(config, ScriptedExecutor::default());

        let err = h.pool.start().await.unwrap_err();
        assert!(matches!(err, PoolError::InvalidConfig(_)));
        assert!(!h.pool.is_running());
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            num_workers: 4,
            active_workers: 2,
            tasks_completed: 80,
            tasks_failed: 20,
            average_task_duration: Duration::from_secs(1),
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
        assert!((PoolStats::default().success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::new();

        stats.record(true, Duration::from_secs(10));
        stats.record(true, Duration::from_secs(20));
        stats.record(false, Duration::from_secs(5));

        let pool_stats = stats.to_pool_stats(4);
        assert_eq!(pool_stats.tasks_completed, 2);
        assert_eq!(pool_stats.tasks_failed, 1);
        assert!(pool_stats.average_task_duration.as_millis() > 11000);
        assert!(pool_stats.average_task_duration.as_millis() < 12000);

        assert_eq!(stats.increment_active(), 1);
        assert_eq!(stats.increment_active(), 2);
        assert_eq!(stats.decrement_active(), 1);
    }

    #[test]
    fn test_language_label() {
        assert_eq!(language_label(&Language::Python), "python");
        assert_eq!(language_label(&Language::from("cobol")), "other");
    }

    #[tokio::test]
    async fn test_run_task_completes() {
        let mut h = harness(fast_config(), ScriptedExecutor::default().reply("print('hi')", "hi\n"));
        h.queue
            .enqueue(
                QueueClass::Run,
                &Task::new("t1", "python", "print('hi')", QueueClass::Run),
            )
            .await
            .unwrap();

        h.pool.start().await.unwrap();
        let record = wait_for(&h.store, "t1").await;
        h.pool.shutdown().await.unwrap();

        assert_eq!(record.status, ResultStatus::Completed);
        assert_eq!(record.output, "hi\n");
        assert_eq!(h.queue.processing_len(QueueClass::Run).await.unwrap(), 0);
        assert_eq!(h.pool.stats().tasks_completed, 1);
    }

    #[tokio::test]
    async fn test_missing_code_never_reaches_executor() {
        let mut h = harness(fast_config(), ScriptedExecutor::default());
        h.queue
            .push_raw(QueueClass::Run, r#"{"taskId":"bad","language":"python"}"#)
            .await;

        h.pool.start().await.unwrap();
        let record = wait_for(&h.store, "bad").await;
        h.pool.shutdown().await.unwrap();

        assert_eq!(record.status, ResultStatus::Error);
        assert_eq!(record.error_kind, Some(ErrorKind::Validation));
        assert!(record.output.contains("code"));
        assert!(h.executor.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_entry_without_task_id_is_dropped() {
        let mut h = harness(fast_config(), ScriptedExecutor::default().reply("x", "ok"));
        h.queue.push_raw(QueueClass::Run, "{not json").await;
        h.queue
            .enqueue(QueueClass::Run, &Task::new("after", "python", "x", QueueClass::Run))
            .await
            .unwrap();

        h.pool.start().await.unwrap();
        wait_for(&h.store, "after").await;
        h.pool.shutdown().await.unwrap();

        assert_eq!(h.executor.calls().await, vec!["after".to_string()]);
        assert_eq!(h.queue.processing_len(QueueClass::Run).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remote_failure_is_recorded_and_worker_survives() {
        let executor = ScriptedExecutor::default()
            .reject("boom", "connection reset by peer")
            .reply("ok", "fine\n");
        let mut h = harness(fast_config(), executor);
        h.queue
            .enqueue(QueueClass::Run, &Task::new("t1", "python", "boom", QueueClass::Run))
            .await
            .unwrap();
        h.queue
            .enqueue(QueueClass::Run, &Task::new("t2", "python", "ok", QueueClass::Run))
            .await
            .unwrap();

        h.pool.start().await.unwrap();
        let failed = wait_for(&h.store, "t1").await;
        let next = wait_for(&h.store, "t2").await;
        h.pool.shutdown().await.unwrap();

        assert_eq!(failed.status, ResultStatus::Error);
        assert_eq!(failed.error_kind, Some(ErrorKind::Remote));
        assert!(failed.output.contains("connection reset"));
        assert_eq!(next.status, ResultStatus::Completed);

        let stats = h.pool.stats();
        assert_eq!(stats.tasks_failed, 1);
        assert_eq!(stats.tasks_completed, 1);
    }

    #[tokio::test]
    async fn test_unknown_language_yields_sandbox_error() {
        let mut h = harness(fast_config(), ScriptedExecutor::default());
        h.queue
            .enqueue(
                QueueClass::Submit,
                &Task::new("t2", "unknownlang", "x", QueueClass::Submit),
            )
            .await
            .unwrap();

        h.pool.start().await.unwrap();
        let record = wait_for(&h.store, "t2").await;
        assert!(h.pool.is_running());
        h.pool.shutdown().await.unwrap();

        assert_eq!(record.status, ResultStatus::Error);
        assert!(record.output.contains("runtime is unknown"));
    }

    #[tokio::test]
    async fn test_execution_deadline() {
        let config = fast_config().with_execution_timeout(Duration::from_millis(50));
        let executor = ScriptedExecutor::default()
            .reply("slow", "late")
            .with_delay(Duration::from_millis(500));
        let mut h = harness(config, executor);
        h.queue
            .enqueue(QueueClass::Run, &Task::new("t1", "python", "slow", QueueClass::Run))
            .await
            .unwrap();

        h.pool.start().await.unwrap();
        let record = wait_for(&h.store, "t1").await;
        h.pool.shutdown().await.unwrap();

        assert_eq!(record.status, ResultStatus::Error);
        assert_eq!(record.error_kind, Some(ErrorKind::Timeout));
        assert!(!record.output.is_empty());
    }

    #[tokio::test]
    async fn test_run_task_committed_before_submit_task() {
        let config = fast_config().with_queue_wait(Duration::from_secs(1));
        let executor = ScriptedExecutor::default().reply("x", "ok");
        let mut h = harness(config, executor);
        h.queue
            .enqueue(QueueClass::Submit, &Task::new("sub", "python", "x", QueueClass::Submit))
            .await
            .unwrap();
        h.queue
            .enqueue(QueueClass::Run, &Task::new("run", "python", "x", QueueClass::Run))
            .await
            .unwrap();

        h.pool.start().await.unwrap();
        let submit = wait_for(&h.store, "sub").await;
        let run = wait_for(&h.store, "run").await;
        h.pool.shutdown().await.unwrap();

        assert!(run.completed_at < submit.completed_at);
        assert_eq!(h.executor.calls().await, vec!["run", "sub"]);
    }

    #[tokio::test]
    async fn test_shutdown_lets_in_flight_task_finish() {
        let executor = ScriptedExecutor::default()
            .reply("x", "done")
            .with_delay(Duration::from_millis(200));
        let mut h = harness(fast_config(), executor);
        h.queue
            .enqueue(QueueClass::Run, &Task::new("t1", "python", "x", QueueClass::Run))
            .await
            .unwrap();

        h.pool.start().await.unwrap();
        while h.executor.calls().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        h.pool.shutdown().await.unwrap();

        assert!(!h.pool.is_running());
        let record = h.store.get("t1").await.unwrap().expect("in-flight task committed");
        assert_eq!(record.output, "done");
    }

    #[tokio::test]
    async fn test_shutdown_timeout_is_bounded() {
        let config = fast_config()
            .with_execution_timeout(Duration::from_secs(10))
            .with_shutdown_timeout(Duration::from_millis(50));
        let executor = ScriptedExecutor::default()
            .reply("x", "done")
            .with_delay(Duration::from_secs(5));
        let mut h = harness(config, executor);
        h.queue
            .enqueue(QueueClass::Run, &Task::new("t1", "python", "x", QueueClass::Run))
            .await
            .unwrap();

        h.pool.start().await.unwrap();
        while h.executor.calls().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let err = h.pool.shutdown().await.unwrap_err();
        assert!(matches!(err, PoolError::ShutdownTimeout(_)));
        assert!(!h.pool.is_running());
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_entry_for_recovery() {
        let queue = Arc::new(MemoryQueuePair::new());
        let executor = Arc::new(ScriptedExecutor::default().reply("x", "ok"));
        let mut pool = WorkerPool::new(
            fast_config(),
            queue.clone() as Arc<dyn QueuePair>,
            Arc::new(BrokenStore),
            executor.clone() as Arc<dyn Executor>,
        );
        queue
            .enqueue(QueueClass::Run, &Task::new("t1", "python", "x", QueueClass::Run))
            .await
            .unwrap();

        pool.start().await.unwrap();
        while executor.calls().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.shutdown().await.unwrap();

        assert_eq!(queue.processing_len(QueueClass::Run).await.unwrap(), 1);
        assert_eq!(pool.stats().total_processed(), 0);
    }

    #[tokio::test]
    async fn test_start_twice_and_shutdown_when_stopped() {
        let mut h = harness(fast_config(), ScriptedExecutor::default());

        assert!(matches!(
            h.pool.shutdown().await,
            Err(PoolError::NotRunning)
        ));
        h.pool.start().await.unwrap();
        assert!(matches!(
            h.pool.start().await,
            Err(PoolError::AlreadyRunning)
        ));
        h.pool.shutdown().await.unwrap();
        assert_eq!(h.pool.num_workers(), 1);
    }
}
