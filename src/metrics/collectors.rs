//! High-level recording interface over the raw Prometheus metrics.

use super::prometheus::{
    ACTIVE_WORKERS, QUEUE_DEPTH, SANDBOX_LATENCY, SANDBOX_REQUESTS_TOTAL, SUBMISSIONS_TOTAL,
    TASKS_IN_PROGRESS, TASKS_TOTAL, TASK_DURATION,
};

/// Metrics collector for coderun operations.
///
/// Cheap to clone and share; every method is a no-op until
/// [`init_metrics`](super::init_metrics) has run.
///
/// # Example
///
/// ```ignore
/// use coderun::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
///
/// collector.record_task("run", "completed", 1.2);
/// collector.record_sandbox_request("python", "completed", 0.8);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a committed task.
    ///
    /// # Arguments
    ///
    /// * `queue` - Queue class the task came from (`run` or `submit`)
    /// * `status` - Committed status (`completed` or `error`)
    /// * `duration_secs` - Time from dequeue to commit
    pub fn record_task(&self, queue: &str, status: &str, duration_secs: f64) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total.with_label_values(&[queue, status]).inc();
        }

        if let Some(task_duration) = TASK_DURATION.get() {
            task_duration
                .with_label_values(&[queue])
                .observe(duration_secs);
        }

        tracing::trace!(
            queue = queue,
            status = status,
            duration_secs = duration_secs,
            "Recorded task metric"
        );
    }

    /// Record one sandbox call and its latency.
    ///
    /// `outcome` is the outcome label (`completed`, `remote_error`, `timeout`).
    pub fn record_sandbox_request(&self, language: &str, outcome: &str, latency_secs: f64) {
        if let Some(requests) = SANDBOX_REQUESTS_TOTAL.get() {
            requests.with_label_values(&[language, outcome]).inc();
        }

        if let Some(latency) = SANDBOX_LATENCY.get() {
            latency.with_label_values(&[language]).observe(latency_secs);
        }

        tracing::trace!(
            language = language,
            outcome = outcome,
            latency_secs = latency_secs,
            "Recorded sandbox request metric"
        );
    }

    /// Record a submission handled by the API.
    pub fn record_submission(&self, queue: &str, outcome: &str) {
        if let Some(submissions) = SUBMISSIONS_TOTAL.get() {
            submissions.with_label_values(&[queue, outcome]).inc();
        }
    }

    /// Update the depth gauge for one queue.
    pub fn update_queue_depth(&self, queue_name: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&[queue_name])
                .set(depth as f64);
        }

        tracing::trace!(
            queue_name = queue_name,
            depth = depth,
            "Updated queue depth metric"
        );
    }

    /// Update the count of running workers.
    pub fn update_workers(&self, count: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(count as f64);
        }

        tracing::trace!(count = count, "Updated active workers metric");
    }

    /// Update the count of tasks currently held by a worker.
    pub fn update_tasks_in_progress(&self, count: usize) {
        if let Some(in_progress) = TASKS_IN_PROGRESS.get() {
            in_progress.set(count as f64);
        }
    }
}
