//! Prometheus metrics registration and export.
//!
//! All coderun metrics live in one process-wide registry created by
//! [`init_metrics`]. Recording before initialization is a no-op.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::{Mutex, OnceLock};

/// Serializes initialization so every static comes from the same registry.
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Global Prometheus registry for all coderun metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Tasks committed by workers, labeled by queue class and result status.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Time from dequeue to commit in seconds, labeled by queue class.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Pending entries per queue, labeled by queue key.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Tasks currently held by a worker.
pub static TASKS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of running workers.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Sandbox calls, labeled by language and outcome.
pub static SANDBOX_REQUESTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Sandbox call latency in seconds, labeled by language.
pub static SANDBOX_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Submissions seen by the API, labeled by queue class and outcome
/// (`accepted`, `rejected`, `unavailable`).
pub static SUBMISSIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once; later calls leave the first registry in
/// place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if a metric definition is invalid.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let tasks_total = CounterVec::new(
        Opts::new("coderun_tasks_total", "Total number of tasks committed"),
        &["queue", "status"],
    )?;

    let task_duration = HistogramVec::new(
        HistogramOpts::new(
            "coderun_task_duration_seconds",
            "Time from dequeue to commit in seconds",
        )
        .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["queue"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("coderun_queue_depth", "Number of tasks waiting in queue"),
        &["queue_name"],
    )?;

    let tasks_in_progress = Gauge::new(
        "coderun_tasks_in_progress",
        "Number of tasks currently being processed",
    )?;

    let active_workers = Gauge::new("coderun_active_workers", "Number of active workers")?;

    let sandbox_requests_total = CounterVec::new(
        Opts::new("coderun_sandbox_requests_total", "Total sandbox requests"),
        &["language", "outcome"],
    )?;

    let sandbox_latency = HistogramVec::new(
        HistogramOpts::new(
            "coderun_sandbox_latency_seconds",
            "Sandbox request latency in seconds",
        )
        .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
        &["language"],
    )?;

    let submissions_total = CounterVec::new(
        Opts::new("coderun_submissions_total", "Total task submissions"),
        &["queue", "outcome"],
    )?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(tasks_in_progress.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(sandbox_requests_total.clone()))?;
    registry.register(Box::new(sandbox_latency.clone()))?;
    registry.register(Box::new(submissions_total.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = TASKS_IN_PROGRESS.set(tasks_in_progress);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = SANDBOX_REQUESTS_TOTAL.set(sandbox_requests_total);
    let _ = SANDBOX_LATENCY.set(sandbox_latency);
    let _ = SUBMISSIONS_TOTAL.set(submissions_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of failing when the registry is missing or
/// encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// HTTP handler for the `/metrics` endpoint.
pub async fn metrics_handler() -> String {
    export_metrics()
}
