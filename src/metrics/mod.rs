//! Metrics module for Prometheus-based monitoring.
//!
//! Covers the worker side (tasks committed, sandbox calls, queue depth,
//! in-flight tasks) and the submission API.
//!
//! # Example
//!
//! ```ignore
//! use coderun::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_task("run", "completed", 1.5);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics, metrics_handler};

pub use prometheus::{
    ACTIVE_WORKERS, QUEUE_DEPTH, REGISTRY, SANDBOX_LATENCY, SANDBOX_REQUESTS_TOTAL,
    SUBMISSIONS_TOTAL, TASKS_IN_PROGRESS, TASKS_TOTAL, TASK_DURATION,
};
