//! coderun: prioritized remote code execution service.
//!
//! Accepts code submissions, queues them on Redis under two priority classes,
//! executes them on a Piston-compatible sandbox and keeps expiring results
//! for polling clients.

pub mod api;
pub mod cli;
pub mod error;
pub mod execution;
pub mod metrics;
pub mod poller;
pub mod scheduler;
pub mod store;

pub use error::{ExecutionError, PollError, QueueError, StoreError, TaskError};
