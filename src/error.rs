//! Error types for coderun operations.
//!
//! Defines one error enum per subsystem:
//! - Queue pair operations (Redis lists, leases)
//! - Result store reads and commits
//! - Remote sandbox execution
//! - Task validation (queue entries and submissions)
//! - Client-side polling

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize a task.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// Errors that can occur while reading or writing results.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Corrupt result record for '{key}': {source}")]
    CorruptRecord {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// Errors raised by the execution client or the worker's deadline around it.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Sandbox request failed: {0}")]
    RequestFailed(String),

    #[error("Sandbox returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Malformed sandbox response: {0}")]
    MalformedResponse(String),

    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),
}

impl ExecutionError {
    /// Returns whether this error came from the local deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecutionError::Timeout(_))
    }
}

/// Validation errors for queue entries and submissions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("Invalid task format: {0}")]
    Malformed(String),

    #[error("Invalid task format: missing '{0}'")]
    MissingField(&'static str),

    #[error("Unknown action '{0}': expected 'run' or 'submit'")]
    UnknownAction(String),

    #[error("Invalid taskId '{0}': use up to 128 letters, digits, '-', '_', '.' or ':'")]
    InvalidTaskId(String),
}

/// Errors surfaced by the polling client.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Failed to parse API response: {0}")]
    ParseError(String),

    #[error("Gave up waiting for task '{task_id}' after {waited:?}")]
    GaveUp { task_id: String, waited: Duration },
}
