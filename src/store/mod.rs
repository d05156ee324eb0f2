//! Result store: expiring terminal records keyed by task id.
//!
//! A committed task has exactly one [`ResultRecord`] until it expires. The
//! store also keeps:
//!
//! - a short-lived `pending` marker written at submission time, so a lookup
//!   can tell "accepted, not finished" apart from "unknown or expired"
//! - one audit list per queue class holding every committed record, whose
//!   expiry slides forward on each push
//!
//! # Example
//!
//! ```rust,ignore
//! use coderun::scheduler::TaskLookup;
//! use coderun::store::{RedisResultStore, ResultStore, StoreConfig};
//!
//! let store = RedisResultStore::connect("redis://localhost:6379", StoreConfig::default()).await?;
//! match store.lookup("t1").await? {
//!     TaskLookup::Finished(record) => println!("{}", record.output),
//!     TaskLookup::Pending => println!("still running"),
//!     TaskLookup::Missing => println!("unknown or expired"),
//! }
//! ```

pub mod memory;
pub mod redis_store;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::scheduler::{Outcome, QueueClass, ResultRecord, TaskLookup};

pub use self::memory::MemoryResultStore;
pub use self::redis_store::RedisResultStore;

/// Expiry policy for the result store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Lifetime of a committed result record.
    pub result_ttl: Duration,
    /// Lifetime of a class results list, refreshed on every push.
    pub results_list_ttl: Duration,
    /// Lifetime of a pending marker.
    pub pending_ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            result_ttl: Duration::from_secs(300),
            results_list_ttl: Duration::from_secs(600),
            pending_ttl: Duration::from_secs(3600),
        }
    }
}

impl StoreConfig {
    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }

    pub fn with_results_list_ttl(mut self, ttl: Duration) -> Self {
        self.results_list_ttl = ttl;
        self
    }

    pub fn with_pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl = ttl;
        self
    }
}

/// Storage for task results.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Records that `task_id` was accepted and has no result yet.
    ///
    /// Any earlier result for the same id is dropped in the same write, so a
    /// resubmitted id reads as pending until its new result lands.
    async fn mark_pending(&self, task_id: &str) -> Result<(), StoreError>;

    /// Drops the pending marker, e.g. when the enqueue that followed it failed.
    async fn clear_pending(&self, task_id: &str) -> Result<(), StoreError>;

    /// Writes the terminal record for `task_id`, appends it to the class
    /// results list and clears the pending marker.
    ///
    /// Returns the record as stored.
    async fn commit(
        &self,
        task_id: &str,
        outcome: Outcome,
        class: QueueClass,
    ) -> Result<ResultRecord, StoreError>;

    /// Reads the terminal record. `None` means not finished or expired.
    async fn get(&self, task_id: &str) -> Result<Option<ResultRecord>, StoreError>;

    /// Whether a pending marker exists for `task_id`.
    async fn is_pending(&self, task_id: &str) -> Result<bool, StoreError>;

    /// Newest `limit` records from the `class` results list.
    async fn recent(
        &self,
        class: QueueClass,
        limit: usize,
    ) -> Result<Vec<ResultRecord>, StoreError>;

    /// Resolves a task to finished, pending or missing.
    async fn lookup(&self, task_id: &str) -> Result<TaskLookup, StoreError> {
        if let Some(record) = self.get(task_id).await? {
            return Ok(TaskLookup::Finished(record));
        }
        if self.is_pending(task_id).await? {
            return Ok(TaskLookup::Pending);
        }
        Ok(TaskLookup::Missing)
    }
}

/// Key of the terminal record for `task_id`.
pub fn result_key(task_id: &str) -> String {
    format!("result:{}", task_id)
}

/// Key of the pending marker for `task_id`.
pub fn pending_key(task_id: &str) -> String {
    format!("pending:{}", task_id)
}
