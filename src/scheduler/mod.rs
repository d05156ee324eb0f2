//! Task scheduling with a prioritized Redis queue pair and worker pools.
//!
//! This module provides the execution side of coderun:
//!
//! - **QueuePair**: two FIFO queues (`runQueue`, `submitQueue`) consumed under
//!   strict priority, with a reliable dequeue using BRPOPLPUSH
//! - **WorkerPool**: pool of sequential workers that execute tasks remotely
//! - **Task**: queue entry format and the outcome/result types
//!
//! # Architecture
//!
//! ```text
//!        ┌──────────────┐
//!        │  Submission  │
//!        │     API      │
//!        └──────┬───────┘
//!               │ LPUSH
//!     ┌─────────┴──────────┐
//!     ▼                    ▼
//! ┌──────────┐       ┌─────────────┐
//! │ runQueue │ ────▶ │ submitQueue │   (run is always drained first)
//! └────┬─────┘       └──────┬──────┘
//!      └─────────┬──────────┘
//!                │ BRPOPLPUSH
//!     ┌──────────┼──────────┐
//!     ▼          ▼          ▼
//! ┌────────┐ ┌────────┐ ┌────────┐
//! │Worker 1│ │Worker 2│ │Worker N│ ──▶ sandbox ──▶ result:{taskId}
//! └────────┘ └────────┘ └────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use coderun::execution::{PistonClient, DEFAULT_EXECUTOR_URL};
//! use coderun::scheduler::{QueueClass, QueuePair, RedisQueuePair, Task, WorkerPool, WorkerPoolConfig};
//! use coderun::store::{RedisResultStore, StoreConfig};
//!
//! let queue = Arc::new(RedisQueuePair::connect("redis://localhost:6379").await?);
//! let store = Arc::new(RedisResultStore::connect("redis://localhost:6379", StoreConfig::default()).await?);
//! let executor = Arc::new(PistonClient::new(DEFAULT_EXECUTOR_URL));
//!
//! queue
//!     .enqueue(QueueClass::Run, &Task::new("t1", "python", "print('hi')", QueueClass::Run))
//!     .await?;
//!
//! let mut pool = WorkerPool::new(WorkerPoolConfig::new(2), queue, store, executor);
//! pool.start().await?;
//! // ...
//! pool.shutdown().await?;
//! ```
//!
//! # Reliability
//!
//! - **Atomic dequeue**: entries move into a per-queue processing list
//! - **Crash recovery**: entries left unacknowledged past a grace period are
//!   requeued, on start and by a periodic sweep
//! - **Graceful shutdown**: workers finish the task in hand before stopping

pub mod memory;
pub mod queue;
pub mod task;
pub mod worker_pool;

pub use memory::MemoryQueuePair;
pub use queue::{encode_entry, Dequeued, QueuePair, RedisQueuePair};
pub use task::{
    ErrorKind, InvalidEntry, Language, Outcome, QueueClass, ResultRecord, ResultStatus, Task,
    TaskLookup,
};
pub use worker_pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
