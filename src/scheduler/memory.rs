//! In-process queue pair.
//!
//! Mirrors the Redis queue semantics (FIFO per class, strict priority across
//! classes, processing list with leases) without a server. Used for local
//! single-process runs and for exercising the worker loop in tests.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::error::QueueError;

use super::queue::{encode_entry, Dequeued, QueuePair};
use super::task::{QueueClass, Task};

#[derive(Default)]
struct State {
    pending: HashMap<QueueClass, VecDeque<String>>,
    processing: Vec<(Dequeued, Instant)>,
}

/// Queue pair held entirely in memory.
#[derive(Default)]
pub struct MemoryQueuePair {
    state: Mutex<State>,
    pushed: Notify,
}

impl MemoryQueuePair {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a raw entry, bypassing serialization. Lets callers inject
    /// malformed entries.
    pub async fn push_raw(&self, class: QueueClass, payload: impl Into<String>) {
        let mut state = self.state.lock().await;
        state
            .pending
            .entry(class)
            .or_default()
            .push_back(payload.into());
        drop(state);
        self.pushed.notify_waiters();
    }

    async fn try_pop(&self, class: QueueClass) -> Option<Dequeued> {
        let mut state = self.state.lock().await;
        let payload = state.pending.get_mut(&class)?.pop_front()?;
        let entry = Dequeued { class, payload };
        state.processing.push((entry.clone(), Instant::now()));
        Some(entry)
    }

    async fn pop_class(&self, class: QueueClass, timeout: Duration) -> Option<Dequeued> {
        let deadline = Instant::now() + timeout;
        loop {
            // Registered before the check so a push in between still wakes us.
            let pushed = self.pushed.notified();
            if let Some(entry) = self.try_pop(class).await {
                return Some(entry);
            }
            if tokio::time::timeout_at(deadline, pushed).await.is_err() {
                return None;
            }
        }
    }
}

#[async_trait]
impl QueuePair for MemoryQueuePair {
    async fn enqueue(&self, class: QueueClass, task: &Task) -> Result<(), QueueError> {
        let serialized = encode_entry(class, task)?;
        self.push_raw(class, serialized).await;
        Ok(())
    }

    async fn dequeue_next(
        &self,
        timeout_per_queue: Duration,
    ) -> Result<Option<Dequeued>, QueueError> {
        for class in QueueClass::PRIORITY_ORDER {
            if let Some(entry) = self.pop_class(class, timeout_per_queue).await {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    async fn ack(&self, entry: &Dequeued) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if let Some(pos) = state.processing.iter().position(|(e, _)| e == entry) {
            state.processing.remove(pos);
        }
        Ok(())
    }

    async fn recover(&self, grace: Duration) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let (stale, live): (Vec<_>, Vec<_>) = state
            .processing
            .drain(..)
            .partition(|(_, leased_at)| now.duration_since(*leased_at) > grace);
        state.processing = live;

        let recovered = stale.len();
        for (entry, _) in stale {
            state
                .pending
                .entry(entry.class)
                .or_default()
                .push_front(entry.payload);
        }
        drop(state);

        if recovered > 0 {
            self.pushed.notify_waiters();
        }
        Ok(recovered)
    }

    async fn len(&self, class: QueueClass) -> Result<usize, QueueError> {
        let state = self.state.lock().await;
        Ok(state.pending.get(&class).map_or(0, VecDeque::len))
    }

    async fn processing_len(&self, class: QueueClass) -> Result<usize, QueueError> {
        let state = self.state.lock().await;
        Ok(state
            .processing
            .iter()
            .filter(|(entry, _)| entry.class == class)
            .count())
    }
}
