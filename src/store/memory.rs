//! In-process result store with lazy expiry.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::StoreError;
use crate::scheduler::{Outcome, QueueClass, ResultRecord};

use super::{ResultStore, StoreConfig};

struct ResultsList {
    records: VecDeque<ResultRecord>,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    results: HashMap<String, (ResultRecord, Instant)>,
    pending: HashMap<String, Instant>,
    lists: HashMap<QueueClass, ResultsList>,
    next_prune: Option<Instant>,
}

impl State {
    /// Drops expired records and markers, at most once per `interval`.
    /// Reads still check expiry themselves.
    fn prune(&mut self, now: Instant, interval: Duration) {
        if self.next_prune.is_some_and(|at| now < at) {
            return;
        }
        self.results.retain(|_, (_, expires_at)| *expires_at > now);
        self.pending.retain(|_, expires_at| *expires_at > now);
        self.lists.retain(|_, list| list.expires_at > now);
        self.next_prune = Some(now + interval);
    }
}

/// Result store held in memory. Expired entries are dropped on access and
/// by a periodic pass on writes.
pub struct MemoryResultStore {
    state: Mutex<State>,
    config: StoreConfig,
}

impl MemoryResultStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            state: Mutex::new(State::default()),
            config,
        }
    }
}

impl MemoryResultStore {
    /// Expired entries live at most one interval past their TTL.
    fn prune_interval(&self) -> Duration {
        self.config.result_ttl.min(self.config.pending_ttl)
    }
}

impl Default for MemoryResultStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn mark_pending(&self, task_id: &str) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.prune(now, self.prune_interval());
        state.results.remove(task_id);
        state
            .pending
            .insert(task_id.to_string(), now + self.config.pending_ttl);
        Ok(())
    }

    async fn clear_pending(&self, task_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.pending.remove(task_id);
        Ok(())
    }

    async fn commit(
        &self,
        task_id: &str,
        outcome: Outcome,
        class: QueueClass,
    ) -> Result<ResultRecord, StoreError> {
        let record = ResultRecord::from_outcome(task_id, outcome);
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.prune(now, self.prune_interval());

        state.results.insert(
            task_id.to_string(),
            (record.clone(), now + self.config.result_ttl),
        );

        let list_expiry = now + self.config.results_list_ttl;
        let list = state.lists.entry(class).or_insert_with(|| ResultsList {
            records: VecDeque::new(),
            expires_at: list_expiry,
        });
        if list.expires_at <= now {
            list.records.clear();
        }
        list.records.push_front(record.clone());
        list.expires_at = list_expiry;

        state.pending.remove(task_id);

        Ok(record)
    }

    async fn get(&self, task_id: &str) -> Result<Option<ResultRecord>, StoreError> {
        let mut state = self.state.lock().await;
        match state.results.get(task_id) {
            Some((record, expires_at)) if *expires_at > Instant::now() => Ok(Some(record.clone())),
            Some(_) => {
                state.results.remove(task_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn is_pending(&self, task_id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.pending.get(task_id) {
            Some(expires_at) if *expires_at > Instant::now() => Ok(true),
            Some(_) => {
                state.pending.remove(task_id);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn recent(
        &self,
        class: QueueClass,
        limit: usize,
    ) -> Result<Vec<ResultRecord>, StoreError> {
        let state = self.state.lock().await;
        let records = match state.lists.get(&class) {
            Some(list) if list.expires_at > Instant::now() => {
                list.records.iter().take(limit).cloned().collect()
            }
            _ => Vec::new(),
        };
        Ok(records)
    }
}
