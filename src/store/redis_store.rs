//! Redis-backed result store.
//!
//! Keys:
//!
//! - `result:{task_id}`: JSON result record, expires after `result_ttl`
//! - `pending:{task_id}`: pending marker, expires after `pending_ttl`
//! - `runResults` / `submitResults`: audit lists, expiry refreshed on push

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

use crate::error::StoreError;
use crate::scheduler::{Outcome, QueueClass, ResultRecord};

use super::{pending_key, result_key, ResultStore, StoreConfig};

/// Result store backed by Redis keys with expiry.
#[derive(Clone)]
pub struct RedisResultStore {
    redis: ConnectionManager,
    config: StoreConfig,
}

impl RedisResultStore {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, config: StoreConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self { redis, config })
    }

    /// Creates a store from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager, config: StoreConfig) -> Self {
        Self { redis, config }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

fn ttl_secs(ttl: std::time::Duration) -> u64 {
    // SETEX/EXPIRE reject 0.
    ttl.as_secs().max(1)
}

#[async_trait]
impl ResultStore for RedisResultStore {
    async fn mark_pending(&self, task_id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(result_key(task_id))
            .cmd("SETEX")
            .arg(pending_key(task_id))
            .arg(ttl_secs(self.config.pending_ttl))
            .arg(chrono::Utc::now().to_rfc3339());
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn clear_pending(&self, task_id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(pending_key(task_id)).await?;
        Ok(())
    }

    async fn commit(
        &self,
        task_id: &str,
        outcome: Outcome,
        class: QueueClass,
    ) -> Result<ResultRecord, StoreError> {
        let record = ResultRecord::from_outcome(task_id, outcome);
        let serialized = serde_json::to_string(&record)?;
        let mut conn = self.redis.clone();

        // One MULTI so readers never see the record without the marker gone.
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SETEX")
            .arg(result_key(task_id))
            .arg(ttl_secs(self.config.result_ttl))
            .arg(&serialized)
            .lpush(class.results_key(), &serialized)
            .cmd("EXPIRE")
            .arg(class.results_key())
            .arg(ttl_secs(self.config.results_list_ttl))
            .del(pending_key(task_id));
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(record)
    }

    async fn get(&self, task_id: &str) -> Result<Option<ResultRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let key = result_key(task_id);

        let data: Option<String> = conn.get(&key).await?;

        match data {
            Some(s) => serde_json::from_str(&s)
                .map(Some)
                .map_err(|source| StoreError::CorruptRecord { key, source }),
            None => Ok(None),
        }
    }

    async fn is_pending(&self, task_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let exists: bool = conn.exists(pending_key(task_id)).await?;
        Ok(exists)
    }

    async fn recent(
        &self,
        class: QueueClass,
        limit: usize,
    ) -> Result<Vec<ResultRecord>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let data: Vec<String> = conn
            .lrange(class.results_key(), 0, limit as isize - 1)
            .await?;

        let records = data
            .iter()
            .filter_map(|s| match serde_json::from_str::<ResultRecord>(s) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(queue = %class, error = %e, "Skipping unreadable results entry");
                    None
                }
            })
            .collect();

        Ok(records)
    }
}
