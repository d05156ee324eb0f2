//! Redis-based queue pair with strict-priority dequeue.
//!
//! Two lists carry pending tasks, one per [`QueueClass`]:
//!
//! - `runQueue`: interactive checks, always drained first
//! - `submitQueue`: graded evaluations
//!
//! Each queue has two companions used for crash recovery:
//!
//! - `{queue}:processing`: entries popped but not yet acknowledged
//! - `{queue}:leases`: hash of processing entry -> pop time (epoch millis)
//!
//! # Reliability
//!
//! Entries are moved atomically from the queue to its processing list with
//! BRPOPLPUSH, so a pop is still consumed by exactly one worker. An entry is
//! acknowledged once its result is committed. Entries whose lease is older
//! than a grace period are handed back to the queue by [`QueuePair::recover`].
//!
//! # Connections
//!
//! Redis answers one connection's commands in order, so a BRPOPLPUSH would
//! stall everything queued behind it on a shared multiplexed connection.
//! Blocking pops therefore run on dedicated connections, one per concurrent
//! caller, kept in a small free list; every other command goes through the
//! shared [`ConnectionManager`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Script};

use crate::error::QueueError;

use super::task::{QueueClass, Task};

/// An entry taken off one of the queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dequeued {
    /// Queue the entry was popped from.
    pub class: QueueClass,
    /// Raw serialized task, exactly as stored.
    pub payload: String,
}

/// Two blocking-poppable work queues with strict priority.
#[async_trait]
pub trait QueuePair: Send + Sync {
    /// Appends `task` to the tail of the `class` queue. Never blocks.
    async fn enqueue(&self, class: QueueClass, task: &Task) -> Result<(), QueueError>;

    /// Waits up to `timeout_per_queue` on the run queue, then up to
    /// `timeout_per_queue` on the submit queue.
    ///
    /// Returns `Ok(None)` if both waits time out.
    async fn dequeue_next(
        &self,
        timeout_per_queue: Duration,
    ) -> Result<Option<Dequeued>, QueueError>;

    /// Marks a dequeued entry as fully processed.
    async fn ack(&self, entry: &Dequeued) -> Result<(), QueueError>;

    /// Requeues processing entries whose lease is older than `grace`.
    ///
    /// Returns the number of entries requeued.
    async fn recover(&self, grace: Duration) -> Result<usize, QueueError>;

    /// Number of entries waiting in the `class` queue.
    async fn len(&self, class: QueueClass) -> Result<usize, QueueError>;

    /// Number of `class` entries popped but not yet acknowledged.
    async fn processing_len(&self, class: QueueClass) -> Result<usize, QueueError>;
}

/// Serializes `task` as a queue entry for `class`.
///
/// The queue the entry lands on is authoritative, so `queueClass` is
/// overwritten to match it.
pub fn encode_entry(class: QueueClass, task: &Task) -> Result<String, QueueError> {
    let mut entry = serde_json::to_value(task)?;
    entry["queueClass"] = serde_json::Value::from(class.as_str());
    Ok(serde_json::to_string(&entry)?)
}

fn processing_key(class: QueueClass) -> String {
    format!("{}:processing", class.queue_key())
}

fn leases_key(class: QueueClass) -> String {
    format!("{}:leases", class.queue_key())
}

/// Requeues one processing entry, but only if it is still there.
///
/// KEYS[1] = processing list, KEYS[2] = leases hash, KEYS[3] = queue.
/// ARGV[1] = entry.
/// Returns 1 if the entry was requeued, 0 if it had already been acked.
const LUA_REQUEUE: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 1 then
    redis.call('HDEL', KEYS[2], ARGV[1])
    redis.call('RPUSH', KEYS[3], ARGV[1])
    return 1
end
redis.call('HDEL', KEYS[2], ARGV[1])
return 0
"#;

/// Whether a lease taken at `leased_at_ms` has outlived `grace` at `now_ms`.
fn lease_expired(leased_at_ms: i64, now_ms: i64, grace: Duration) -> bool {
    now_ms.saturating_sub(leased_at_ms) > grace.as_millis() as i64
}

/// Queue pair backed by Redis lists.
#[derive(Clone)]
pub struct RedisQueuePair {
    client: redis::Client,
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    /// Idle connections reserved for blocking pops.
    blocking: Arc<Mutex<Vec<MultiplexedConnection>>>,
}

impl RedisQueuePair {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            client,
            redis,
            blocking: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Takes an idle blocking connection, opening a new one if none is free.
    async fn checkout_blocking(&self) -> Result<MultiplexedConnection, QueueError> {
        let idle = self
            .blocking
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();
        match idle {
            Some(conn) => Ok(conn),
            None => self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| QueueError::ConnectionFailed(e.to_string())),
        }
    }

    fn checkin_blocking(&self, conn: MultiplexedConnection) {
        self.blocking
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(conn);
    }

    /// Blocks up to `timeout` for an entry on one queue, moving it to the
    /// processing list and stamping its lease.
    async fn pop_class(
        &self,
        class: QueueClass,
        timeout: Duration,
    ) -> Result<Option<Dequeued>, QueueError> {
        // BRPOPLPUSH only takes whole seconds and 0 means "forever".
        let timeout_secs = timeout.as_secs().max(1) as usize;

        // A connection whose pop errored or was cancelled is dropped, not
        // returned to the free list.
        let mut blocking = self.checkout_blocking().await?;
        let payload: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(class.queue_key())
            .arg(processing_key(class))
            .arg(timeout_secs)
            .query_async(&mut blocking)
            .await?;
        self.checkin_blocking(blocking);

        let Some(payload) = payload else {
            return Ok(None);
        };

        let mut conn = self.redis.clone();
        conn.hset::<_, _, _, ()>(leases_key(class), &payload, Utc::now().timestamp_millis())
            .await?;

        Ok(Some(Dequeued { class, payload }))
    }

    /// Moves `entry` from the processing list back onto its queue if it is
    /// still in the processing list. Returns whether it moved.
    async fn requeue_if_processing(
        &self,
        class: QueueClass,
        entry: &str,
    ) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let script = Script::new(LUA_REQUEUE);
        let requeued: i64 = script
            .key(processing_key(class))
            .key(leases_key(class))
            .key(class.queue_key())
            .arg(entry)
            .invoke_async(&mut conn)
            .await?;
        Ok(requeued == 1)
    }

    async fn recover_class(&self, class: QueueClass, grace: Duration) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let processing = processing_key(class);
        let leases_key = leases_key(class);

        // Leases first: an entry popped in between then shows up unleased
        // and gets stamped instead of having its fresh lease dropped.
        let mut leases: HashMap<String, i64> = conn.hgetall(&leases_key).await?;
        let entries: Vec<String> = conn.lrange(&processing, 0, -1).await?;
        let now_ms = Utc::now().timestamp_millis();
        let mut recovered = 0;

        for entry in entries {
            match leases.remove(&entry) {
                Some(leased_at) if lease_expired(leased_at, now_ms, grace) => {
                    // Back onto the consuming end so it runs next, unless a
                    // worker acked it since the LRANGE.
                    if self.requeue_if_processing(class, &entry).await? {
                        recovered += 1;
                    }
                }
                Some(_) => {}
                None => {
                    // Popped but never stamped: the consumer died between
                    // BRPOPLPUSH and HSET, or is about to stamp it. Start the
                    // clock now and let a later sweep decide.
                    conn.hset_nx::<_, _, _, ()>(&leases_key, &entry, now_ms)
                        .await?;
                }
            }
        }

        // Whatever is left has no processing entry any more.
        if !leases.is_empty() {
            let orphans: Vec<String> = leases.into_keys().collect();
            conn.hdel::<_, _, ()>(&leases_key, orphans).await?;
        }

        Ok(recovered)
    }
}

#[async_trait]
impl QueuePair for RedisQueuePair {
    async fn enqueue(&self, class: QueueClass, task: &Task) -> Result<(), QueueError> {
        let serialized = encode_entry(class, task)?;
        let mut conn = self.redis.clone();
        // LPUSH here and BRPOPLPUSH from the right give FIFO order.
        conn.lpush::<_, _, ()>(class.queue_key(), serialized).await?;
        Ok(())
    }

    async fn dequeue_next(
        &self,
        timeout_per_queue: Duration,
    ) -> Result<Option<Dequeued>, QueueError> {
        for class in QueueClass::PRIORITY_ORDER {
            if let Some(entry) = self.pop_class(class, timeout_per_queue).await? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    async fn ack(&self, entry: &Dequeued) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(processing_key(entry.class), 1, &entry.payload)
            .hdel(leases_key(entry.class), &entry.payload);
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn recover(&self, grace: Duration) -> Result<usize, QueueError> {
        let mut recovered = 0;
        for class in QueueClass::PRIORITY_ORDER {
            recovered += self.recover_class(class, grace).await?;
        }
        Ok(recovered)
    }

    async fn len(&self, class: QueueClass) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(class.queue_key()).await?;
        Ok(len)
    }

    async fn processing_len(&self, class: QueueClass) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(processing_key(class)).await?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_companion_keys() {
        assert_eq!(processing_key(QueueClass::Run), "runQueue:processing");
        assert_eq!(leases_key(QueueClass::Submit), "submitQueue:leases");
    }

    #[test]
    fn test_encode_entry_overrides_queue_class() {
        let task = Task::new("t1", "python", "print(1)", QueueClass::Run);
        let raw = encode_entry(QueueClass::Submit, &task).expect("entry should encode");
        let parsed = Task::parse_entry(&raw).expect("entry should parse back");

        assert_eq!(parsed.task_id, "t1");
        assert_eq!(parsed.queue_class, QueueClass::Submit);
    }

    #[test]
    fn test_lease_expired() {
        let grace = Duration::from_secs(300);
        assert!(!lease_expired(1_000, 1_000 + 299_000, grace));
        assert!(!lease_expired(1_000, 1_000 + 300_000, grace));
        assert!(lease_expired(1_000, 1_000 + 300_001, grace));
        // Clock skew between hosts must not count as expiry.
        assert!(!lease_expired(5_000, 1_000, grace));
    }

    #[tokio::test]
    #[ignore] // Needs REDIS_URL pointing at a scratch database
    async fn test_requeue_skips_acknowledged_entry() {
        let url = std::env::var("REDIS_URL").expect("REDIS_URL must be set");
        let queue = RedisQueuePair::connect(&url).await.expect("connect");
        let mut conn = queue.redis.clone();
        redis::cmd("DEL")
            .arg(&["runQueue", "runQueue:processing", "runQueue:leases"][..])
            .query_async::<_, ()>(&mut conn)
            .await
            .unwrap();

        // Acked between the sweep's LRANGE and its requeue: nothing moves.
        conn.hset::<_, _, _, ()>("runQueue:leases", "entry", 0_i64)
            .await
            .unwrap();
        assert!(!queue
            .requeue_if_processing(QueueClass::Run, "entry")
            .await
            .unwrap());
        assert_eq!(queue.len(QueueClass::Run).await.unwrap(), 0);
        let lease: Option<i64> = conn.hget("runQueue:leases", "entry").await.unwrap();
        assert_eq!(lease, None);

        // Still in processing: moved back onto the queue.
        conn.lpush::<_, _, ()>("runQueue:processing", "entry")
            .await
            .unwrap();
        assert!(queue
            .requeue_if_processing(QueueClass::Run, "entry")
            .await
            .unwrap());
        assert_eq!(queue.len(QueueClass::Run).await.unwrap(), 1);
        assert_eq!(queue.processing_len(QueueClass::Run).await.unwrap(), 0);
    }

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));
    }
}
