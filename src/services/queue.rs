use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::models::job::{JobId, JobKind};

/// Message carried by the queue. Only references the job; the payload
/// lives in the registry and the result store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub message_id: Uuid,
    pub job_id: JobId,
    pub kind: JobKind,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedJob {
    pub fn new(job_id: JobId, kind: JobKind) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            job_id,
            kind,
            enqueued_at: Utc::now(),
        }
    }
}

/// One delivery of a message. Stays invisible to other consumers until it
/// is acknowledged or its visibility timeout passes.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: QueuedJob,
    receipt: String,
}

impl Delivery {
    pub fn receipt(&self) -> &str {
        &self.receipt
    }
}

/// Queue depth as seen by the pool controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Messages waiting to be delivered.
    pub visible: u64,
    /// Messages delivered but not yet acknowledged.
    pub in_flight: u64,
}

impl QueueStats {
    pub fn outstanding(&self) -> u64 {
        self.visible + self.in_flight
    }
}

/// At-least-once message queue with visibility timeouts.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: &QueuedJob) -> Result<(), QueueError>;

    /// Non-blocking poll. A returned delivery is hidden for `visibility_timeout`.
    async fn dequeue(&self, visibility_timeout: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Remove a delivery for good. Returns false if the delivery had already
    /// timed out and been handed back to the queue.
    async fn ack(&self, delivery: &Delivery) -> Result<bool, QueueError>;

    /// Push the delivery's deadline to now + `duration`. Returns false if the
    /// delivery is no longer held.
    async fn extend_visibility(&self, delivery: &Delivery, duration: Duration)
        -> Result<bool, QueueError>;

    /// Give a delivery up without processing; it becomes visible after `delay`.
    async fn release(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

// Moves timed-out deliveries back to the pending list, then pops the next
// message into the in-flight set. In-flight members are "<token>:<message>".
const DEQUEUE_SCRIPT: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for _, member in ipairs(expired) do
  redis.call('ZREM', KEYS[2], member)
  local sep = string.find(member, ':', 1, true)
  redis.call('RPUSH', KEYS[1], string.sub(member, sep + 1))
end
local payload = redis.call('RPOP', KEYS[1])
if not payload then
  return false
end
local receipt = ARGV[2] .. ':' .. payload
redis.call('ZADD', KEYS[2], now + tonumber(ARGV[1]), receipt)
return receipt
"#;

// Resets the deadline of a held delivery. Returns 0 if it is no longer held.
const EXTEND_SCRIPT: &str = r#"
if not redis.call('ZSCORE', KEYS[1], ARGV[2]) then
  return 0
end
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
redis.call('ZADD', KEYS[1], now + tonumber(ARGV[1]), ARGV[2])
return 1
"#;

/// Redis-backed queue: a pending list plus an in-flight sorted set scored by
/// visibility deadline (server clock).
pub struct RedisQueue {
    client: redis::Client,
    pending_key: String,
    inflight_key: String,
    dequeue_script: redis::Script,
    extend_script: redis::Script,
}

impl RedisQueue {
    pub fn new(redis_url: &str, prefix: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            pending_key: format!("{}:pending", prefix),
            inflight_key: format!("{}:inflight", prefix),
            dequeue_script: redis::Script::new(DEQUEUE_SCRIPT),
            extend_script: redis::Script::new(EXTEND_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }
}

fn parse_receipt(receipt: String) -> Result<Delivery, QueueError> {
    let payload = receipt
        .split_once(':')
        .map(|(_, payload)| payload)
        .ok_or_else(|| QueueError::Corrupt(receipt.clone()))?;
    let job: QueuedJob = serde_json::from_str(payload).map_err(QueueError::Serialize)?;
    Ok(Delivery { job, receipt })
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(job).map_err(QueueError::Serialize)?;
        conn.lpush::<_, _, ()>(&self.pending_key, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn dequeue(&self, visibility_timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.connection().await?;
        let token = Uuid::new_v4().simple().to_string();
        let receipt: Option<String> = self
            .dequeue_script
            .key(&self.pending_key)
            .key(&self.inflight_key)
            .arg(millis(visibility_timeout))
            .arg(&token)
            .invoke_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;

        receipt.map(parse_receipt).transpose()
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool, QueueError> {
        let mut conn = self.connection().await?;
        let removed: u64 = conn
            .zrem(&self.inflight_key, &delivery.receipt)
            .await
            .map_err(QueueError::Redis)?;
        Ok(removed > 0)
    }

    async fn extend_visibility(
        &self,
        delivery: &Delivery,
        duration: Duration,
    ) -> Result<bool, QueueError> {
        let mut conn = self.connection().await?;
        let held: i64 = self
            .extend_script
            .key(&self.inflight_key)
            .arg(millis(duration))
            .arg(&delivery.receipt)
            .invoke_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(held == 1)
    }

    async fn release(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        // The delivery stays in the in-flight set and is handed back by the
        // next dequeue once the shortened deadline passes.
        self.extend_visibility(delivery, delay).await?;
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.connection().await?;
        let visible: u64 = conn.llen(&self.pending_key).await.map_err(QueueError::Redis)?;
        let in_flight: u64 = conn.zcard(&self.inflight_key).await.map_err(QueueError::Redis)?;
        Ok(QueueStats { visible, in_flight })
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryInner {
    pending: VecDeque<QueuedJob>,
    in_flight: HashMap<String, (QueuedJob, Instant)>,
    unavailable: bool,
    deliveries: u64,
}

impl MemoryInner {
    fn requeue_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some((job, _)) = self.in_flight.remove(&receipt) {
                self.pending.push_front(job);
            }
        }
    }

    fn check(&self) -> Result<(), QueueError> {
        if self.unavailable {
            Err(QueueError::Unavailable)
        } else {
            Ok(())
        }
    }
}

/// In-process queue with the same visibility semantics as [`RedisQueue`].
/// Deadlines use the tokio clock, so paused-time tests can advance them.
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<MemoryInner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`QueueError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.unavailable = unavailable;
        }
    }

    /// Total deliveries handed out so far, redeliveries included.
    pub fn deliveries(&self) -> u64 {
        self.inner.lock().map(|i| i.deliveries).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>, QueueError> {
        self.inner.lock().map_err(|_| QueueError::Unavailable)
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let mut inner = self.lock()?;
        inner.check()?;
        inner.pending.push_back(job.clone());
        Ok(())
    }

    async fn dequeue(&self, visibility_timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut inner = self.lock()?;
        inner.check()?;
        let now = Instant::now();
        inner.requeue_expired(now);

        let Some(job) = inner.pending.pop_front() else {
            return Ok(None);
        };
        let receipt = Uuid::new_v4().to_string();
        inner
            .in_flight
            .insert(receipt.clone(), (job.clone(), now + visibility_timeout));
        inner.deliveries += 1;
        Ok(Some(Delivery { job, receipt }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool, QueueError> {
        let mut inner = self.lock()?;
        inner.check()?;
        Ok(inner.in_flight.remove(&delivery.receipt).is_some())
    }

    async fn extend_visibility(
        &self,
        delivery: &Delivery,
        duration: Duration,
    ) -> Result<bool, QueueError> {
        let mut inner = self.lock()?;
        inner.check()?;
        match inner.in_flight.get_mut(&delivery.receipt) {
            Some((_, deadline)) => {
                *deadline = Instant::now() + duration;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn release(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        self.extend_visibility(delivery, delay).await?;
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut inner = self.lock()?;
        inner.check()?;
        inner.requeue_expired(Instant::now());
        Ok(QueueStats {
            visible: inner.pending.len() as u64,
            in_flight: inner.in_flight.len() as u64,
        })
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        self.lock()?.check()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Malformed queue entry: {0}")]
    Corrupt(String),

    #[error("Queue unavailable")]
    Unavailable,
}
