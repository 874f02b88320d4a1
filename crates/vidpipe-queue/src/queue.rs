//! Job queue using Redis Streams.
//!
//! Layout:
//! - `stream_name`: live jobs, entries `{task, job, attempt}`, consumed through `consumer_group`
//! - `delayed_set`: sorted set of retry envelopes scored by due time (ms since epoch)
//! - `dlq_stream_name`: exhausted jobs with their last error

use std::time::Duration;

use async_trait::async_trait;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::broker::JobBroker;
use crate::error::{QueueError, QueueResult};
use crate::job::{Delivery, QueueJob};

/// Retries promoted per sweep.
const PROMOTE_BATCH: usize = 100;

/// Moves due retries from the delayed set onto the stream.
///
/// KEYS: delayed set, stream. ARGV: now (ms), batch size. Returns `{promoted, dropped}`.
/// Each member is re-added before it is removed and the script runs atomically, so a failed
/// XADD leaves the member parked for the next sweep and two promoters never both re-add it.
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
local promoted = 0
local dropped = 0
for _, member in ipairs(due) do
  local ok, envelope = pcall(cjson.decode, member)
  if ok and type(envelope) == 'table' and envelope.task and envelope.job then
    redis.call('XADD', KEYS[2], '*', 'task', envelope.task, 'job', envelope.job,
      'attempt', envelope.attempt or 1)
    promoted = promoted + 1
  else
    dropped = dropped + 1
  end
  redis.call('ZREM', KEYS[1], member)
end
return {promoted, dropped}
"#;

/// Resets the idle timer of a pending entry only while `consumer` still owns it.
///
/// KEYS: stream. ARGV: group, consumer, message id. Returns 1 when renewed, 0 otherwise.
const RENEW_SCRIPT: &str = r#"
local entry = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[3], ARGV[3], 1)
if #entry == 0 or entry[1][2] ~= ARGV[2] then
  return 0
end
redis.call('XCLAIM', KEYS[1], ARGV[1], ARGV[2], 0, ARGV[3], 'JUSTID')
return 1
"#;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Stream name for jobs
    pub stream_name: String,
    /// Consumer group name
    pub consumer_group: String,
    /// Dead letter queue stream name
    pub dlq_stream_name: String,
    /// Sorted set holding delayed retries
    pub delayed_set: String,
    /// Attempts before DLQ
    pub max_attempts: u32,
    /// Idle time before a pending job may be claimed by another worker
    pub lock_duration: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            stream_name: "vidpipe:jobs".to_string(),
            consumer_group: "vidpipe:workers".to_string(),
            dlq_stream_name: "vidpipe:dlq".to_string(),
            delayed_set: "vidpipe:delayed".to_string(),
            max_attempts: 3,
            lock_duration: Duration::from_secs(600), // 10 minutes
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            stream_name: std::env::var("QUEUE_STREAM")
                .unwrap_or_else(|_| "vidpipe:jobs".to_string()),
            consumer_group: std::env::var("QUEUE_CONSUMER_GROUP")
                .unwrap_or_else(|_| "vidpipe:workers".to_string()),
            dlq_stream_name: std::env::var("QUEUE_DLQ_STREAM")
                .unwrap_or_else(|_| "vidpipe:dlq".to_string()),
            delayed_set: std::env::var("QUEUE_DELAYED_SET")
                .unwrap_or_else(|_| "vidpipe:delayed".to_string()),
            max_attempts: std::env::var("QUEUE_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(3),
            lock_duration: Duration::from_secs(
                std::env::var("QUEUE_LOCK_DURATION_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(600),
            ),
        }
    }
}

/// Delayed-set member: everything needed to re-add the stream entry.
#[derive(Debug, Serialize, Deserialize)]
struct RetryEnvelope {
    task: String,
    job: String,
    attempt: u32,
}

/// Job queue client.
pub struct JobQueue {
    client: redis::Client,
    config: QueueConfig,
}

impl JobQueue {
    /// Create a new job queue.
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn connection(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))
    }

    /// Initialize the queue (create consumer group if not exists).
    pub async fn init(&self) -> QueueResult<()> {
        let mut conn = self.connection().await?;

        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!("Created consumer group: {}", self.config.consumer_group),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group already exists: {}", self.config.consumer_group);
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }

        Ok(())
    }

    /// Get DLQ length.
    pub async fn dlq_len(&self) -> QueueResult<u64> {
        let mut conn = self.connection().await?;
        let len: u64 = conn.xlen(&self.config.dlq_stream_name).await?;
        Ok(len)
    }

    /// Number of retries waiting for their due time.
    pub async fn delayed_len(&self) -> QueueResult<u64> {
        let mut conn = self.connection().await?;
        let len: u64 = conn.zcard(&self.config.delayed_set).await?;
        Ok(len)
    }

    async fn add_entry(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        task: &str,
        payload: &str,
        attempt: u32,
    ) -> QueueResult<String> {
        let message_id: String = redis::cmd("XADD")
            .arg(&self.config.stream_name)
            .arg("*")
            .arg("task")
            .arg(task)
            .arg("job")
            .arg(payload)
            .arg("attempt")
            .arg(attempt)
            .query_async(conn)
            .await?;
        Ok(message_id)
    }

    /// Turn stream entries into deliveries, dropping malformed ones.
    async fn decode_entries(&self, entries: Vec<StreamId>) -> Vec<Delivery> {
        let mut deliveries = Vec::with_capacity(entries.len());

        for entry in entries {
            match decode_entry(&entry) {
                Ok(delivery) => deliveries.push(delivery),
                Err(e) => {
                    warn!("Dropping malformed message {}: {}", entry.id, e);
                    metrics::counter!("vidpipe_jobs_malformed_total").increment(1);
                    // Ack so it is not redelivered forever
                    if let Err(e) = self.ack(&entry.id).await {
                        warn!("Failed to ack malformed message {}: {}", entry.id, e);
                    }
                }
            }
        }

        deliveries
    }
}

fn decode_entry(entry: &StreamId) -> QueueResult<Delivery> {
    let task: String = entry
        .get("task")
        .ok_or_else(|| QueueError::malformed("missing `task` field"))?;
    let payload: String = entry
        .get("job")
        .ok_or_else(|| QueueError::malformed("missing `job` field"))?;
    let attempt: u32 = entry.get("attempt").unwrap_or(1);

    Ok(Delivery {
        message_id: entry.id.clone(),
        job: QueueJob::decode(&task, &payload)?,
        attempt: attempt.max(1),
    })
}

/// Whether a pending entry handed out `times_delivered` times must stop being reclaimed.
pub(crate) fn stall_limit_reached(times_delivered: usize, max_attempts: u32) -> bool {
    times_delivered >= max_attempts.max(1) as usize
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl JobBroker for JobQueue {
    async fn enqueue(&self, job: &QueueJob) -> QueueResult<String> {
        let mut conn = self.connection().await?;
        let payload = job.payload()?;

        let message_id = self.add_entry(&mut conn, job.task_name(), &payload, 1).await?;

        info!(
            "Enqueued {} job {} with message ID {}",
            job.task_name(),
            job.job_id(),
            message_id
        );

        Ok(message_id)
    }

    async fn consume(&self, consumer: &str, block: Duration, count: usize) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.connection().await?;

        // BLOCK 0 would wait forever
        let block_ms = block.as_millis().max(1) as u64;

        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.config.stream_name)
            .arg(">") // Only new messages
            .query_async(&mut conn)
            .await?;

        let entries = reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect::<Vec<_>>())
            .unwrap_or_default();

        let deliveries = self.decode_entries(entries).await;
        for delivery in &deliveries {
            debug!(
                "Consumed job {} (attempt {}) as {}",
                delivery.job.job_id(),
                delivery.attempt,
                delivery.message_id
            );
        }

        Ok(deliveries)
    }

    async fn claim_stalled(&self, consumer: &str, count: usize) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.connection().await?;
        let min_idle_ms = self.config.lock_duration.as_millis() as u64;

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<&str> = pending.ids.iter().map(|p| p.id.as_str()).collect();

        // XCLAIM re-checks idle time, so a job renewed meanwhile is not stolen
        let claimed: StreamClaimReply = redis::cmd("XCLAIM")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg(&ids)
            .query_async(&mut conn)
            .await?;

        let mut deliveries = Vec::new();
        for delivery in self.decode_entries(claimed.ids).await {
            let times_delivered = pending
                .ids
                .iter()
                .find(|p| p.id == delivery.message_id)
                .map(|p| p.times_delivered)
                .unwrap_or(1);

            // A job that keeps taking its worker down is not handed out again
            if stall_limit_reached(times_delivered, self.config.max_attempts) {
                let error = format!(
                    "job stalled {} times without its worker reporting an outcome",
                    times_delivered
                );
                self.dead_letter(&delivery, &error).await?;
                metrics::counter!("vidpipe_jobs_stalled_dead_lettered_total").increment(1);
                continue;
            }

            info!(
                "Claimed stalled job {} (attempt {}, delivered {} times)",
                delivery.job.job_id(),
                delivery.attempt,
                times_delivered
            );
            deliveries.push(delivery);
        }

        Ok(deliveries)
    }

    async fn renew(&self, consumer: &str, message_id: &str) -> QueueResult<()> {
        let mut conn = self.connection().await?;

        let renewed: i64 = redis::Script::new(RENEW_SCRIPT)
            .key(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg(message_id)
            .invoke_async(&mut conn)
            .await?;

        if renewed == 0 {
            return Err(QueueError::LockLost(message_id.to_string()));
        }

        Ok(())
    }

    async fn ack(&self, message_id: &str) -> QueueResult<()> {
        let mut conn = self.connection().await?;

        redis::cmd("XACK")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        redis::cmd("XDEL")
            .arg(&self.config.stream_name)
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        debug!("Acknowledged job: {}", message_id);
        Ok(())
    }

    async fn schedule_retry(&self, delivery: &Delivery, delay: Duration) -> QueueResult<()> {
        let mut conn = self.connection().await?;

        let envelope = serde_json::to_string(&RetryEnvelope {
            task: delivery.job.task_name().to_string(),
            job: delivery.job.payload()?,
            attempt: delivery.attempt + 1,
        })?;
        let due_at = now_ms() + delay.as_millis() as i64;

        // Park first, ack second: a crash in between duplicates rather than loses the job
        conn.zadd::<_, _, _, ()>(&self.config.delayed_set, &envelope, due_at)
            .await?;
        self.ack(&delivery.message_id).await?;

        info!(
            "Scheduled retry of job {} as attempt {} in {}s",
            delivery.job.job_id(),
            delivery.attempt + 1,
            delay.as_secs()
        );
        Ok(())
    }

    async fn promote_due(&self) -> QueueResult<usize> {
        let mut conn = self.connection().await?;

        let (promoted, dropped): (usize, usize) = redis::Script::new(PROMOTE_SCRIPT)
            .key(&self.config.delayed_set)
            .key(&self.config.stream_name)
            .arg(now_ms())
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut conn)
            .await?;

        if dropped > 0 {
            warn!("Dropped {} unreadable delayed retries", dropped);
        }
        if promoted > 0 {
            debug!("Promoted {} delayed retries", promoted);
        }
        Ok(promoted)
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> QueueResult<()> {
        let mut conn = self.connection().await?;

        redis::cmd("XADD")
            .arg(&self.config.dlq_stream_name)
            .arg("*")
            .arg("task")
            .arg(delivery.job.task_name())
            .arg("job")
            .arg(delivery.job.payload()?)
            .arg("attempt")
            .arg(delivery.attempt)
            .arg("error")
            .arg(error)
            .arg("original_id")
            .arg(&delivery.message_id)
            .query_async::<()>(&mut conn)
            .await?;

        self.ack(&delivery.message_id).await?;

        warn!("Moved job {} to DLQ: {}", delivery.job.job_id(), error);
        Ok(())
    }

    async fn len(&self) -> QueueResult<u64> {
        let mut conn = self.connection().await?;
        let len: u64 = conn.xlen(&self.config.stream_name).await?;
        Ok(len)
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    fn lock_duration(&self) -> Duration {
        self.config.lock_duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn entry(fields: &[(&str, &str)]) -> StreamId {
        let map: HashMap<String, redis::Value> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), redis::Value::BulkString(v.as_bytes().to_vec())))
            .collect();
        StreamId {
            id: "1-0".to_string(),
            map,
        }
    }

    #[test]
    fn test_decode_entry() {
        let job = QueueJob::from(crate::job::UploadFileJob::new(vidpipe_models::UploadedFile::new(
            "uploads/a.mp4",
            "a.mp4",
            10,
        )));
        let payload = job.payload().unwrap();

        let delivery = decode_entry(&entry(&[
            ("task", "upload-file"),
            ("job", &payload),
            ("attempt", "2"),
        ]))
        .unwrap();
        assert_eq!(delivery.attempt, 2);
        assert_eq!(delivery.job, job);

        // Entries written without an attempt field count as first attempts
        let delivery = decode_entry(&entry(&[("task", "upload-file"), ("job", &payload)])).unwrap();
        assert_eq!(delivery.attempt, 1);
    }

    #[test]
    fn test_decode_entry_missing_fields() {
        assert!(matches!(
            decode_entry(&entry(&[("job", "{}")])),
            Err(QueueError::Malformed(_))
        ));
        assert!(matches!(
            decode_entry(&entry(&[("task", "upload-file"), ("job", "{")])),
            Err(QueueError::Malformed(_))
        ));
    }

    #[test]
    fn test_stall_limit() {
        assert!(!stall_limit_reached(1, 3));
        assert!(!stall_limit_reached(2, 3));
        assert!(stall_limit_reached(3, 3));
        assert!(stall_limit_reached(4, 3));
        // max_attempts of 0 behaves like 1
        assert!(stall_limit_reached(1, 0));
    }

    #[test]
    fn test_promote_script_adds_before_removing() {
        let xadd = PROMOTE_SCRIPT.find("'XADD'").unwrap();
        let zrem = PROMOTE_SCRIPT.find("'ZREM'").unwrap();
        assert!(xadd < zrem);
    }

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.lock_duration, Duration::from_secs(600));
        assert_eq!(config.delayed_set, "vidpipe:delayed");
    }
}
