//! Broker abstraction shared by the Redis and in-memory queues.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::QueueResult;
use crate::job::{Delivery, QueueJob};

/// At-least-once job broker with claim locks, delayed retries and a dead-letter queue.
///
/// A consumed message stays pending under the consuming worker until it is acked, retried or
/// dead-lettered. Pending messages idle longer than [`JobBroker::lock_duration`] can be
/// claimed by any other consumer.
#[async_trait]
pub trait JobBroker: Send + Sync {
    /// Append a job for first delivery. Returns the broker message id.
    async fn enqueue(&self, job: &QueueJob) -> QueueResult<String>;

    /// Take up to `count` new jobs, waiting at most `block` when none are ready.
    async fn consume(&self, consumer: &str, block: Duration, count: usize) -> QueueResult<Vec<Delivery>>;

    /// Take over up to `count` jobs whose lock has lapsed.
    async fn claim_stalled(&self, consumer: &str, count: usize) -> QueueResult<Vec<Delivery>>;

    /// Extend the lock on a job this consumer is working on.
    async fn renew(&self, consumer: &str, message_id: &str) -> QueueResult<()>;

    /// Mark a job done and drop it.
    async fn ack(&self, message_id: &str) -> QueueResult<()>;

    /// Release the job and redeliver it as attempt `attempt + 1` after `delay`.
    async fn schedule_retry(&self, delivery: &Delivery, delay: Duration) -> QueueResult<()>;

    /// Move due retries back onto the main queue. Returns how many moved.
    async fn promote_due(&self) -> QueueResult<usize>;

    /// Release the job into the dead-letter queue with `error`.
    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> QueueResult<()>;

    /// Jobs waiting or in flight.
    async fn len(&self) -> QueueResult<u64>;

    /// Cheap reachability check.
    async fn ping(&self) -> QueueResult<()>;

    /// Attempts allowed before a job is dead-lettered.
    fn max_attempts(&self) -> u32;

    /// Idle time after which a held job may be claimed by another consumer.
    fn lock_duration(&self) -> Duration;
}
