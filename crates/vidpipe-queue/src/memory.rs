//! In-process broker for development and tests.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::broker::JobBroker;
use crate::error::{QueueError, QueueResult};
use crate::job::{Delivery, QueueJob};
use crate::queue::stall_limit_reached;

#[derive(Debug, Clone)]
struct Message {
    id: String,
    job: QueueJob,
    attempt: u32,
}

#[derive(Debug)]
struct Held {
    message: Message,
    consumer: String,
    locked_at: Instant,
    times_delivered: usize,
}

/// A job that exhausted its attempts.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub job: QueueJob,
    pub attempt: u32,
    pub error: String,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    ready: VecDeque<Message>,
    pending: HashMap<String, Held>,
    delayed: Vec<(Instant, Message)>,
    dead: Vec<DeadLetter>,
}

impl State {
    fn next_id(&mut self) -> String {
        self.next_id += 1;
        format!("{}-0", self.next_id)
    }

    fn release(&mut self, message_id: &str) -> QueueResult<Message> {
        self.pending
            .remove(message_id)
            .map(|held| held.message)
            .ok_or_else(|| QueueError::LockLost(message_id.to_string()))
    }
}

/// [`JobBroker`] held entirely in memory, with the same lock, retry and DLQ rules as Redis.
pub struct MemoryQueue {
    state: Mutex<State>,
    notify: Notify,
    max_attempts: u32,
    lock_duration: Duration,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(600))
    }
}

impl MemoryQueue {
    pub fn new(max_attempts: u32, lock_duration: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            max_attempts: max_attempts.max(1),
            lock_duration,
        }
    }

    /// Jobs moved to the dead-letter queue so far.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead.clone()
    }

    /// Jobs currently held by a consumer.
    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Retries waiting for their due time.
    pub async fn delayed_len(&self) -> usize {
        self.state.lock().await.delayed.len()
    }

    async fn take_ready(&self, consumer: &str, count: usize) -> Vec<Delivery> {
        let mut state = self.state.lock().await;
        let mut deliveries = Vec::new();

        while deliveries.len() < count {
            let Some(message) = state.ready.pop_front() else {
                break;
            };
            deliveries.push(Delivery {
                message_id: message.id.clone(),
                job: message.job.clone(),
                attempt: message.attempt,
            });
            state.pending.insert(
                message.id.clone(),
                Held {
                    message,
                    consumer: consumer.to_string(),
                    locked_at: Instant::now(),
                    times_delivered: 1,
                },
            );
        }

        deliveries
    }
}

#[async_trait]
impl JobBroker for MemoryQueue {
    async fn enqueue(&self, job: &QueueJob) -> QueueResult<String> {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        state.ready.push_back(Message {
            id: id.clone(),
            job: job.clone(),
            attempt: 1,
        });
        drop(state);

        self.notify.notify_one();
        debug!("Enqueued job {} in memory as {}", job.job_id(), id);
        Ok(id)
    }

    async fn consume(&self, consumer: &str, block: Duration, count: usize) -> QueueResult<Vec<Delivery>> {
        let deliveries = self.take_ready(consumer, count).await;
        if !deliveries.is_empty() {
            return Ok(deliveries);
        }

        let _ = tokio::time::timeout(block, self.notify.notified()).await;
        Ok(self.take_ready(consumer, count).await)
    }

    async fn claim_stalled(&self, consumer: &str, count: usize) -> QueueResult<Vec<Delivery>> {
        let mut state = self.state.lock().await;
        let mut claimed = Vec::new();
        let mut exhausted = Vec::new();

        for held in state.pending.values_mut() {
            if claimed.len() >= count {
                break;
            }
            if held.locked_at.elapsed() < self.lock_duration {
                continue;
            }
            if stall_limit_reached(held.times_delivered, self.max_attempts) {
                exhausted.push(held.message.id.clone());
                continue;
            }

            warn!(
                "Claiming stalled job {} from {}",
                held.message.job.job_id(),
                held.consumer
            );
            held.consumer = consumer.to_string();
            held.locked_at = Instant::now();
            held.times_delivered += 1;
            claimed.push(Delivery {
                message_id: held.message.id.clone(),
                job: held.message.job.clone(),
                attempt: held.message.attempt,
            });
        }

        for message_id in exhausted {
            let message = state.release(&message_id)?;
            warn!("Dead-lettering job {} after repeated stalls", message.job.job_id());
            state.dead.push(DeadLetter {
                job: message.job,
                attempt: message.attempt,
                error: format!(
                    "job stalled {} times without its worker reporting an outcome",
                    self.max_attempts
                ),
            });
        }

        Ok(claimed)
    }

    async fn renew(&self, consumer: &str, message_id: &str) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        let held = state
            .pending
            .get_mut(message_id)
            .filter(|held| held.consumer == consumer)
            .ok_or_else(|| QueueError::LockLost(message_id.to_string()))?;

        held.locked_at = Instant::now();
        Ok(())
    }

    async fn ack(&self, message_id: &str) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        // Acking an unknown id is a no-op, as with XACK
        state.pending.remove(message_id);
        Ok(())
    }

    async fn schedule_retry(&self, delivery: &Delivery, delay: Duration) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        let mut message = state.release(&delivery.message_id)?;

        message.id = state.next_id();
        message.attempt = delivery.attempt + 1;
        state.delayed.push((Instant::now() + delay, message));
        Ok(())
    }

    async fn promote_due(&self) -> QueueResult<usize> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let (due, waiting): (Vec<_>, Vec<_>) =
            std::mem::take(&mut state.delayed).into_iter().partition(|(at, _)| *at <= now);
        state.delayed = waiting;

        let promoted = due.len();
        state.ready.extend(due.into_iter().map(|(_, message)| message));
        drop(state);

        for _ in 0..promoted {
            self.notify.notify_one();
        }
        Ok(promoted)
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        let message = state.release(&delivery.message_id)?;

        state.dead.push(DeadLetter {
            job: message.job,
            attempt: delivery.attempt,
            error: error.to_string(),
        });
        Ok(())
    }

    async fn len(&self) -> QueueResult<u64> {
        let state = self.state.lock().await;
        Ok((state.ready.len() + state.pending.len()) as u64)
    }

    async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn lock_duration(&self) -> Duration {
        self.lock_duration
    }
}
