//! Integration tests against a live Redis.
//!
//! Run with: `REDIS_URL=redis://localhost:6379 cargo test -p vidpipe-queue -- --ignored`

use std::time::Duration;

use vidpipe_models::UploadedFile;
use vidpipe_queue::{JobBroker, JobQueue, QueueConfig, QueueError, QueueJob, UploadFileJob};

fn isolated_queue() -> JobQueue {
    let suffix = vidpipe_models::new_identifier();
    let config = QueueConfig {
        redis_url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into()),
        stream_name: format!("vidpipe:test:{}:jobs", suffix),
        consumer_group: format!("vidpipe:test:{}:workers", suffix),
        dlq_stream_name: format!("vidpipe:test:{}:dlq", suffix),
        delayed_set: format!("vidpipe:test:{}:delayed", suffix),
        max_attempts: 2,
        lock_duration: Duration::from_millis(200),
    };
    JobQueue::new(config).expect("redis client")
}

fn job() -> QueueJob {
    UploadFileJob::new(UploadedFile::new("uploads/a.mp4", "a.mp4", 1)).into()
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_enqueue_consume_ack() {
    let queue = isolated_queue();
    queue.init().await.unwrap();

    let job = job();
    queue.enqueue(&job).await.unwrap();

    let deliveries = queue.consume("w1", Duration::from_millis(500), 10).await.unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].job, job);
    assert_eq!(deliveries[0].attempt, 1);

    queue.ack(&deliveries[0].message_id).await.unwrap();
    assert_eq!(queue.len().await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_stalled_job_is_claimed_by_another_worker() {
    let queue = isolated_queue();
    queue.init().await.unwrap();
    queue.enqueue(&job()).await.unwrap();

    let held = queue.consume("crashed", Duration::from_millis(500), 1).await.unwrap();
    assert_eq!(held.len(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let claimed = queue.claim_stalled("w2", 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].message_id, held[0].message_id);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_retry_then_dead_letter() {
    let queue = isolated_queue();
    queue.init().await.unwrap();
    queue.enqueue(&job()).await.unwrap();

    let first = queue.consume("w1", Duration::from_millis(500), 1).await.unwrap().remove(0);
    queue.schedule_retry(&first, Duration::from_millis(50)).await.unwrap();
    assert_eq!(queue.delayed_len().await.unwrap(), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.promote_due().await.unwrap(), 1);

    let second = queue.consume("w1", Duration::from_millis(500), 1).await.unwrap().remove(0);
    assert_eq!(second.attempt, 2);

    queue.dead_letter(&second, "still failing").await.unwrap();
    assert_eq!(queue.dlq_len().await.unwrap(), 1);
    assert_eq!(queue.len().await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_renew_after_ack_is_lock_lost() {
    let queue = isolated_queue();
    queue.init().await.unwrap();
    queue.enqueue(&job()).await.unwrap();

    let held = queue.consume("w1", Duration::from_millis(500), 1).await.unwrap().remove(0);
    queue.renew("w1", &held.message_id).await.unwrap();

    queue.ack(&held.message_id).await.unwrap();
    assert!(matches!(
        queue.renew("w1", &held.message_id).await,
        Err(QueueError::LockLost(_))
    ));
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_renew_does_not_take_back_a_claimed_job() {
    let queue = isolated_queue();
    queue.init().await.unwrap();
    queue.enqueue(&job()).await.unwrap();

    let held = queue.consume("slow", Duration::from_millis(500), 1).await.unwrap().remove(0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let claimed = queue.claim_stalled("w2", 10).await.unwrap();
    assert_eq!(claimed.len(), 1);

    assert!(matches!(
        queue.renew("slow", &held.message_id).await,
        Err(QueueError::LockLost(_))
    ));
    // The new owner keeps its lock
    queue.renew("w2", &held.message_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(queue.claim_stalled("w3", 10).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_job_that_keeps_stalling_is_dead_lettered() {
    let queue = isolated_queue();
    queue.init().await.unwrap();
    queue.enqueue(&job()).await.unwrap();

    queue.consume("crashed-1", Duration::from_millis(500), 1).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(queue.claim_stalled("crashed-2", 10).await.unwrap().len(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(queue.claim_stalled("w3", 10).await.unwrap().is_empty());

    assert_eq!(queue.dlq_len().await.unwrap(), 1);
    assert_eq!(queue.len().await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_failed_promotion_keeps_the_retry() {
    let queue = isolated_queue();
    queue.init().await.unwrap();
    queue.enqueue(&job()).await.unwrap();

    let first = queue.consume("w1", Duration::from_millis(500), 1).await.unwrap().remove(0);
    queue.schedule_retry(&first, Duration::from_millis(10)).await.unwrap();

    // Replace the stream with a plain string so XADD fails with WRONGTYPE
    let client = redis::Client::open(queue.config().redis_url.as_str()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let stream = queue.config().stream_name.clone();
    redis::cmd("DEL").arg(&stream).query_async::<()>(&mut conn).await.unwrap();
    redis::cmd("SET").arg(&stream).arg("blocked").query_async::<()>(&mut conn).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(queue.promote_due().await.is_err());
    assert_eq!(queue.delayed_len().await.unwrap(), 1);

    redis::cmd("DEL").arg(&stream).query_async::<()>(&mut conn).await.unwrap();
    queue.init().await.unwrap();

    assert_eq!(queue.promote_due().await.unwrap(), 1);
    assert_eq!(queue.delayed_len().await.unwrap(), 0);
    let second = queue.consume("w1", Duration::from_millis(500), 1).await.unwrap().remove(0);
    assert_eq!(second.attempt, 2);
    assert_eq!(second.job, first.job);
}
