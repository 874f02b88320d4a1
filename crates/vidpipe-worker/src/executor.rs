//! Job executor.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use vidpipe_media::{ensure_writable_dir, remove_file_best_effort};
use vidpipe_models::JobState;
use vidpipe_queue::{Delivery, JobBroker, QueueError, QueueJob, UploadFileJob};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics;
use crate::processor::{process_upload, JobReport, ProcessingContext};
use crate::retry::{retry_async, FailureTracker, RetryDecision};

/// Attempts for broker bookkeeping calls after a job finishes.
const REPORT_ATTEMPTS: u32 = 3;
const REPORT_PAUSE: Duration = Duration::from_millis(200);
/// Most jobs taken per consume call.
const CONSUME_BATCH: usize = 5;

/// How a delivery ended.
#[derive(Debug)]
pub enum JobOutcome {
    Completed(JobReport),
    /// Failed; the broker will redeliver it as `next_attempt` after `delay`
    RetryScheduled { next_attempt: u32, delay: Duration, error: String },
    /// Failed for the last time and moved to the dead-letter queue
    DeadLettered { error: String },
    /// The broker did not accept the outcome; the job stays pending and is redelivered once its
    /// lock lapses
    Unreported { error: String },
}

impl JobOutcome {
    /// Lifecycle state the job is left in.
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Completed(_) => JobState::Completed,
            JobOutcome::RetryScheduled { .. } => JobState::RetryScheduled,
            JobOutcome::DeadLettered { .. } => JobState::DeadLettered,
            JobOutcome::Unreported { .. } => JobState::Processing,
        }
    }
}

/// Pulls jobs from the broker and runs them on a fixed number of slots.
pub struct JobExecutor {
    config: WorkerConfig,
    broker: Arc<dyn JobBroker>,
    ctx: Arc<ProcessingContext>,
    job_semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    consumer_name: String,
}

impl JobExecutor {
    pub fn new(ctx: ProcessingContext, broker: Arc<dyn JobBroker>) -> Self {
        let config = ctx.config.clone();
        let job_semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        let (shutdown, _) = watch::channel(false);
        let consumer_name = format!("worker-{}", Uuid::new_v4());

        Self {
            config,
            broker,
            ctx: Arc::new(ctx),
            job_semaphore,
            shutdown,
            consumer_name,
        }
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// Run until [`JobExecutor::shutdown`] is called, then drain in-flight jobs.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            "Starting job executor '{}' with {} job slots",
            self.consumer_name, self.config.max_concurrent_jobs
        );

        self.config.validate(self.broker.lock_duration())?;
        ensure_writable_dir(&self.config.work_dir).await?;

        let claim_task = self.spawn_claim_task();
        let promote_task = self.spawn_promote_task();
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut consume_failures = FailureTracker::new(5);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping executor");
                        break;
                    }
                }
                result = self.consume_jobs() => {
                    match result {
                        Ok(()) => consume_failures.record_success(),
                        Err(e) => {
                            if consume_failures.record_failure() {
                                error!("Error consuming jobs: {}", e);
                            }
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        }

        claim_task.abort();
        promote_task.abort();

        info!("Waiting for in-flight jobs to complete...");
        if tokio::time::timeout(self.config.shutdown_timeout, self.wait_for_jobs())
            .await
            .is_err()
        {
            warn!(
                "{} jobs still running after {:?}; their locks will lapse and another worker will pick them up",
                self.in_flight(),
                self.config.shutdown_timeout
            );
        }

        info!("Job executor stopped");
        Ok(())
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Process one delivery to completion and report the outcome to the broker.
    pub async fn execute(&self, delivery: Delivery) -> JobOutcome {
        Self::execute_job(
            Arc::clone(&self.ctx),
            Arc::clone(&self.broker),
            self.consumer_name.clone(),
            delivery,
        )
        .await
    }

    async fn consume_jobs(&self) -> WorkerResult<()> {
        let available = self.job_semaphore.available_permits();
        if available == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(());
        }

        let deliveries = self
            .broker
            .consume(
                &self.consumer_name,
                self.config.consume_block,
                available.min(CONSUME_BATCH),
            )
            .await?;

        if deliveries.is_empty() {
            return Ok(());
        }
        debug!("Consumed {} jobs from queue", deliveries.len());

        for delivery in deliveries {
            let permit = Arc::clone(&self.job_semaphore)
                .acquire_owned()
                .await
                .map_err(|_| WorkerError::job_failed("Semaphore closed"))?;
            self.spawn_job(delivery, permit);
        }

        Ok(())
    }

    fn spawn_job(&self, delivery: Delivery, permit: OwnedSemaphorePermit) {
        let ctx = Arc::clone(&self.ctx);
        let broker = Arc::clone(&self.broker);
        let consumer = self.consumer_name.clone();
        let semaphore = Arc::clone(&self.job_semaphore);
        let slots = self.config.max_concurrent_jobs;

        metrics::set_jobs_in_flight(slots - semaphore.available_permits());
        tokio::spawn(async move {
            Self::execute_job(ctx, broker, consumer, delivery).await;
            drop(permit);
            metrics::set_jobs_in_flight(slots - semaphore.available_permits());
        });
    }

    /// Periodically take over jobs whose lock lapsed on a crashed worker.
    fn spawn_claim_task(&self) -> JoinHandle<()> {
        let broker = Arc::clone(&self.broker);
        let ctx = Arc::clone(&self.ctx);
        let semaphore = Arc::clone(&self.job_semaphore);
        let consumer = self.consumer_name.clone();
        let interval = self.config.claim_interval;
        let slots = self.config.max_concurrent_jobs;
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut failures = FailureTracker::new(3);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let free = semaphore.available_permits();
                        if free == 0 {
                            continue;
                        }
                        match broker.claim_stalled(&consumer, free).await {
                            Ok(claimed) => {
                                failures.record_success();
                                if !claimed.is_empty() {
                                    info!("Claimed {} stalled jobs", claimed.len());
                                }
                                for delivery in claimed {
                                    let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                                        return;
                                    };
                                    let ctx = Arc::clone(&ctx);
                                    let broker = Arc::clone(&broker);
                                    let consumer = consumer.clone();
                                    let semaphore = Arc::clone(&semaphore);
                                    tokio::spawn(async move {
                                        Self::execute_job(ctx, broker, consumer, delivery).await;
                                        drop(permit);
                                        metrics::set_jobs_in_flight(slots - semaphore.available_permits());
                                    });
                                }
                            }
                            Err(e) => {
                                if failures.record_failure() {
                                    warn!("Failed to claim stalled jobs: {}", e);
                                }
                            }
                        }
                    }
                }
            }
        })
    }

    /// Move due retries back onto the queue.
    fn spawn_promote_task(&self) -> JoinHandle<()> {
        let broker = Arc::clone(&self.broker);
        let interval = self.config.promote_interval;
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut failures = FailureTracker::new(3);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => match broker.promote_due().await {
                        Ok(0) => failures.record_success(),
                        Ok(n) => {
                            failures.record_success();
                            debug!("Promoted {} due retries", n);
                        }
                        Err(e) => {
                            if failures.record_failure() {
                                warn!("Failed to promote due retries: {}", e);
                            }
                        }
                    }
                }
            }
        })
    }

    async fn execute_job(
        ctx: Arc<ProcessingContext>,
        broker: Arc<dyn JobBroker>,
        consumer: String,
        delivery: Delivery,
    ) -> JobOutcome {
        let QueueJob::UploadFile(job) = &delivery.job;
        let logger = JobLogger::new(&job.job_id, delivery.job.task_name(), delivery.attempt);
        let span = logger.create_span();

        async {
            let heartbeat = HeartbeatGuard(spawn_heartbeat(
                Arc::clone(&broker),
                consumer,
                delivery.message_id.clone(),
                ctx.config.lock_renew_interval,
            ));
            let result = Self::run_isolated(&ctx, job, delivery.attempt).await;
            drop(heartbeat);

            let outcome = match result {
                Ok(report) => Self::report_success(&broker, &delivery, report).await,
                Err(e) => Self::report_failure(&ctx, &broker, &delivery, &logger, e).await,
            };

            let state = outcome.state();
            if state.is_terminal() {
                remove_file_best_effort(job.source_path()).await;
            }
            debug!(state = %state, "Job released");
            outcome
        }
        .instrument(span)
        .await
    }

    /// Run the job on its own task so a panic surfaces as a failed attempt.
    async fn run_isolated(
        ctx: &Arc<ProcessingContext>,
        job: &UploadFileJob,
        attempt: u32,
    ) -> WorkerResult<JobReport> {
        let ctx = Arc::clone(ctx);
        let job = job.clone();
        let task = tokio::spawn(
            async move { process_upload(&ctx, &job, attempt).await }.in_current_span(),
        );

        match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(WorkerError::job_failed("processing panicked")),
            Err(e) => Err(WorkerError::job_failed(format!("processing task ended: {}", e))),
        }
    }

    async fn report_success(broker: &Arc<dyn JobBroker>, delivery: &Delivery, report: JobReport) -> JobOutcome {
        let acked = retry_async("ack", REPORT_ATTEMPTS, REPORT_PAUSE, || {
            broker.ack(&delivery.message_id)
        })
        .await;

        match acked {
            Ok(()) => {
                metrics::record_job_completed(report.elapsed);
                JobOutcome::Completed(report)
            }
            Err(e) => {
                error!("Job {} finished but could not be acked: {}", report.job_id, e);
                JobOutcome::Unreported { error: e.to_string() }
            }
        }
    }

    async fn report_failure(
        ctx: &ProcessingContext,
        broker: &Arc<dyn JobBroker>,
        delivery: &Delivery,
        logger: &JobLogger,
        err: WorkerError,
    ) -> JobOutcome {
        let error = err.to_string();
        metrics::record_job_failed(err.stage().unwrap_or("setup"));

        let decision = ctx.config.retry.decide(
            delivery.attempt,
            broker.max_attempts(),
            err.is_permanent_failure(),
        );

        let reported: Result<JobOutcome, QueueError> = match decision {
            RetryDecision::Retry(delay) => {
                retry_async("schedule_retry", REPORT_ATTEMPTS, REPORT_PAUSE, || {
                    broker.schedule_retry(delivery, delay)
                })
                .await
                .map(|()| {
                    metrics::record_job_retried();
                    logger.log_warning(&format!(
                        "attempt {}/{} failed, retrying in {:?}: {}",
                        delivery.attempt,
                        broker.max_attempts(),
                        delay,
                        error
                    ));
                    JobOutcome::RetryScheduled {
                        next_attempt: delivery.attempt + 1,
                        delay,
                        error: error.clone(),
                    }
                })
            }
            RetryDecision::DeadLetter => {
                retry_async("dead_letter", REPORT_ATTEMPTS, REPORT_PAUSE, || {
                    broker.dead_letter(delivery, &error)
                })
                .await
                .map(|()| {
                    metrics::record_job_dead_lettered();
                    logger.log_error(&format!(
                        "giving up after attempt {}, moved to dead-letter queue: {}",
                        delivery.attempt, error
                    ));
                    JobOutcome::DeadLettered { error: error.clone() }
                })
            }
        };

        reported.unwrap_or_else(|e| {
            logger.log_error(&format!("could not report failure to the broker: {}", e));
            JobOutcome::Unreported { error }
        })
    }

    fn in_flight(&self) -> usize {
        self.config.max_concurrent_jobs - self.job_semaphore.available_permits()
    }

    async fn wait_for_jobs(&self) {
        while self.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Stops the heartbeat when the job's execution ends, however it ends.
struct HeartbeatGuard(JoinHandle<()>);

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Keep renewing the job's lock until aborted or the lock is lost.
fn spawn_heartbeat(
    broker: Arc<dyn JobBroker>,
    consumer: String,
    message_id: String,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        let mut failures = FailureTracker::new(3);

        loop {
            ticker.tick().await;
            match broker.renew(&consumer, &message_id).await {
                Ok(()) => failures.record_success(),
                Err(QueueError::LockLost(_)) => {
                    warn!(message_id = %message_id, "Lost the lock on a running job; another worker may redeliver it");
                    return;
                }
                Err(e) => {
                    if failures.record_failure() {
                        warn!(message_id = %message_id, "Failed to renew job lock: {}", e);
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::testing::{FakeTranscoder, RecordingStore};
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;
    use vidpipe_media::PipelineConfig;
    use vidpipe_models::UploadedFile;
    use vidpipe_queue::{JobDispatcher, MemoryQueue};
    use vidpipe_storage::UploaderConfig;

    const NO_WAIT: Duration = Duration::from_millis(1);

    struct Harness {
        dir: TempDir,
        queue: Arc<MemoryQueue>,
        store: Arc<RecordingStore>,
        executor: Arc<JobExecutor>,
    }

    impl Harness {
        fn new(transcoder: FakeTranscoder, max_attempts: u32) -> Self {
            let dir = TempDir::new().unwrap();
            let queue = Arc::new(MemoryQueue::new(max_attempts, Duration::from_secs(600)));
            let store = Arc::new(RecordingStore::default());
            let config = WorkerConfig {
                work_dir: dir.path().join("chunks"),
                claim_interval: Duration::from_millis(20),
                promote_interval: Duration::from_millis(10),
                consume_block: Duration::from_millis(20),
                shutdown_timeout: Duration::from_secs(5),
                retry: RetryPolicy {
                    base_delay: Duration::from_millis(10),
                    max_delay: Duration::from_millis(50),
                },
                ..Default::default()
            };
            let ctx = ProcessingContext::new(
                config,
                Arc::new(transcoder),
                PipelineConfig::default(),
                store.clone(),
                UploaderConfig {
                    part_size: 64,
                    key_prefix: "files".to_string(),
                },
                "bucket",
            );
            let executor = Arc::new(JobExecutor::new(ctx, queue.clone()));

            Self {
                dir,
                queue,
                store,
                executor,
            }
        }

        async fn submit(&self, name: &str) -> PathBuf {
            let uploads = self.dir.path().join("uploads");
            tokio::fs::create_dir_all(&uploads).await.unwrap();
            let input = uploads.join(name);
            tokio::fs::write(&input, vec![1u8; 500]).await.unwrap();

            JobDispatcher::new(self.queue.clone())
                .enqueue_file(UploadedFile::new(&input, name, 500))
                .await
                .unwrap();
            input
        }

        async fn next_delivery(&self) -> Delivery {
            self.queue
                .consume(self.executor.consumer_name(), NO_WAIT, 1)
                .await
                .unwrap()
                .remove(0)
        }

        fn work_dir(&self) -> PathBuf {
            self.dir.path().join("chunks")
        }
    }

    async fn residual_entries(dir: &Path) -> usize {
        let Ok(mut read) = tokio::fs::read_dir(dir).await else {
            return 0;
        };
        let mut count = 0;
        while read.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        count
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_success_acks_and_deletes_input() {
        let h = Harness::new(FakeTranscoder::new(3, 100), 3);
        let input = h.submit("talk.mp4").await;
        let delivery = h.next_delivery().await;

        let outcome = h.executor.execute(delivery).await;

        let JobOutcome::Completed(report) = outcome else {
            panic!("expected completion, got {:?}", outcome);
        };
        assert_eq!(report.segments, 3);
        assert_eq!(report.parts, 5);
        assert_eq!(h.store.part_numbers(), vec![1, 2, 3, 4, 5]);
        assert_eq!(h.queue.len().await.unwrap(), 0);
        assert!(!input.exists());
        assert_eq!(residual_entries(&h.work_dir()).await, 0);
    }

    #[tokio::test]
    async fn test_failure_with_attempts_left_schedules_retry_and_keeps_input() {
        let h = Harness::new(FakeTranscoder::new(3, 100).failing_at(1), 3);
        let input = h.submit("talk.mp4").await;
        let delivery = h.next_delivery().await;

        let outcome = h.executor.execute(delivery).await;

        match outcome {
            JobOutcome::RetryScheduled { next_attempt, delay, error } => {
                assert_eq!(next_attempt, 2);
                assert_eq!(delay, Duration::from_millis(10));
                assert!(error.contains("transcode"));
            }
            other => panic!("expected retry, got {:?}", other),
        }
        assert!(input.exists());
        assert_eq!(h.queue.delayed_len().await, 1);
        assert_eq!(h.queue.pending_len().await, 0);
        assert_eq!(h.store.initiated(), 0);
        assert_eq!(residual_entries(&h.work_dir()).await, 0);
    }

    #[tokio::test]
    async fn test_panicking_job_releases_its_lock_and_retries() {
        let h = Harness::new(FakeTranscoder::new(3, 100).panicking_at(1), 3);
        let input = h.submit("talk.mp4").await;
        let delivery = h.next_delivery().await;

        let outcome = h.executor.execute(delivery).await;

        match outcome {
            JobOutcome::RetryScheduled { next_attempt, error, .. } => {
                assert_eq!(next_attempt, 2);
                assert!(error.contains("panicked"));
            }
            other => panic!("expected retry, got {:?}", other),
        }
        assert_eq!(h.queue.pending_len().await, 0);
        assert_eq!(h.queue.delayed_len().await, 1);
        assert!(input.exists());
        assert_eq!(residual_entries(&h.work_dir()).await, 0);
    }

    #[tokio::test]
    async fn test_heartbeat_stops_when_guard_drops() {
        let queue = Arc::new(MemoryQueue::new(3, Duration::from_secs(600)));
        let job: QueueJob = UploadFileJob::new(UploadedFile::new("uploads/a.mp4", "a.mp4", 1)).into();
        queue.enqueue(&job).await.unwrap();
        let held = queue.consume("w1", NO_WAIT, 1).await.unwrap().remove(0);

        let handle = spawn_heartbeat(
            queue.clone(),
            "w1".to_string(),
            held.message_id.clone(),
            Duration::from_millis(5),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(Arc::strong_count(&queue), 2);
        let guard = HeartbeatGuard(handle);
        drop(guard);

        // The aborted task releases its reference to the queue
        tokio::time::timeout(Duration::from_secs(5), async {
            while Arc::strong_count(&queue) > 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("heartbeat still running");
    }

    #[tokio::test]
    async fn test_last_attempt_is_dead_lettered_and_input_removed() {
        let h = Harness::new(FakeTranscoder::new(3, 100).failing_at(1), 1);
        let input = h.submit("talk.mp4").await;
        let delivery = h.next_delivery().await;

        let outcome = h.executor.execute(delivery).await;

        assert!(matches!(outcome, JobOutcome::DeadLettered { .. }));
        let dead = h.queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert!(dead[0].error.contains("transcode"));
        assert!(!input.exists());
        assert_eq!(h.store.open_sessions(), 0);
        assert_eq!(residual_entries(&h.work_dir()).await, 0);
    }

    #[tokio::test]
    async fn test_missing_input_skips_retries() {
        let h = Harness::new(FakeTranscoder::new(1, 100), 3);
        let input = h.submit("gone.mp4").await;
        tokio::fs::remove_file(&input).await.unwrap();
        let delivery = h.next_delivery().await;

        let outcome = h.executor.execute(delivery).await;

        assert!(matches!(outcome, JobOutcome::DeadLettered { .. }));
        assert_eq!(h.queue.delayed_len().await, 0);
    }

    #[tokio::test]
    async fn test_run_processes_queue_until_shutdown() {
        let h = Harness::new(FakeTranscoder::new(3, 100), 3);
        let first = h.submit("a.mp4").await;
        let second = h.submit("b.mp4").await;

        let runner = {
            let executor = Arc::clone(&h.executor);
            tokio::spawn(async move { executor.run().await })
        };

        let store = Arc::clone(&h.store);
        wait_until(|| {
            let store = Arc::clone(&store);
            async move { store.completed_keys().len() == 2 }
        })
        .await;
        let queue = Arc::clone(&h.queue);
        wait_until(|| {
            let queue = Arc::clone(&queue);
            async move { queue.len().await.unwrap() == 0 }
        })
        .await;

        h.executor.shutdown();
        runner.await.unwrap().unwrap();

        assert!(!first.exists());
        assert!(!second.exists());
        assert_eq!(residual_entries(&h.work_dir()).await, 0);
    }

    #[tokio::test]
    async fn test_run_retries_then_dead_letters() {
        let h = Harness::new(FakeTranscoder::new(3, 100).failing_at(1), 2);
        let input = h.submit("bad.mp4").await;

        let runner = {
            let executor = Arc::clone(&h.executor);
            tokio::spawn(async move { executor.run().await })
        };

        let queue = Arc::clone(&h.queue);
        wait_until(|| {
            let queue = Arc::clone(&queue);
            async move { queue.dead_letters().await.len() == 1 }
        })
        .await;

        h.executor.shutdown();
        runner.await.unwrap().unwrap();

        let dead = h.queue.dead_letters().await;
        assert_eq!(dead[0].attempt, 2);
        assert!(!input.exists());
        assert_eq!(h.store.initiated(), 0);
        assert_eq!(residual_entries(&h.work_dir()).await, 0);
    }
}
