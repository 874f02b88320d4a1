//! Hands accepted uploads to the broker.

use std::sync::Arc;

use tracing::{error, info};
use vidpipe_models::{JobId, UploadedFile};

use crate::broker::JobBroker;
use crate::error::{QueueError, QueueResult};
use crate::job::{QueueJob, UploadFileJob};

/// Enqueues upload jobs. Broker failures surface as [`QueueError::Unavailable`]; there is no
/// local retry.
#[derive(Clone)]
pub struct JobDispatcher {
    broker: Arc<dyn JobBroker>,
}

impl JobDispatcher {
    pub fn new(broker: Arc<dyn JobBroker>) -> Self {
        Self { broker }
    }

    /// Place `job` on the queue under the `upload-file` task type.
    pub async fn enqueue(&self, job: UploadFileJob) -> QueueResult<String> {
        let job_id = job.job_id.clone();
        let job = QueueJob::UploadFile(job);

        match self.broker.enqueue(&job).await {
            Ok(message_id) => {
                metrics::counter!("vidpipe_jobs_enqueued_total", "task" => job.task_name())
                    .increment(1);
                info!(job_id = %job_id, message_id = %message_id, "Upload job dispatched");
                Ok(message_id)
            }
            Err(e) => {
                metrics::counter!("vidpipe_enqueue_failures_total").increment(1);
                error!(job_id = %job_id, "Failed to enqueue upload job: {}", e);
                Err(QueueError::unavailable(e.to_string()))
            }
        }
    }

    /// Build a job for `file` and enqueue it.
    pub async fn enqueue_file(&self, file: UploadedFile) -> QueueResult<JobId> {
        let job = UploadFileJob::new(file);
        let job_id = job.job_id.clone();
        self.enqueue(job).await?;
        Ok(job_id)
    }

    /// Broker reachability, for readiness probes.
    pub async fn ping(&self) -> QueueResult<()> {
        self.broker.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryQueue;
    use crate::job::Delivery;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Broker whose every call fails as if Redis were down.
    struct DownBroker;

    #[async_trait]
    impl JobBroker for DownBroker {
        async fn enqueue(&self, _job: &QueueJob) -> QueueResult<String> {
            Err(QueueError::connection_failed("Connection refused (os error 111)"))
        }
        async fn consume(&self, _: &str, _: Duration, _: usize) -> QueueResult<Vec<Delivery>> {
            Err(QueueError::connection_failed("down"))
        }
        async fn claim_stalled(&self, _: &str, _: usize) -> QueueResult<Vec<Delivery>> {
            Err(QueueError::connection_failed("down"))
        }
        async fn renew(&self, _: &str, _: &str) -> QueueResult<()> {
            Err(QueueError::connection_failed("down"))
        }
        async fn ack(&self, _: &str) -> QueueResult<()> {
            Err(QueueError::connection_failed("down"))
        }
        async fn schedule_retry(&self, _: &Delivery, _: Duration) -> QueueResult<()> {
            Err(QueueError::connection_failed("down"))
        }
        async fn promote_due(&self) -> QueueResult<usize> {
            Err(QueueError::connection_failed("down"))
        }
        async fn dead_letter(&self, _: &Delivery, _: &str) -> QueueResult<()> {
            Err(QueueError::connection_failed("down"))
        }
        async fn len(&self) -> QueueResult<u64> {
            Err(QueueError::connection_failed("down"))
        }
        async fn ping(&self) -> QueueResult<()> {
            Err(QueueError::connection_failed("down"))
        }
        fn max_attempts(&self) -> u32 {
            3
        }
        fn lock_duration(&self) -> Duration {
            Duration::from_secs(600)
        }
    }

    fn file() -> UploadedFile {
        UploadedFile::new("uploads/clip-1.mp4", "clip.mp4", 100)
    }

    #[tokio::test]
    async fn test_enqueue_places_upload_task() {
        let queue = Arc::new(MemoryQueue::default());
        let dispatcher = JobDispatcher::new(queue.clone());

        let job_id = dispatcher.enqueue_file(file()).await.unwrap();

        let delivered = queue.consume("w", Duration::from_millis(1), 10).await.unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].job.task_name(), "upload-file");
        assert_eq!(delivered[0].job.job_id(), &job_id);
    }

    #[tokio::test]
    async fn test_broker_failure_is_unavailable() {
        let dispatcher = JobDispatcher::new(Arc::new(DownBroker));

        let err = dispatcher.enqueue(UploadFileJob::new(file())).await.unwrap_err();
        assert!(matches!(err, QueueError::Unavailable(_)));
        assert!(err.to_string().contains("Connection refused"));
    }
}
