//! Job types for the queue.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vidpipe_models::{JobId, UploadedFile};

use crate::error::{QueueError, QueueResult};

/// Task type for upload jobs.
pub const UPLOAD_FILE_TASK: &str = "upload-file";

/// Transcode a stored upload and push the result to object storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadFileJob {
    /// Unique job ID
    pub job_id: JobId,
    /// The upload as written to local disk
    pub file: UploadedFile,
    pub enqueued_at: DateTime<Utc>,
}

impl UploadFileJob {
    pub fn new(file: UploadedFile) -> Self {
        Self {
            job_id: JobId::new(),
            file,
            enqueued_at: Utc::now(),
        }
    }

    /// Local input path.
    pub fn source_path(&self) -> PathBuf {
        self.file.local_path()
    }
}

/// Every job the queue carries.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueJob {
    UploadFile(UploadFileJob),
}

impl QueueJob {
    pub fn job_id(&self) -> &JobId {
        match self {
            QueueJob::UploadFile(j) => &j.job_id,
        }
    }

    /// Value of the stream's `task` field.
    pub fn task_name(&self) -> &'static str {
        match self {
            QueueJob::UploadFile(_) => UPLOAD_FILE_TASK,
        }
    }

    /// Value of the stream's `job` field.
    pub fn payload(&self) -> QueueResult<String> {
        let payload = match self {
            QueueJob::UploadFile(j) => serde_json::to_string(j)?,
        };
        Ok(payload)
    }

    /// Rebuild a job from its `task` and `job` fields.
    pub fn decode(task: &str, payload: &str) -> QueueResult<Self> {
        match task {
            UPLOAD_FILE_TASK => serde_json::from_str(payload)
                .map(QueueJob::UploadFile)
                .map_err(|e| QueueError::malformed(format!("{} payload: {}", task, e))),
            other => Err(QueueError::malformed(format!("unknown task type `{}`", other))),
        }
    }
}

impl From<UploadFileJob> for QueueJob {
    fn from(job: UploadFileJob) -> Self {
        QueueJob::UploadFile(job)
    }
}

/// A job handed to a consumer, with its broker bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Broker message id, used to ack, renew, retry or dead-letter
    pub message_id: String,
    pub job: QueueJob,
    /// 1 on first delivery, incremented for each scheduled retry
    pub attempt: u32,
}
