//! Structured job logging.
//!
//! Every line carries the job id, the task and the delivery attempt so one job can be followed
//! across retries and workers.

use tracing::{error, info, warn, Span};
use vidpipe_models::JobId;

/// Job-scoped logger.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    task: String,
    attempt: u32,
}

impl JobLogger {
    pub fn new(job_id: &JobId, task: &str, attempt: u32) -> Self {
        Self::from_string(job_id.as_str(), task, attempt)
    }

    pub fn from_string(job_id: &str, task: &str, attempt: u32) -> Self {
        Self {
            job_id: job_id.to_string(),
            task: task.to_string(),
            attempt,
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            task = %self.task,
            attempt = self.attempt,
            "Job started: {}", message
        );
    }

    pub fn log_progress(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            task = %self.task,
            attempt = self.attempt,
            "Job progress: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            task = %self.task,
            attempt = self.attempt,
            "Job warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            task = %self.task,
            attempt = self.attempt,
            "Job error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            task = %self.task,
            attempt = self.attempt,
            "Job completed: {}", message
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Span to instrument the whole job with.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            task = %self.task,
            attempt = self.attempt
        )
    }
}
