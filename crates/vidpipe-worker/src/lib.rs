//! Upload job worker.
//!
//! Consumes `upload-file` jobs, runs each through the split / transcode / concat pipeline inside
//! a private workspace and stores the result with a multipart upload.

pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod processor;
pub mod retry;

#[cfg(test)]
mod testing;

pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use executor::{JobExecutor, JobOutcome};
pub use logging::JobLogger;
pub use processor::{process_upload, JobReport, ProcessingContext};
pub use retry::{RetryDecision, RetryPolicy};
