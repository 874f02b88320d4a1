//! Redis Streams job queue.
//!
//! This crate provides:
//! - The `upload-file` job type and its wire format
//! - A broker trait with Redis Streams and in-memory implementations
//! - Claim locks, delayed retries and a dead-letter queue
//! - The dispatcher the upload boundary enqueues through

pub mod broker;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod memory;
pub mod queue;

pub use broker::JobBroker;
pub use dispatcher::JobDispatcher;
pub use error::{QueueError, QueueResult};
pub use job::{Delivery, QueueJob, UploadFileJob, UPLOAD_FILE_TASK};
pub use memory::{DeadLetter, MemoryQueue};
pub use queue::{JobQueue, QueueConfig};
