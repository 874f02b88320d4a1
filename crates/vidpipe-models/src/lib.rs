//! Shared data models for the vidpipe transcoding pipeline.
//!
//! This crate provides:
//! - Job identifiers and lifecycle states
//! - The uploaded-file descriptor carried in queue payloads
//! - Identifier generation, content digests and HMAC signing

pub mod crypto;
pub mod job;
pub mod upload;

// Re-export common types
pub use crypto::{
    compare_with_hash, hash, hmac_digest, new_identifier, random_code, sign, verify,
    CryptoError, CryptoResult, HashAlgorithm,
};
pub use job::{JobId, JobState};
pub use upload::UploadedFile;
