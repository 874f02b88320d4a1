//! Axum HTTP API for vidpipe.
//!
//! This crate provides:
//! - The multipart upload endpoint that stores files and dispatches upload jobs
//! - Liveness and readiness probes
//! - Request id, request logging, CORS and Prometheus middleware

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
