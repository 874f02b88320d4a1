//! API routes.

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::handlers::{health, ready, upload_file};
use crate::metrics::metrics_middleware;
use crate::middleware::{cors_layer, request_id, request_logging};
use crate::state::AppState;

/// Room for multipart boundaries and part headers on top of the file itself.
const MULTIPART_OVERHEAD_BYTES: u64 = 1024 * 1024;

/// Create the API router.
pub fn create_router(state: AppState, metrics_handle: Option<PrometheusHandle>) -> Router {
    let body_limit = usize::try_from(
        state
            .config
            .max_upload_bytes()
            .saturating_add(MULTIPART_OVERHEAD_BYTES),
    )
    .unwrap_or(usize::MAX);

    let file_routes = Router::new()
        .route("/v1/files", post(upload_file))
        .layer(DefaultBodyLimit::max(body_limit));

    let health_routes = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready));

    let metrics_routes = if let Some(handle) = metrics_handle {
        Router::new().route("/metrics", get(move || async move { handle.render() }))
    } else {
        Router::new()
    };

    let cors = cors_layer(&state.config.cors_origins);

    Router::new()
        .nest("/api", file_routes)
        .merge(health_routes)
        .merge(metrics_routes)
        .route_layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id))
        .layer(middleware::from_fn(request_logging))
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiConfig;
    use crate::handlers::UploadResponse;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;
    use vidpipe_queue::{
        Delivery, JobBroker, MemoryQueue, QueueError, QueueJob, QueueResult,
    };

    const BOUNDARY: &str = "vidpipe-test-boundary";

    /// Broker that refuses every call, as when Redis is down.
    struct DownBroker;

    #[async_trait]
    impl JobBroker for DownBroker {
        async fn enqueue(&self, _: &QueueJob) -> QueueResult<String> {
            Err(QueueError::connection_failed("Connection refused"))
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

    fn app(dir: &TempDir, broker: Arc<dyn JobBroker>, max_upload_mb: u64) -> Router {
        let config = ApiConfig {
            upload_dir: dir.path().join("uploads"),
            max_upload_mb,
            ..Default::default()
        };
        create_router(AppState::new(config, broker), None)
    }

    fn multipart_request(field: &str, file_name: &str, content: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\nContent-Type: video/mp4\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/api/v1/files")
            .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from(body))
            .unwrap()
    }

    async fn stored_files(dir: &Path) -> Vec<String> {
        let mut names = Vec::new();
        let Ok(mut read) = tokio::fs::read_dir(dir).await else {
            return names;
        };
        while let Some(entry) = read.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names
    }

    #[tokio::test]
    async fn test_upload_stores_file_and_enqueues_job() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(MemoryQueue::default());
        let app = app(&dir, queue.clone(), 1);

        let response = app
            .oneshot(multipart_request("file", "holiday.mp4", b"fake video bytes"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: UploadResponse = serde_json::from_slice(&body).unwrap();

        let files = stored_files(&dir.path().join("uploads")).await;
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with("holiday-") && files[0].ends_with(".mp4"));

        let delivery = queue
            .consume("test", Duration::from_millis(1), 1)
            .await
            .unwrap()
            .remove(0);
        let QueueJob::UploadFile(job) = delivery.job;
        assert_eq!(job.job_id, parsed.job_id);
        assert_eq!(job.file.original_name, "holiday.mp4");
        assert_eq!(job.file.size, 16);
        assert!(job.source_path().ends_with(&files[0]));
    }

    #[tokio::test]
    async fn test_wrong_extension_is_unprocessable() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(MemoryQueue::default());
        let app = app(&dir, queue.clone(), 1);

        let response = app
            .oneshot(multipart_request("file", "notes.txt", b"hello"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(stored_files(&dir.path().join("uploads")).await.is_empty());
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_oversized_upload_is_unprocessable_and_removed() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(MemoryQueue::default());
        let app = app(&dir, queue.clone(), 1);

        let content = vec![0u8; 1_000_001];
        let response = app
            .oneshot(multipart_request("file", "big.MOV", &content))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(stored_files(&dir.path().join("uploads")).await.is_empty());
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_file_field_is_unprocessable() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir, Arc::new(MemoryQueue::default()), 1);

        let response = app
            .oneshot(multipart_request("attachment", "clip.mp4", b"data"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_queue_failure_returns_500_and_removes_file() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir, Arc::new(DownBroker), 1);

        let response = app
            .oneshot(multipart_request("file", "clip.mp4", b"data"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["statusCode"], 500);
        assert_eq!(json["message"], "Error during upload file");
        assert!(stored_files(&dir.path().join("uploads")).await.is_empty());
    }

    #[tokio::test]
    async fn test_health_and_readiness() {
        let dir = TempDir::new().unwrap();

        let response = app(&dir, Arc::new(MemoryQueue::default()), 1)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app(&dir, Arc::new(MemoryQueue::default()), 1)
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app(&dir, Arc::new(DownBroker), 1)
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
