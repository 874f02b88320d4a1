//! Worker configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{WorkerError, WorkerResult};
use crate::retry::RetryPolicy;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Jobs processed at once
    pub max_concurrent_jobs: usize,
    /// Base directory for per-job workspaces
    pub work_dir: PathBuf,
    /// How often a running job renews its claim
    pub lock_renew_interval: Duration,
    /// How often the worker sweeps for jobs abandoned by crashed workers
    pub claim_interval: Duration,
    /// How often due retries are moved back onto the queue
    pub promote_interval: Duration,
    /// Longest a consume call blocks waiting for work
    pub consume_block: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// Backoff between attempts of a failed job
    pub retry: RetryPolicy,
    /// Prometheus scrape address; metrics are not exported when unset
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            work_dir: PathBuf::from("./uploads/chunks"),
            lock_renew_interval: Duration::from_secs(30),
            claim_interval: Duration::from_secs(30),
            promote_interval: Duration::from_secs(1),
            consume_block: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            metrics_addr: None,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            max_concurrent_jobs: env_parse("WORKER_CONCURRENCY")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_concurrent_jobs),
            work_dir: std::env::var("WORKER_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            lock_renew_interval: env_parse("WORKER_LOCK_RENEW_SECS")
                .filter(|n: &u64| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_renew_interval),
            claim_interval: env_parse("WORKER_CLAIM_INTERVAL_SECS")
                .filter(|n: &u64| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.claim_interval),
            promote_interval: env_parse("WORKER_PROMOTE_INTERVAL_MS")
                .filter(|n: &u64| *n > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.promote_interval),
            consume_block: defaults.consume_block,
            shutdown_timeout: env_parse("WORKER_SHUTDOWN_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
            retry: RetryPolicy::from_env(),
            metrics_addr: env_parse("WORKER_METRICS_ADDR"),
        }
    }
}

impl WorkerConfig {
    /// Check the timers against each other and against the broker's claim lock.
    pub fn validate(&self, lock_duration: Duration) -> WorkerResult<()> {
        let timers = [
            ("lock_renew_interval", self.lock_renew_interval),
            ("claim_interval", self.claim_interval),
            ("promote_interval", self.promote_interval),
        ];
        if let Some((name, _)) = timers.iter().find(|(_, d)| d.is_zero()) {
            return Err(WorkerError::config_error(format!("{} must be greater than zero", name)));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(WorkerError::config_error("max_concurrent_jobs must be greater than zero"));
        }
        if self.lock_renew_interval >= lock_duration {
            return Err(WorkerError::config_error(format!(
                "lock_renew_interval ({:?}) must be shorter than the queue lock ({:?})",
                self.lock_renew_interval, lock_duration
            )));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}
