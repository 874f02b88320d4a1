//! Worker metrics and per-stage timing.

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use sysinfo::{ProcessExt, System, SystemExt};
use tracing::{debug, info};
use vidpipe_media::PipelineStage;

use crate::error::{WorkerError, WorkerResult};

/// Metric names as constants for consistency.
pub mod names {
    pub const JOBS_COMPLETED_TOTAL: &str = "vidpipe_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "vidpipe_jobs_failed_total";
    pub const JOBS_RETRIED_TOTAL: &str = "vidpipe_jobs_retried_total";
    pub const JOBS_DEAD_LETTERED_TOTAL: &str = "vidpipe_jobs_dead_lettered_total";
    pub const JOB_DURATION_SECONDS: &str = "vidpipe_job_duration_seconds";
    pub const STAGE_DURATION_SECONDS: &str = "vidpipe_stage_duration_seconds";
    pub const JOBS_IN_FLIGHT: &str = "vidpipe_jobs_in_flight";
}

/// Serve Prometheus metrics on `addr`.
pub fn init_exporter(addr: SocketAddr) -> WorkerResult<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| WorkerError::config_error(format!("metrics exporter: {}", e)))?;
    info!("Serving worker metrics on {}", addr);
    Ok(())
}

pub fn record_job_completed(duration: Duration) {
    counter!(names::JOBS_COMPLETED_TOTAL).increment(1);
    histogram!(names::JOB_DURATION_SECONDS).record(duration.as_secs_f64());
}

pub fn record_job_failed(stage: &str) {
    counter!(names::JOBS_FAILED_TOTAL, "stage" => stage.to_string()).increment(1);
}

pub fn record_job_retried() {
    counter!(names::JOBS_RETRIED_TOTAL).increment(1);
}

pub fn record_job_dead_lettered() {
    counter!(names::JOBS_DEAD_LETTERED_TOTAL).increment(1);
}

pub fn set_jobs_in_flight(count: usize) {
    metrics::gauge!(names::JOBS_IN_FLIGHT).set(count as f64);
}

/// Resident set size of this process in bytes.
pub fn resident_memory() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut sys = System::new();
    if !sys.refresh_process(pid) {
        return None;
    }
    sys.process(pid).map(|p| p.memory())
}

/// Time and memory spent in one stage of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTiming {
    pub stage: String,
    pub duration: Duration,
    /// Change in resident memory across the stage; 0 when unavailable
    pub memory_delta_bytes: i64,
}

#[derive(Debug)]
struct OpenStage {
    label: String,
    started: Instant,
    memory_at_start: Option<u64>,
}

#[derive(Debug, Default)]
struct RecorderState {
    current: Option<OpenStage>,
    finished: Vec<StageTiming>,
}

/// Collects [`StageTiming`]s for one job as it moves through its stages.
///
/// Consecutive transitions with the same label (one per transcoded segment) count as one stage.
#[derive(Debug)]
pub struct StageRecorder {
    job_id: String,
    sample_memory: bool,
    state: Mutex<RecorderState>,
}

impl StageRecorder {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            sample_memory: true,
            state: Mutex::new(RecorderState::default()),
        }
    }

    /// Recorder that skips memory sampling.
    pub fn without_memory(job_id: impl Into<String>) -> Self {
        Self {
            sample_memory: false,
            ..Self::new(job_id)
        }
    }

    /// Close the current stage (if any) and open `label`.
    pub fn enter(&self, label: &str) {
        let mut state = self.lock();
        if state.current.as_ref().is_some_and(|s| s.label == label) {
            return;
        }
        self.close(&mut state);
        state.current = Some(OpenStage {
            label: label.to_string(),
            started: Instant::now(),
            memory_at_start: self.memory(),
        });
    }

    /// Feed a pipeline transition.
    pub fn observe(&self, stage: &PipelineStage) {
        if stage.is_terminal() {
            self.finish();
        } else {
            self.enter(stage.label());
        }
    }

    /// Close the current stage.
    pub fn finish(&self) {
        let mut state = self.lock();
        self.close(&mut state);
    }

    pub fn timings(&self) -> Vec<StageTiming> {
        self.lock().finished.clone()
    }

    /// One-line rendering such as `split=1.20s/+2048KiB transcode=30.01s/+512KiB`.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for timing in self.lock().finished.iter() {
            if !out.is_empty() {
                out.push(' ');
            }
            let _ = write!(
                out,
                "{}={:.2}s/{:+}KiB",
                timing.stage,
                timing.duration.as_secs_f64(),
                timing.memory_delta_bytes / 1024
            );
        }
        out
    }

    fn close(&self, state: &mut RecorderState) {
        let Some(open) = state.current.take() else {
            return;
        };

        let duration = open.started.elapsed();
        let memory_delta_bytes = match (open.memory_at_start, self.memory()) {
            (Some(start), Some(end)) => end as i64 - start as i64,
            _ => 0,
        };

        histogram!(names::STAGE_DURATION_SECONDS, "stage" => open.label.clone())
            .record(duration.as_secs_f64());
        debug!(
            job_id = %self.job_id,
            stage = %open.label,
            duration_ms = duration.as_millis() as u64,
            memory_delta_bytes,
            "Stage finished"
        );

        state.finished.push(StageTiming {
            stage: open.label,
            duration,
            memory_delta_bytes,
        });
    }

    fn memory(&self) -> Option<u64> {
        if self.sample_memory {
            resident_memory()
        } else {
            None
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
