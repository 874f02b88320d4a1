//! Processing of a single `upload-file` job.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use vidpipe_media::{
    FfmpegTranscoder, PipelineConfig, ProcessingWorkspace, TranscodePipeline, Transcoder,
};
use vidpipe_models::JobId;
use vidpipe_queue::{UploadFileJob, UPLOAD_FILE_TASK};
use vidpipe_storage::{object_key, MultipartStore, MultipartUploader, S3Client, UploaderConfig};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics::{StageRecorder, StageTiming};

/// Shared services a job runs against.
pub struct ProcessingContext {
    pub config: WorkerConfig,
    pub pipeline: TranscodePipeline,
    pub uploader: MultipartUploader,
    pub bucket: String,
}

impl ProcessingContext {
    pub fn new(
        config: WorkerConfig,
        transcoder: Arc<dyn Transcoder>,
        pipeline_config: PipelineConfig,
        store: Arc<dyn MultipartStore>,
        uploader_config: UploaderConfig,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            config,
            pipeline: TranscodePipeline::new(transcoder, pipeline_config),
            uploader: MultipartUploader::new(store, uploader_config),
            bucket: bucket.into(),
        }
    }

    /// FFmpeg transcoder and S3 storage, configured from the environment.
    pub fn from_env(config: WorkerConfig) -> WorkerResult<Self> {
        let pipeline_config = PipelineConfig::from_env();
        let transcoder = FfmpegTranscoder::with_timeout(pipeline_config.ffmpeg_timeout_secs);
        let s3 = S3Client::from_env()?;
        let bucket = s3.bucket().to_string();

        Ok(Self::new(
            config,
            Arc::new(transcoder),
            pipeline_config,
            Arc::new(s3),
            UploaderConfig::from_env(),
            bucket,
        ))
    }
}

/// What a successful job produced.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: JobId,
    pub bucket: String,
    pub object_key: String,
    pub segments: usize,
    pub parts: usize,
    pub bytes: u64,
    pub elapsed: Duration,
    pub timings: Vec<StageTiming>,
}

/// Transcode the job's input and store the result.
///
/// The job's workspace is always destroyed before this returns. The input file is left in place;
/// whether it goes depends on the retry decision.
pub async fn process_upload(
    ctx: &ProcessingContext,
    job: &UploadFileJob,
    attempt: u32,
) -> WorkerResult<JobReport> {
    let logger = JobLogger::new(&job.job_id, UPLOAD_FILE_TASK, attempt);
    let input = job.source_path();
    if !tokio::fs::try_exists(&input).await.unwrap_or(false) {
        return Err(WorkerError::MissingInput(input));
    }

    logger.log_start(&format!(
        "{} ({} bytes) from {}",
        job.file.original_name,
        job.file.size,
        input.display()
    ));

    let started = Instant::now();
    let recorder = StageRecorder::new(job.job_id.as_str());
    let mut workspace = ProcessingWorkspace::create(&ctx.config.work_dir, job.job_id.as_str()).await?;

    let result = run_in_workspace(ctx, job, &input, &workspace, &recorder, &logger).await;
    recorder.finish();

    let cleanup = workspace.release().await;
    if !cleanup.is_clean() {
        logger.log_warning(&format!(
            "workspace cleanup left {} entries behind",
            cleanup.failed
        ));
    }

    match result {
        Ok((segments, summary)) => {
            let report = JobReport {
                job_id: job.job_id.clone(),
                bucket: summary.bucket,
                object_key: summary.key,
                segments,
                parts: summary.parts,
                bytes: summary.bytes,
                elapsed: started.elapsed(),
                timings: recorder.timings(),
            };
            logger.log_completion(&format!(
                "stored {} ({} parts, {} bytes) in {:.1}s [{}]",
                report.object_key,
                report.parts,
                report.bytes,
                report.elapsed.as_secs_f64(),
                recorder.summary()
            ));
            Ok(report)
        }
        Err(e) => {
            logger.log_error(&format!("{} [{}]", e, recorder.summary()));
            Err(e)
        }
    }
}

async fn run_in_workspace(
    ctx: &ProcessingContext,
    job: &UploadFileJob,
    input: &Path,
    workspace: &ProcessingWorkspace,
    recorder: &StageRecorder,
    logger: &JobLogger,
) -> WorkerResult<(usize, vidpipe_storage::UploadSummary)> {
    let output = ctx
        .pipeline
        .run_observed(input, workspace, &|stage| recorder.observe(stage))
        .await?;
    logger.log_progress(&format!(
        "transcoded {} segments into {}",
        output.segment_count,
        output.output_path.display()
    ));

    recorder.enter("upload");
    let key = object_key(
        &ctx.uploader.config().key_prefix,
        job.job_id.as_str(),
        &job.file.original_name,
    );
    let summary = ctx.uploader.upload(&output.output_path, &ctx.bucket, &key).await?;
    recorder.finish();

    Ok((output.segment_count, summary))
}
