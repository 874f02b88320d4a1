use anyhow::Context;

use vidpipe_media::{check_ffmpeg, check_ffprobe, ensure_writable_dir};
use vidpipe_queue::{JobBroker, JobQueue};
use vidpipe_storage::S3Client;
use vidpipe_worker::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("worker-selfcheck: rustls provider already installed");
    }
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env();
    println!(
        "worker-selfcheck: starting with work_dir={}",
        config.work_dir.display()
    );

    ensure_writable_dir(&config.work_dir)
        .await
        .with_context(|| format!("work dir {} is not usable", config.work_dir.display()))?;
    println!("worker-selfcheck: work dir writable");

    let ffmpeg = check_ffmpeg().context("ffmpeg not available")?;
    let ffprobe = check_ffprobe().context("ffprobe not available")?;
    println!(
        "worker-selfcheck: ffmpeg={} ffprobe={}",
        ffmpeg.display(),
        ffprobe.display()
    );

    let queue = JobQueue::from_env().context("invalid queue configuration")?;
    queue.ping().await.context("redis unreachable")?;
    println!("worker-selfcheck: redis reachable");

    let storage = S3Client::from_env().context("invalid storage configuration")?;
    storage
        .check_connectivity()
        .await
        .with_context(|| format!("bucket {} unreachable", storage.bucket()))?;
    println!("worker-selfcheck: bucket {} reachable", storage.bucket());

    println!("worker-selfcheck: ok");
    Ok(())
}
