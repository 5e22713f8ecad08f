use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use futures::StreamExt;
use meeting_media::ingest::IngestSession;
use meeting_media::media::backend::CodecBackend;
use meeting_media::media::pipe::{Pipeline, PipelineEvent, ShutdownOutcome};
use meeting_media::media::stream::{ArtifactStream, artifact_channel};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

mod config;
mod server;

const ARTIFACT_CHAN_CAP: usize = 256;
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

fn init_logging() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .filter_module("meeting_media", log::LevelFilter::Debug)
        .filter_module("ffmpeg_bus", log::LevelFilter::Info)
        .parse_default_env()
        .init();
}

#[cfg(feature = "ffmpeg")]
fn codec_backend() -> anyhow::Result<Box<dyn CodecBackend>> {
    Ok(Box::new(meeting_media::media::backend::FfmpegBackend))
}

#[cfg(not(feature = "ffmpeg"))]
fn codec_backend() -> anyhow::Result<Box<dyn CodecBackend>> {
    anyhow::bail!("built without the `ffmpeg` feature, no codec backend available")
}

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(e) = run().await {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = config::config();
    let backend = codec_backend()?;

    let (writer, artifact) = artifact_channel(ARTIFACT_CHAN_CAP);
    let pipeline = Arc::new(Pipeline::new(
        config.pipeline_config(),
        backend.as_ref(),
        Box::new(writer),
    )?);
    let artifact_task = tokio::spawn(write_artifact(artifact, config.output_path().to_path_buf()));
    tokio::spawn(log_diagnostics(pipeline.clone()));

    let session = Arc::new(Mutex::new(IngestSession::new(pipeline.clone())));
    let cancel = CancellationToken::new();
    let listener = server::bind(config.host(), config.port()).await?;
    let server_task = server::start_ingest_server(listener, session.clone(), cancel.clone());

    let mut idle_check = tokio::time::interval(IDLE_CHECK_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupted, stopping recording");
                break;
            }
            _ = idle_check.tick() => {
                let reason = lock(&session).idle_reason(Instant::now());
                if let Some(reason) = reason {
                    log::info!("leaving meeting: {:?}", reason);
                    break;
                }
            }
        }
    }

    let drain_started = Instant::now();
    while !lock(&session).is_quiet(Instant::now(), drain_started) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    cancel.cancel();
    let _ = server_task.await;

    let outcome = pipeline.shutdown().await;
    let stats = lock(&session).stats();
    log::info!(
        "ingest: {} messages, {} video frames, {} audio chunks, {} rejected",
        stats.messages,
        stats.video_frames,
        stats.audio_chunks,
        stats.rejected
    );

    let written = artifact_task.await??;
    log::info!(
        "wrote {} bytes to {}",
        written,
        config.output_path().display()
    );

    match outcome {
        ShutdownOutcome::Drained | ShutdownOutcome::AlreadyRequested => Ok(()),
        ShutdownOutcome::TimedOut => {
            anyhow::bail!("pipeline did not drain in time, recording is truncated")
        }
        ShutdownOutcome::Failed(msg) => anyhow::bail!("pipeline failed while draining: {}", msg),
    }
}

async fn write_artifact(mut artifact: ArtifactStream, path: PathBuf) -> anyhow::Result<u64> {
    let mut file = tokio::fs::File::create(&path)
        .await
        .with_context(|| format!("failed to create {}", path.display()))?;
    let mut written = 0u64;
    while let Some(chunk) = artifact.next().await {
        file.write_all(&chunk)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

async fn log_diagnostics(pipeline: Arc<Pipeline>) {
    let mut events = pipeline.subscribe();
    drop(pipeline);
    loop {
        match events.recv().await {
            Ok(PipelineEvent::Error {
                source,
                message,
                fatal,
            }) => {
                let kind = if fatal { "fatal error" } else { "error" };
                log::error!("pipeline {} from {}: {}", kind, source, message)
            }
            Ok(PipelineEvent::StateChanged(state)) => log::debug!("pipeline state: {:?}", state),
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => log::warn!("missed {} pipeline events", n),
            Err(RecvError::Closed) => break,
        }
    }
}

fn lock(session: &Mutex<IngestSession>) -> std::sync::MutexGuard<'_, IngestSession> {
    session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
