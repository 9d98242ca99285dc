//! Ingest service for the Argus frame pipeline
//!
//! ```text
//! Video source -> VideoCapture -> FrameEncoder -> FrameProducer -> frames topic
//! ```
//!
//! Settings are read from `config/ingest` and the environment (`VIDEO_SOURCE`,
//! `DETECTION_PROMPT`, `JPEG_QUALITY`, ...); broker settings from `KAFKA_*`.

use anyhow::{Context, Result};
use argus_ingest::{FrameEncoder, FrameProducer, IngestSettings, VideoCapture};
use argus_pipeline::{shutdown_signal, telemetry, KafkaConfig, PipelineProducer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let settings = IngestSettings::load().context("Failed to load ingest settings")?;
    telemetry::init_tracing(&settings.logging())?;

    info!(
        service = "argus-ingest",
        version = env!("CARGO_PKG_VERSION"),
        source = %settings.video_source,
        "Starting ingest service"
    );

    match run(settings).await {
        Ok(()) => {
            info!("Ingest service completed successfully");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Ingest service failed");
            Err(e)
        }
    }
}

async fn run(settings: IngestSettings) -> Result<()> {
    settings.validate()?;

    if let Some(port) = settings.metrics_port {
        telemetry::install_metrics_exporter(port)?;
    }

    let kafka = KafkaConfig::from_env()?;
    kafka.validate()?;
    let publisher = PipelineProducer::new(&kafka).context("Failed to create producer")?;

    let capture = VideoCapture::open(&settings.video_source, settings.capture_timeout())
        .context("Failed to open video source")?;

    let stop = Arc::new(AtomicBool::new(false));
    tokio::spawn({
        let stop = stop.clone();
        async move {
            shutdown_signal().await;
            stop.store(true, Ordering::SeqCst);
        }
    });

    let mut producer = FrameProducer::new(
        publisher,
        FrameEncoder::new(settings.jpeg_quality),
        kafka.topics.frames.clone(),
    );

    let (frames, reader) = capture.spawn_reader(stop.clone());
    let stats = producer
        .process_video(frames, &settings.detection_prompt, &stop)
        .await;

    stop.store(true, Ordering::SeqCst);
    if let Err(e) = reader.await {
        warn!(error = %e, "Capture thread did not exit cleanly");
    }

    info!(
        frames_read = stats.frames_read,
        frames_published = stats.frames_published,
        dropped_encode = stats.dropped_encode,
        dropped_publish = stats.dropped_publish,
        capture_errors = stats.capture_errors,
        next_frame_id = producer.sequence().peek(),
        "Video processing finished"
    );

    Ok(())
}
