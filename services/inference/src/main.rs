use anyhow::{Context, Result};
use argus_inference::detector::load_labels;
use argus_inference::{DetectionWorker, ModelLoader, OnnxDetector, WorkerSettings};
use argus_pipeline::{shutdown_signal, telemetry, KafkaConfig, PartitionConsumer, PipelineProducer};
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let settings = WorkerSettings::load().context("Failed to load worker settings")?;
    telemetry::init_tracing(&settings.logging())?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        model_path = %settings.model_path,
        partition = settings.kafka_partition,
        "Starting inference worker"
    );

    if let Err(e) = run(settings).await {
        error!(error = %e, "Inference worker failed");
        return Err(e);
    }

    Ok(())
}

async fn run(settings: WorkerSettings) -> Result<()> {
    settings.validate()?;

    if let Some(port) = settings.metrics_port {
        telemetry::install_metrics_exporter(port)?;
    }

    // The model is loaded before any broker connection is attempted
    let loader = ModelLoader::resolve(&settings.model_path, settings.model_encryption_key.clone())?;
    let labels = match &settings.model_labels_path {
        Some(path) => load_labels(Path::new(path))?,
        None => Vec::new(),
    };
    let params = settings.detector_params();
    let detector = loader.load(|path| OnnxDetector::open(path, labels, params))?;

    let kafka = KafkaConfig::from_env()?;
    kafka.validate()?;

    let producer = PipelineProducer::new(&kafka)?;
    let mut consumer =
        PartitionConsumer::assign(&kafka, &kafka.topics.frames, settings.kafka_partition)?;

    info!(
        frames_topic = %kafka.topics.frames,
        detections_topic = %kafka.topics.detections,
        partition = consumer.partition(),
        "Worker initialized"
    );

    let mut worker = DetectionWorker::new(
        detector,
        producer,
        kafka.topics.detections.clone(),
        settings.poll_timeout(),
    );
    let stats = worker.run(&mut consumer, shutdown_signal()).await;

    let producer = worker.into_publisher();
    if let Err(e) = producer.flush(Duration::from_secs(5)) {
        warn!(error = %e, pending = producer.queue_len(), "Detections left unflushed");
    }

    info!(
        messages_received = stats.messages_received,
        detections_published = stats.detections_published,
        dropped = stats.dropped(),
        dropped_deserialization = stats.dropped_deserialization,
        dropped_inference = stats.dropped_inference,
        dropped_publish = stats.dropped_publish,
        dropped_other = stats.dropped_other,
        poll_errors = stats.poll_errors,
        "Inference worker stopped"
    );

    Ok(())
}
