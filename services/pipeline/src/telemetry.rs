//! Logging and metrics setup shared by the service binaries.

use crate::config::LoggingConfig;
use crate::error::ErrorKind;
use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const FRAMES_PUBLISHED: &str = "argus.frames.published";
pub const FRAMES_DROPPED: &str = "argus.frames.dropped";
pub const MESSAGES_RECEIVED: &str = "argus.messages.received";
pub const MESSAGES_DROPPED: &str = "argus.messages.dropped";
pub const DETECTIONS_PUBLISHED: &str = "argus.detections.published";
pub const CONSUMER_ERRORS: &str = "argus.consumer.errors";
pub const DELIVERY_FAILED: &str = "argus.delivery.failed";
pub const INFERENCE_DURATION: &str = "argus.inference.duration_seconds";

/// Initialize tracing. `RUST_LOG` takes precedence over the configured level.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Invalid log level")?;

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.format == "pretty" {
        registry.with(fmt::layer().pretty()).try_init()?;
    } else {
        registry.with(fmt::layer().json()).try_init()?;
    }

    Ok(())
}

/// Initialize Prometheus metrics exporter
pub fn install_metrics_exporter(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port, "Prometheus metrics exporter started");
    Ok(())
}

/// Count a message that was consumed but produced no output
pub fn record_dropped(stage: &'static str, kind: ErrorKind) {
    metrics::counter!(MESSAGES_DROPPED, "stage" => stage, "kind" => kind.as_str()).increment(1);
}

/// Count a frame the producer gave up on
pub fn record_frame_dropped(reason: &'static str) {
    metrics::counter!(FRAMES_DROPPED, "reason" => reason).increment(1);
}

pub fn record_delivery_failure(topic: &str) {
    metrics::counter!(DELIVERY_FAILED, "topic" => topic.to_string()).increment(1);
}
