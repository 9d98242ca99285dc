//! Configuration for the ingest service.
//!
//! Settings come from an optional `config/ingest` file overridden by flat
//! environment variables. Broker settings are read separately through
//! [`argus_pipeline::KafkaConfig`].

use argus_pipeline::{LoggingConfig, PipelineError};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct IngestSettings {
    /// Capture device index, stream URI or file path
    #[serde(default = "default_video_source")]
    pub video_source: String,

    /// Prompt attached to every frame
    #[serde(default = "default_detection_prompt")]
    pub detection_prompt: String,

    /// JPEG quality, 1-100
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// How long to wait for the capture pipeline to start
    #[serde(default = "default_capture_timeout_secs")]
    pub capture_timeout_secs: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Prometheus exporter port; disabled when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

fn default_video_source() -> String {
    "0".to_string()
}
fn default_detection_prompt() -> String {
    "detect person, car, bike".to_string()
}
fn default_jpeg_quality() -> u8 {
    90
}
fn default_capture_timeout_secs() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

impl IngestSettings {
    /// Load settings from `config/ingest` and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_env(None)
    }

    pub fn load_with_env(env: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name("config/ingest").required(false))
            .add_source(Environment::default().try_parsing(true).source(env))
            .build()?
            .try_deserialize()
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.video_source.trim().is_empty() {
            return Err(PipelineError::Configuration(
                "VIDEO_SOURCE must not be empty".to_string(),
            ));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(PipelineError::Configuration(format!(
                "JPEG_QUALITY must be within 1-100, got {}",
                self.jpeg_quality
            )));
        }
        if self.capture_timeout_secs == 0 {
            return Err(PipelineError::Configuration(
                "CAPTURE_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }

    pub fn logging(&self) -> LoggingConfig {
        LoggingConfig {
            level: self.log_level.clone(),
            format: self.log_format.clone(),
        }
    }
}
