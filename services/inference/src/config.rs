//! Settings for the inference worker.
//!
//! Loaded from an optional `config/inference` file overridden by flat
//! environment variables (`MODEL_PATH`, `KAFKA_PARTITION`, ...). Broker
//! settings live in [`argus_pipeline::KafkaConfig`].

use argus_pipeline::{LoggingConfig, PipelineError};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// A string that never shows up in logs or debug output
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString(***)")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    /// Model artifact; a `.enc` suffix marks it as encrypted
    #[serde(default = "default_model_path")]
    pub model_path: String,

    /// Fernet key, required only for encrypted artifacts
    #[serde(default)]
    pub model_encryption_key: Option<SecretString>,

    /// Class names, one per line, in model output order
    #[serde(default)]
    pub model_labels_path: Option<String>,

    /// Frames-topic partition this worker owns
    #[serde(default)]
    pub kafka_partition: i32,

    /// Upper bound for a single poll
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Square model input edge in pixels
    #[serde(default = "default_input_size")]
    pub input_size: u32,

    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,

    #[serde(default = "default_max_detections")]
    pub max_detections: usize,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Prometheus exporter port; disabled when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

fn default_model_path() -> String {
    "/models/yolo_world.onnx.enc".to_string()
}
fn default_poll_timeout_ms() -> u64 {
    1000
}
fn default_input_size() -> u32 {
    640
}
fn default_confidence_threshold() -> f32 {
    0.25
}
fn default_iou_threshold() -> f32 {
    0.45
}
fn default_max_detections() -> usize {
    100
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

/// Detector tuning knobs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorParams {
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            input_size: default_input_size(),
            confidence_threshold: default_confidence_threshold(),
            iou_threshold: default_iou_threshold(),
            max_detections: default_max_detections(),
        }
    }
}

impl WorkerSettings {
    /// Load settings from `config/inference` and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_env(None)
    }

    /// Load settings with an explicit environment map instead of the process environment.
    pub fn load_with_env(env: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/inference").required(false))
            .add_source(Environment::default().try_parsing(true).source(env))
            .build()?;

        config.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.model_path.is_empty() {
            return Err(PipelineError::Configuration(
                "MODEL_PATH must not be empty".to_string(),
            ));
        }
        if self.kafka_partition < 0 {
            return Err(PipelineError::Configuration(format!(
                "KAFKA_PARTITION must be non-negative, got {}",
                self.kafka_partition
            )));
        }
        if self.poll_timeout_ms == 0 {
            return Err(PipelineError::Configuration(
                "POLL_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }
        if self.input_size == 0 || self.input_size % 32 != 0 {
            return Err(PipelineError::Configuration(format!(
                "INPUT_SIZE must be a positive multiple of 32, got {}",
                self.input_size
            )));
        }
        for (name, value) in [
            ("CONFIDENCE_THRESHOLD", self.confidence_threshold),
            ("IOU_THRESHOLD", self.iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PipelineError::Configuration(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn logging(&self) -> LoggingConfig {
        LoggingConfig {
            level: self.log_level.clone(),
            format: self.log_format.clone(),
        }
    }

    pub fn detector_params(&self) -> DetectorParams {
        DetectorParams {
            input_size: self.input_size,
            confidence_threshold: self.confidence_threshold,
            iou_threshold: self.iou_threshold,
            max_detections: self.max_detections,
        }
    }
}
