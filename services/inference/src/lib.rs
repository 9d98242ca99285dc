//! Argus inference worker
//!
//! Consumes encoded frames from one partition of the frames topic, runs an
//! object detector on each and publishes the detections keyed by frame id.

pub mod config;
pub mod detector;
pub mod model_loader;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod worker;

pub use config::{DetectorParams, SecretString, WorkerSettings};
pub use detector::Detector;
pub use model_loader::ModelLoader;
#[cfg(feature = "onnx")]
pub use onnx::OnnxDetector;
pub use worker::{DetectionWorker, WorkerState, WorkerStats};
