//! Argus Pipeline - Kafka plumbing for streaming frame detection
//!
//! Shared by the ingest service (frame producer) and the inference workers:
//!
//! - Broker configuration from `KAFKA_*` environment variables, including TLS
//! - A producer with confirmed and fire-and-forget delivery
//! - A consumer pinned to a single, manually assigned partition
//! - The `FrameMessage` / `DetectionMessage` wire schemas
//! - The error taxonomy and the logging/metrics setup
//!
//! # Example
//!
//! ```rust,no_run
//! use argus_pipeline::{FrameMessage, KafkaConfig, MessagePublisher, OutgoingMessage, PipelineProducer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = KafkaConfig::from_env()?;
//!     let producer = PipelineProducer::new(&config)?;
//!
//!     let frame = FrameMessage::new(0, std::fs::read("frame.jpg")?, "detect person");
//!     let message = OutgoingMessage::new_json(&config.topics.frames, &frame)?.with_key(frame.key());
//!     producer.send(message).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod error;
pub mod producer;
pub mod schema;
pub mod signal;
pub mod telemetry;

// Re-export main types
pub use config::{
    ConfigError, ConsumerConfig, KafkaConfig, LoggingConfig, ProducerConfig, ReliabilityConfig,
    SecurityProtocol, SslConfig, TopicConfig,
};
pub use consumer::{
    ConsumerError, IncomingMessage, MessageMetadata, MessageSource, PartitionConsumer,
};
pub use error::{ErrorKind, PipelineError};
pub use producer::{
    DeliveryResult, MessagePublisher, OutgoingMessage, PipelineProducer, ProducerError,
};
pub use schema::{Detection, DetectionMessage, FrameMessage};
pub use signal::shutdown_signal;

pub use async_trait::async_trait;
