//! Kafka producer wrapper for the Argus pipeline.
//!
//! Two delivery modes are exposed through [`MessagePublisher`]:
//! `send` waits for the broker acknowledgement, `enqueue` hands the record to
//! librdkafka and reports the delivery outcome from a background task.

use crate::config::KafkaConfig;
use crate::telemetry;
use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Errors that can occur during message production
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    #[error("Failed to send message to topic {topic}: {message}")]
    SendError { topic: String, message: String },

    #[error("Producer timeout after {0:?}")]
    Timeout(Duration),
}

/// Result of a successful message delivery
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    /// Topic the message was delivered to
    pub topic: String,
    /// Partition the message was delivered to
    pub partition: i32,
    /// Offset of the message in the partition
    pub offset: i64,
    /// Message key (if provided)
    pub key: Option<String>,
}

/// Message to be sent to Kafka
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Topic to send the message to
    pub topic: String,
    /// Optional message key
    pub key: Option<String>,
    /// Serialized message payload
    pub payload: Vec<u8>,
}

impl OutgoingMessage {
    /// Create a new outgoing message with a JSON payload
    pub fn new_json<T: serde::Serialize>(
        topic: impl Into<String>,
        message: &T,
    ) -> Result<Self, ProducerError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| ProducerError::SerializationError(e.to_string()))?;
        Ok(Self {
            topic: topic.into(),
            key: None,
            payload,
        })
    }

    /// Set the message key
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Publishing seam used by the frame producer and the detection worker
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Send a message and wait until the broker confirms it
    async fn send(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError>;

    /// Queue a message without waiting for delivery
    fn enqueue(&self, message: OutgoingMessage) -> Result<(), ProducerError>;
}

/// High-level Kafka producer wrapper
pub struct PipelineProducer {
    producer: FutureProducer,
    default_timeout: Duration,
}

impl PipelineProducer {
    /// Create a new producer with the given configuration
    pub fn new(config: &KafkaConfig) -> Result<Self, ProducerError> {
        info!(
            bootstrap_servers = %config.bootstrap_servers,
            security_protocol = config.security_protocol.as_str(),
            "Creating Kafka producer"
        );

        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| ProducerError::CreationError(e.to_string()))?;

        let default_timeout = config.request_timeout();

        Ok(Self {
            producer,
            default_timeout,
        })
    }

    /// Send a message with a custom timeout
    #[instrument(skip(self, message), fields(topic = %message.topic, key = ?message.key))]
    pub async fn send_with_timeout(
        &self,
        message: OutgoingMessage,
        timeout: Duration,
    ) -> Result<DeliveryResult, ProducerError> {
        let topic = message.topic.clone();
        let key = message.key.clone();

        let mut record = FutureRecord::to(&topic).payload(&message.payload);
        if let Some(ref k) = key {
            record = record.key(k);
        }

        debug!(size_bytes = message.payload.len(), "Sending message");

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(timeout))
            .await
            .map_err(|(e, _)| ProducerError::SendError {
                topic: topic.clone(),
                message: e.to_string(),
            })?;

        debug!(partition, offset, "Message delivered");

        Ok(DeliveryResult {
            topic,
            partition,
            offset,
            key,
        })
    }

    /// Flush all pending messages
    pub fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| ProducerError::Timeout(timeout))
    }

    /// Get the number of messages in the producer queue
    pub fn queue_len(&self) -> i32 {
        self.producer.in_flight_count()
    }
}

#[async_trait]
impl MessagePublisher for PipelineProducer {
    async fn send(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError> {
        self.send_with_timeout(message, self.default_timeout).await
    }

    fn enqueue(&self, message: OutgoingMessage) -> Result<(), ProducerError> {
        let mut record = FutureRecord::to(&message.topic).payload(&message.payload);
        if let Some(ref k) = message.key {
            record = record.key(k);
        }

        let delivery = self
            .producer
            .send_result(record)
            .map_err(|(e, _)| ProducerError::SendError {
                topic: message.topic.clone(),
                message: e.to_string(),
            })?;

        let topic = message.topic;
        let key = message.key;
        tokio::spawn(async move {
            match delivery.await {
                Ok(Ok((partition, offset))) => {
                    debug!(%topic, ?key, partition, offset, "Message delivered");
                }
                Ok(Err((e, _))) => {
                    error!(%topic, ?key, error = %e, "Message delivery failed");
                    telemetry::record_delivery_failure(&topic);
                }
                Err(_) => {
                    warn!(%topic, ?key, "Delivery report dropped before completion");
                    telemetry::record_delivery_failure(&topic);
                }
            }
        });

        Ok(())
    }
}

impl Drop for PipelineProducer {
    fn drop(&mut self) {
        info!("Shutting down Kafka producer");
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!("Failed to flush producer on shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FrameMessage;

    #[test]
    fn test_outgoing_message_builder() {
        let frame = FrameMessage::new(3, vec![1, 2, 3], "detect person");
        let message = OutgoingMessage::new_json("frames", &frame)
            .unwrap()
            .with_key(frame.key());

        assert_eq!(message.topic, "frames");
        assert_eq!(message.key, Some("3".to_string()));

        let decoded = FrameMessage::from_slice(&message.payload).unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn test_producer_creation_does_not_require_a_broker() {
        // librdkafka connects lazily, so creation succeeds offline.
        let producer = PipelineProducer::new(&KafkaConfig::new("127.0.0.1:1"));
        assert!(producer.is_ok());
        assert_eq!(producer.unwrap().queue_len(), 0);
    }
}
