//! Partition-pinned Kafka consumer for the Argus pipeline.
//!
//! Partitions are assigned manually and never rebalanced. Each message's
//! offset is committed as soon as it is received, which gives at-most-once
//! processing for anything that later fails.

use crate::config::KafkaConfig;
use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message as KafkaMessage;
use rdkafka::TopicPartitionList;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur during message consumption
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Broker unreachable: {0}")]
    ConnectionError(String),

    #[error("Failed to assign partition: {0}")]
    AssignmentError(String),

    #[error("Failed to commit offset: {0}")]
    CommitError(String),

    #[error("Consumer poll error: {0}")]
    PollError(String),
}

/// Metadata about a received message
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    /// Topic the message was received from
    pub topic: String,
    /// Partition the message was received from
    pub partition: i32,
    /// Offset of the message in the partition
    pub offset: i64,
    /// Message key (if present)
    pub key: Option<Vec<u8>>,
}

/// A received message with payload and metadata
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Raw message payload
    pub payload: Vec<u8>,
    /// Message metadata
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    /// Get the message key as a string
    pub fn key_str(&self) -> Option<String> {
        self.metadata
            .key
            .as_ref()
            .and_then(|k| String::from_utf8(k.clone()).ok())
    }
}

/// Source of messages for a polling loop
#[async_trait]
pub trait MessageSource: Send {
    /// Wait up to `timeout` for the next message. `Ok(None)` means nothing arrived.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<IncomingMessage>, ConsumerError>;

    /// Release the underlying connection
    fn close(&mut self) {}
}

/// Kafka consumer bound to exactly one topic partition
pub struct PartitionConsumer {
    consumer: StreamConsumer,
    topic: String,
    partition: i32,
}

impl PartitionConsumer {
    /// Connect to the brokers and assign `topic`/`partition`.
    ///
    /// Fetches cluster metadata first so an unreachable broker or a missing
    /// partition fails here rather than inside the polling loop.
    pub fn assign(
        config: &KafkaConfig,
        topic: &str,
        partition: i32,
    ) -> Result<Self, ConsumerError> {
        info!(
            bootstrap_servers = %config.bootstrap_servers,
            group_id = %config.consumer.group_id,
            topic,
            partition,
            "Creating partition consumer"
        );

        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        let metadata = consumer
            .fetch_metadata(Some(topic), config.request_timeout())
            .map_err(|e| ConsumerError::ConnectionError(e.to_string()))?;

        let partition_count = metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic)
            .map(|t| t.partitions().len())
            .unwrap_or(0);

        if partition < 0 || partition as usize >= partition_count {
            return Err(ConsumerError::AssignmentError(format!(
                "partition {} not found in topic '{}' ({} partitions)",
                partition, topic, partition_count
            )));
        }

        let mut assignment = TopicPartitionList::new();
        assignment.add_partition(topic, partition);
        consumer
            .assign(&assignment)
            .map_err(|e| ConsumerError::AssignmentError(e.to_string()))?;

        info!(topic, partition, "Partition assigned");

        Ok(Self {
            consumer,
            topic: topic.to_string(),
            partition,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Commit the current offsets synchronously
    pub fn commit(&self) -> Result<(), ConsumerError> {
        self.consumer
            .commit_consumer_state(CommitMode::Sync)
            .map_err(|e| ConsumerError::CommitError(e.to_string()))
    }
}

#[async_trait]
impl MessageSource for PartitionConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<IncomingMessage>, ConsumerError> {
        let received = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => return Ok(None),
            Ok(received) => received,
        };

        let message = received.map_err(|e| ConsumerError::PollError(e.to_string()))?;

        if let Err(e) = self.consumer.commit_message(&message, CommitMode::Async) {
            warn!(
                partition = message.partition(),
                offset = message.offset(),
                error = %e,
                "Failed to commit offset"
            );
        }

        let incoming = convert_message(&message);
        debug!(
            topic = %incoming.metadata.topic,
            partition = incoming.metadata.partition,
            offset = incoming.metadata.offset,
            "Received message"
        );

        Ok(Some(incoming))
    }

    fn close(&mut self) {
        info!(topic = %self.topic, partition = self.partition, "Closing partition consumer");

        if let Err(e) = self.commit() {
            warn!("Failed to commit on shutdown: {}", e);
        }
        if let Err(e) = self.consumer.unassign() {
            warn!(error = %e, "Failed to unassign partition");
        }
    }
}

/// Convert a borrowed Kafka message to our IncomingMessage type
fn convert_message<M: KafkaMessage>(msg: &M) -> IncomingMessage {
    IncomingMessage {
        payload: msg.payload().unwrap_or(&[]).to_vec(),
        metadata: MessageMetadata {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key: msg.key().map(|k| k.to_vec()),
        },
    }
}
