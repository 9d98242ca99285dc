//! Kafka configuration for the Argus pipeline.
//!
//! Broker settings are read from plain `KAFKA_*` environment variables so the
//! producer and every inference worker can share one secret bundle. TLS
//! material is expected to be provisioned on disk before the process starts.

use rdkafka::config::ClientConfig;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Security protocol for Kafka connections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
        }
    }

    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.to_lowercase().as_str() {
            "plaintext" => Ok(SecurityProtocol::Plaintext),
            "ssl" => Ok(SecurityProtocol::Ssl),
            other => Err(ConfigError::InvalidValue {
                key: "KAFKA_SECURITY_PROTOCOL".to_string(),
                message: format!("unsupported protocol '{}'", other),
            }),
        }
    }
}

/// SSL/TLS configuration
#[derive(Clone, Default)]
pub struct SslConfig {
    /// Path to CA certificate file
    pub ca_location: Option<String>,
    /// Path to the PKCS#12 client keystore
    pub keystore_location: Option<String>,
    /// Keystore password
    pub keystore_password: Option<String>,
}

impl SslConfig {
    fn is_configured(&self) -> bool {
        self.ca_location.is_some() || self.keystore_location.is_some()
    }
}

impl fmt::Debug for SslConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SslConfig")
            .field("ca_location", &self.ca_location)
            .field("keystore_location", &self.keystore_location)
            .field(
                "keystore_password",
                &self.keystore_password.as_ref().map(|_| "[redacted]"),
            )
            .finish()
    }
}

/// Retry and reliability configuration
#[derive(Debug, Clone)]
pub struct ReliabilityConfig {
    /// Number of retries for failed operations
    pub retries: u32,
    /// Retry backoff in milliseconds
    pub retry_backoff_ms: u64,
    /// Request timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Enable idempotent producer
    pub enable_idempotence: bool,
    /// Required acknowledgments: 0, 1, or -1 (all)
    pub acks: String,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_backoff_ms: 100,
            request_timeout_ms: 30000,
            enable_idempotence: true,
            acks: "all".to_string(),
        }
    }
}

/// Producer-specific configuration
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Linger time in milliseconds
    pub linger_ms: u64,
    /// Compression type: none, gzip, snappy, lz4, zstd
    pub compression_type: String,
    /// Largest message the producer will accept, in bytes
    pub message_max_bytes: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            linger_ms: 5,
            // JPEG payloads barely compress; keep CPU for inference.
            compression_type: "none".to_string(),
            message_max_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Consumer-specific configuration
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Group used only for offset storage; partitions are assigned manually
    pub group_id: String,
    /// Auto offset reset: earliest, latest, none
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    pub session_timeout_ms: u64,
    /// Maximum bytes fetched per partition request
    pub max_partition_fetch_bytes: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: "yolo-inference".to_string(),
            auto_offset_reset: "latest".to_string(),
            session_timeout_ms: 30000,
            max_partition_fetch_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Topic configuration for the pipeline
#[derive(Debug, Clone)]
pub struct TopicConfig {
    /// Topic carrying encoded frames and their prompt
    pub frames: String,
    /// Topic carrying detection results
    pub detections: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            frames: "frames".to_string(),
            detections: "detections".to_string(),
        }
    }
}

/// Main Kafka configuration
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses
    pub bootstrap_servers: String,
    /// Client ID for this connection
    pub client_id: String,
    /// Security protocol
    pub security_protocol: SecurityProtocol,
    /// SSL configuration
    pub ssl: SslConfig,
    /// Reliability settings
    pub reliability: ReliabilityConfig,
    /// Producer settings
    pub producer: ProducerConfig,
    /// Consumer settings
    pub consumer: ConsumerConfig,
    /// Topic configuration
    pub topics: TopicConfig,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            client_id: "argus".to_string(),
            security_protocol: SecurityProtocol::default(),
            ssl: SslConfig::default(),
            reliability: ReliabilityConfig::default(),
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
            topics: TopicConfig::default(),
        }
    }
}

impl KafkaConfig {
    /// Create a new KafkaConfig with the specified bootstrap servers
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            ..Default::default()
        }
    }

    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bootstrap_servers =
            lookup("KAFKA_BOOTSTRAP_SERVERS").unwrap_or_else(|| "localhost:9092".to_string());

        let mut config = Self::new(bootstrap_servers);

        if let Some(client_id) = lookup("KAFKA_CLIENT_ID") {
            config.client_id = client_id;
        }
        if let Some(group_id) = lookup("KAFKA_GROUP_ID") {
            config.consumer.group_id = group_id;
        }
        if let Some(reset) = lookup("KAFKA_AUTO_OFFSET_RESET") {
            config.consumer.auto_offset_reset = reset;
        }

        config.ssl.ca_location = lookup("KAFKA_SSL_CA_LOCATION");
        config.ssl.keystore_location = lookup("KAFKA_SSL_KEYSTORE_LOCATION");
        config.ssl.keystore_password = lookup("KAFKA_SSL_KEYSTORE_PASSWORD");

        config.security_protocol = match lookup("KAFKA_SECURITY_PROTOCOL") {
            Some(protocol) => SecurityProtocol::parse(&protocol)?,
            None if config.ssl.is_configured() => SecurityProtocol::Ssl,
            None => SecurityProtocol::Plaintext,
        };

        if let Some(topic) = lookup("KAFKA_FRAMES_TOPIC") {
            config.topics.frames = topic;
        }
        if let Some(topic) = lookup("KAFKA_DETECTIONS_TOPIC") {
            config.topics.detections = topic;
        }

        Ok(config)
    }

    /// Build a base rdkafka ClientConfig from this configuration
    fn build_base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("client.id", &self.client_id);
        config.set("security.protocol", self.security_protocol.as_str());

        if let Some(ref ca) = self.ssl.ca_location {
            config.set("ssl.ca.location", ca);
        }
        if let Some(ref keystore) = self.ssl.keystore_location {
            config.set("ssl.keystore.location", keystore);
        }
        if let Some(ref password) = self.ssl.keystore_password {
            config.set("ssl.keystore.password", password);
        }

        config
    }

    /// Build a producer ClientConfig
    pub fn build_producer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();

        config.set("retries", self.reliability.retries.to_string());
        config.set("retry.backoff.ms", self.reliability.retry_backoff_ms.to_string());
        config.set("request.timeout.ms", self.reliability.request_timeout_ms.to_string());
        config.set("acks", &self.reliability.acks);

        if self.reliability.enable_idempotence {
            config.set("enable.idempotence", "true");
        }

        config.set("linger.ms", self.producer.linger_ms.to_string());
        config.set("compression.type", &self.producer.compression_type);
        config.set("message.max.bytes", self.producer.message_max_bytes.to_string());

        config
    }

    /// Build a consumer ClientConfig
    pub fn build_consumer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();

        config.set("group.id", &self.consumer.group_id);
        config.set("auto.offset.reset", &self.consumer.auto_offset_reset);
        // Offsets are committed explicitly on receipt.
        config.set("enable.auto.commit", "false");
        config.set(
            "session.timeout.ms",
            self.consumer.session_timeout_ms.to_string(),
        );
        config.set(
            "max.partition.fetch.bytes",
            self.consumer.max_partition_fetch_bytes.to_string(),
        );

        config
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.reliability.request_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_servers.is_empty() {
            return Err(ConfigError::MissingRequired(
                "KAFKA_BOOTSTRAP_SERVERS".to_string(),
            ));
        }

        if self.consumer.group_id.is_empty() {
            return Err(ConfigError::MissingRequired("KAFKA_GROUP_ID".to_string()));
        }

        if self.ssl.keystore_location.is_some() && self.ssl.keystore_password.is_none() {
            return Err(ConfigError::MissingRequired(
                "KAFKA_SSL_KEYSTORE_PASSWORD (required with a keystore)".to_string(),
            ));
        }

        if self.topics.frames.is_empty() || self.topics.detections.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "topics".to_string(),
                message: "topic names must not be empty".to_string(),
            });
        }

        Ok(())
    }
}

/// Logging configuration shared by the service binaries
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}
