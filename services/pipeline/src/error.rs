//! Error taxonomy shared by the producer and the inference worker.
//!
//! Startup failures (configuration, connection, decryption, model load) are
//! fatal. Everything else happens per message and is handled by dropping the
//! message and carrying on.

use crate::config::ConfigError;
use crate::consumer::ConsumerError;
use crate::producer::ProducerError;
use std::fmt;
use thiserror::Error;

/// Classification used for log fields and metric labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Connection,
    Decryption,
    ModelLoad,
    Deserialization,
    Inference,
    Publish,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Connection => "connection",
            ErrorKind::Decryption => "decryption",
            ErrorKind::ModelLoad => "model_load",
            ErrorKind::Deserialization => "deserialization",
            ErrorKind::Inference => "inference",
            ErrorKind::Publish => "publish",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Publish error: {0}")]
    Publish(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Configuration(_) => ErrorKind::Configuration,
            PipelineError::Connection(_) => ErrorKind::Connection,
            PipelineError::Decryption(_) => ErrorKind::Decryption,
            PipelineError::ModelLoad(_) => ErrorKind::ModelLoad,
            PipelineError::Deserialization(_) => ErrorKind::Deserialization,
            PipelineError::Inference(_) => ErrorKind::Inference,
            PipelineError::Publish(_) => ErrorKind::Publish,
        }
    }

    /// Whether the error must stop the process instead of dropping a message
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Configuration
                | ErrorKind::Connection
                | ErrorKind::Decryption
                | ErrorKind::ModelLoad
        )
    }
}

impl From<ConfigError> for PipelineError {
    fn from(error: ConfigError) -> Self {
        PipelineError::Configuration(error.to_string())
    }
}

impl From<ProducerError> for PipelineError {
    fn from(error: ProducerError) -> Self {
        match error {
            ProducerError::CreationError(_) => PipelineError::Connection(error.to_string()),
            _ => PipelineError::Publish(error.to_string()),
        }
    }
}

impl From<ConsumerError> for PipelineError {
    fn from(error: ConsumerError) -> Self {
        match error {
            ConsumerError::CreationError(_) | ConsumerError::ConnectionError(_) => {
                PipelineError::Connection(error.to_string())
            }
            ConsumerError::AssignmentError(_) => PipelineError::Configuration(error.to_string()),
            ConsumerError::PollError(_) | ConsumerError::CommitError(_) => {
                PipelineError::Connection(error.to_string())
            }
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(error: serde_json::Error) -> Self {
        PipelineError::Deserialization(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
