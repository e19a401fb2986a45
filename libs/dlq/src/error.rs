//! Error types for dead-letter queue operations.

use resilience::FailureClass;
use thiserror::Error;

/// Errors that can occur during DLQ operations.
#[derive(Error, Debug)]
pub enum DlqError {
    /// Redis connection or command error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The queue was used before `initialize()`. Never retried.
    #[error("Dead letter queue not initialized. Call initialize() first.")]
    NotInitialized,

    /// Consumer group creation failed.
    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),

    /// An entry's payload failed base64 decoding. This surfaces loudly:
    /// substituting anything would mask data loss.
    #[error("Corrupted payload for entry '{entry_id}' at {stream_id}: {source}")]
    CorruptPayload {
        entry_id: String,
        stream_id: String,
        source: base64::DecodeError,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] core_config::ConfigError),
}

impl FailureClass for DlqError {
    fn failure_class(&self) -> &str {
        match self {
            Self::NotInitialized => "programmer",
            Self::Config(_) => "config",
            Self::CorruptPayload { .. } => "corruption",
            Self::Redis(_) | Self::ConsumerGroup(_) => "io",
        }
    }
}
