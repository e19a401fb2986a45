//! Dead-letter queue configuration.

use core_config::{ConfigError, FromEnv, env_or_default, env_parse};

/// Configuration for a [`crate::DeadLetterQueue`].
#[derive(Debug, Clone)]
pub struct DLQConfig {
    /// Redis stream backing the DLQ.
    pub stream_name: String,

    /// Consumer group used for reliable delivery.
    pub consumer_group: String,

    /// Prefix for derived Redis keys (main queues live at
    /// `{key_prefix}:queue:{name}`).
    pub key_prefix: String,

    /// Maximum entries in the stream; older entries are trimmed.
    pub max_stream_length: usize,

    /// How many times an entry may be requeued before it is discarded.
    pub max_requeue_attempts: u32,

    /// Blocking timeout for consuming reads, in milliseconds. 0 reads
    /// without blocking.
    pub block_timeout_ms: u64,

    /// Idle time after which a pending entry may be claimed from a dead
    /// consumer, in milliseconds.
    pub claim_timeout_ms: u64,

    /// Entries read per batch.
    pub batch_size: usize,
}

impl Default for DLQConfig {
    fn default() -> Self {
        Self {
            stream_name: "conveyor:dlq".to_string(),
            consumer_group: "dlq-consumers".to_string(),
            key_prefix: "conveyor".to_string(),
            max_stream_length: 100_000,
            max_requeue_attempts: 3,
            block_timeout_ms: 5000,
            claim_timeout_ms: 60_000,
            batch_size: 100,
        }
    }
}

impl DLQConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stream_name(mut self, name: impl Into<String>) -> Self {
        self.stream_name = name.into();
        self
    }

    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = group.into();
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_max_stream_length(mut self, max: usize) -> Self {
        self.max_stream_length = max;
        self
    }

    pub fn with_max_requeue_attempts(mut self, attempts: u32) -> Self {
        self.max_requeue_attempts = attempts;
        self
    }

    pub fn with_block_timeout_ms(mut self, timeout: u64) -> Self {
        self.block_timeout_ms = timeout;
        self
    }

    pub fn with_claim_timeout_ms(mut self, timeout: u64) -> Self {
        self.claim_timeout_ms = timeout;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Validate field bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream_name.is_empty() {
            return Err(ConfigError::invalid("stream_name", "must not be empty"));
        }
        if self.consumer_group.is_empty() {
            return Err(ConfigError::invalid("consumer_group", "must not be empty"));
        }
        if self.key_prefix.is_empty() {
            return Err(ConfigError::invalid("key_prefix", "must not be empty"));
        }
        if self.max_stream_length < 1000 {
            return Err(ConfigError::invalid("max_stream_length", "must be >= 1000"));
        }
        if self.max_requeue_attempts < 1 {
            return Err(ConfigError::invalid("max_requeue_attempts", "must be >= 1"));
        }
        if self.claim_timeout_ms < 1000 {
            return Err(ConfigError::invalid("claim_timeout_ms", "must be >= 1000"));
        }
        if self.batch_size < 1 || self.batch_size > 1000 {
            return Err(ConfigError::invalid("batch_size", "must be in 1..=1000"));
        }
        Ok(())
    }

    /// Redis stream key for a main queue: `{key_prefix}:queue:{queue_name}`.
    pub fn main_queue_key(&self, queue_name: &str) -> String {
        format!("{}:queue:{}", self.key_prefix, queue_name)
    }
}

impl FromEnv for DLQConfig {
    /// Load from `DLQ_*` environment variables, falling back to defaults.
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            stream_name: env_or_default("DLQ_STREAM_NAME", &defaults.stream_name),
            consumer_group: env_or_default("DLQ_CONSUMER_GROUP", &defaults.consumer_group),
            key_prefix: env_or_default("DLQ_KEY_PREFIX", &defaults.key_prefix),
            max_stream_length: env_parse("DLQ_MAX_STREAM_LENGTH", "100000")?,
            max_requeue_attempts: env_parse("DLQ_MAX_REQUEUE_ATTEMPTS", "3")?,
            block_timeout_ms: env_parse("DLQ_BLOCK_TIMEOUT_MS", "5000")?,
            claim_timeout_ms: env_parse("DLQ_CLAIM_TIMEOUT_MS", "60000")?,
            batch_size: env_parse("DLQ_BATCH_SIZE", "100")?,
        };

        config.validate()?;
        Ok(config)
    }
}
