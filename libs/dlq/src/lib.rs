//! Dead-Letter Queue on Redis Streams.
//!
//! A durable, at-least-once buffer for messages that failed their primary
//! processing path, backed by a single stream with one consumer group:
//!
//! - **Consumer groups** track delivery: `read` makes entries pending until
//!   `acknowledge` (XREADGROUP + XACK).
//! - **Bounded storage**: the stream is capped at `max_stream_length`,
//!   trimming oldest entries.
//! - **Bounded requeue**: an entry re-enqueued more than
//!   `max_requeue_attempts` times is discarded (and acked) instead of
//!   looping forever.
//! - **Stale recovery**: `claim_stale` reassigns entries whose consumer
//!   stopped acknowledging (XPENDING + XCLAIM).
//! - **Atomic redrive**: `redrive_one` moves an entry back to its origin
//!   queue with a single server-side script, so a crash can neither lose
//!   the message nor duplicate it.
//!
//! # Example
//!
//! ```rust,ignore
//! use dlq::{DeadLetterQueue, DLQConfig, EnqueueOptions, FailureDetail};
//!
//! let queue = DeadLetterQueue::new(redis, DLQConfig::default())?;
//! queue.initialize().await?;
//!
//! // Route a failed message.
//! let stream_id = queue
//!     .enqueue(
//!         b"message bytes",
//!         &FailureDetail::new("TimeoutError", "upstream timed out"),
//!         "translations",
//!         EnqueueOptions::default(),
//!     )
//!     .await?;
//!
//! // Process entries.
//! let entries = queue.read(None).await?;
//! queue.acknowledge(&entries).await?;
//!
//! // Replay to the origin queue once the underlying failure is fixed.
//! queue.redrive_one(&stream_id, "translations").await?;
//! ```

mod config;
mod domain;
mod error;
pub mod metrics;
mod service;

pub use config::DLQConfig;
pub use domain::{DeadLetterEntry, FailureCategory, FailureDetail};
pub use error::DlqError;
pub use service::{DeadLetterQueue, EnqueueOptions};

/// Result type alias for DLQ operations.
pub type DlqResult<T> = Result<T, DlqError>;
