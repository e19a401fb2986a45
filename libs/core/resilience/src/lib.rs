//! Retry engine with bounded attempts, full-jitter exponential backoff and
//! lifecycle hooks.
//!
//! The engine is pure policy: it drives a caller-supplied unit of work (sync
//! or async) and never imposes a deadline of its own. Wrap the call site in a
//! timeout when one is needed.
//!
//! # Example
//!
//! ```rust,ignore
//! use resilience::{Retry, RetryConfig};
//!
//! let retry = Retry::new(RetryConfig::default().with_max_attempts(5))?
//!     .on_before_sleep(|attempt, delay| {
//!         tracing::warn!(attempt, ?delay, "backing off before next attempt");
//!     });
//!
//! let rows = retry.run(|| pool.fetch("SELECT * FROM jobs", &[], None)).await?;
//! ```

mod config;
mod retry;

pub use config::RetryConfig;
pub use retry::{FailureClass, Retry, RetryError};

/// Result type alias for retry-wrapped operations.
pub type RetryResult<T, E> = Result<T, RetryError<E>>;
