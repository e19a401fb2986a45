//! Database error type and behavioural classification.

use std::time::Duration;

use resilience::FailureClass;
use tokio_postgres::error::SqlState;

/// Unified error type for pool and cluster operations.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// Driver-level error: I/O, contention and integrity faults all arrive
    /// through here; use [`DatabaseError::failure_class`] to tell them apart.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Pool construction or management error.
    #[error("Pool error: {0}")]
    Pool(String),

    /// The pool was used before `initialize()`. Never retried.
    #[error("Pool not initialized. Call initialize() first.")]
    NotInitialized,

    /// No connection became available within the acquisition timeout.
    #[error("Timed out acquiring a connection after {waited:?}")]
    AcquireTimeout { waited: Duration },

    /// A query exceeded its per-call (or pool-wide) command timeout.
    #[error("Query timed out after {elapsed:?}")]
    QueryTimeout { elapsed: Duration },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] core_config::ConfigError),
}

/// Result type alias for database operations
pub type DatabaseResult<T> = Result<T, DatabaseError>;

impl DatabaseError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::AcquireTimeout { .. } | Self::QueryTimeout { .. }
        )
    }

    /// Serialization failure or deadlock under higher isolation. The caller
    /// typically retries at transaction granularity.
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Postgres(e) if e.code().is_some_and(|code| {
            *code == SqlState::T_R_SERIALIZATION_FAILURE || *code == SqlState::T_R_DEADLOCK_DETECTED
        }))
    }

    /// Uniqueness / check / null / foreign-key violation. Never retried
    /// silently.
    pub fn is_integrity(&self) -> bool {
        // SQLSTATE class 23: integrity constraint violations.
        matches!(self, Self::Postgres(e) if e
            .code()
            .is_some_and(|code| code.code().starts_with("23")))
    }
}

impl FailureClass for DatabaseError {
    fn failure_class(&self) -> &str {
        match self {
            Self::NotInitialized => "programmer",
            Self::Config(_) => "config",
            Self::AcquireTimeout { .. } | Self::QueryTimeout { .. } => "timeout",
            Self::Postgres(_) if self.is_contention() => "contention",
            Self::Postgres(_) if self.is_integrity() => "integrity",
            Self::Postgres(_) | Self::Pool(_) => "io",
        }
    }
}
