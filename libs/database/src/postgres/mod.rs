//! PostgreSQL connection pool and primary/replica cluster.

mod cluster;
mod config;
mod pool;

pub use cluster::Cluster;
pub use config::{
    ClusterConfig, ConnectionSettings, PoolConfig, PoolSettings, ServerSettings, SslMode,
    StatementCacheSettings,
};
pub use pool::{CursorOptions, IsolationLevel, Pool, PoolClient, TransactionOptions};

// Re-export driver types that appear in the public API.
pub use tokio_postgres::Row;
pub use tokio_postgres::types::ToSql;
