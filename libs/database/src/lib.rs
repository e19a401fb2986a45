//! PostgreSQL connection management for the job platform.
//!
//! Two building blocks:
//!
//! - [`postgres::Pool`] — a bounded connection pool for a single database
//!   endpoint, with FIFO acquisition, per-call timeouts, transactions,
//!   cursors and bulk loading.
//! - [`postgres::Cluster`] — one primary pool plus zero or more replica
//!   pools with *explicit* routing. The caller picks `.primary()` or
//!   `.replica()` per operation; nothing is auto-routed on read-only hints,
//!   because only the caller knows whether a read must see its own writes.
//!
//! # Examples
//!
//! ```ignore
//! use database::postgres::{Cluster, ClusterConfig, PoolConfig};
//!
//! let config = ClusterConfig::with_replica_hosts(
//!     PoolConfig::default(),
//!     ["replica-1.db.internal", "replica-2.db.internal"],
//! );
//! let cluster = Cluster::from_config(config)?;
//! cluster.initialize().await?;
//!
//! // Writes and read-your-writes flows: primary.
//! cluster.primary().execute("INSERT INTO jobs (id) VALUES ($1)", &[&id], None).await?;
//!
//! // Stale-tolerant analytics: replica.
//! let rows = cluster.replica().fetch("SELECT * FROM jobs", &[], None).await?;
//! ```

pub mod common;
pub mod postgres;

pub use common::{DatabaseError, DatabaseResult};
