//! Database cluster with explicit primary/replica access.
//!
//! The cluster intentionally does NOT auto-route queries on read-only hints.
//! Replication lag, read-your-writes flows and transaction boundaries make
//! "is a replica safe here?" a question only the caller can answer, so every
//! operation goes through an explicit choice of [`Cluster::primary`] or
//! [`Cluster::replica`].
//!
//! Use a replica only when the query is read-only, staleness is acceptable,
//! and the read is not part of a read-after-write flow. When in doubt, use
//! the primary.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use futures::future::join_all;
use health::{ClusterHealthResult, HealthStatus, ReplicaHealth};
use tracing::{info, warn};

use super::config::ClusterConfig;
use super::pool::Pool;
use crate::common::DatabaseResult;

/// One primary pool plus zero or more replica pools.
///
/// The pools themselves carry no topology; the cluster owns it.
pub struct Cluster {
    primary: Arc<Pool>,
    replicas: RwLock<Vec<Arc<Pool>>>,
    replica_cursor: AtomicUsize,
}

impl Cluster {
    pub fn new(primary: Pool, replicas: Vec<Pool>) -> Self {
        Self {
            primary: Arc::new(primary),
            replicas: RwLock::new(replicas.into_iter().map(Arc::new).collect()),
            replica_cursor: AtomicUsize::new(0),
        }
    }

    /// Build an uninitialized cluster from a validated config.
    pub fn from_config(config: ClusterConfig) -> DatabaseResult<Self> {
        let primary = Pool::new(config.primary)?;
        let replicas = config
            .replicas
            .into_iter()
            .map(Pool::new)
            .collect::<DatabaseResult<Vec<_>>>()?;
        Ok(Self::new(primary, replicas))
    }

    /// Initialize all pools. The primary is initialized first and its
    /// failure aborts; replicas are initialized concurrently and a failed
    /// replica is dropped from the rotation with a warning.
    pub async fn initialize(&self) -> DatabaseResult<()> {
        self.primary.initialize().await?;
        info!("Primary pool initialized");

        let replicas = self.replicas_snapshot();
        let results = join_all(replicas.iter().map(|replica| replica.initialize())).await;

        let mut healthy = Vec::with_capacity(replicas.len());
        for (index, (replica, result)) in replicas.into_iter().zip(results).enumerate() {
            match result {
                Ok(()) => {
                    info!(replica_index = index, "Replica pool initialized");
                    healthy.push(replica);
                }
                Err(e) => {
                    warn!(
                        replica_index = index,
                        error = %e,
                        "Replica pool failed to initialize, dropping from rotation"
                    );
                }
            }
        }

        let count = healthy.len();
        *self.replicas.write().unwrap() = healthy;
        info!(replica_count = count, "Database cluster initialized");
        Ok(())
    }

    /// Close every pool concurrently.
    pub async fn close(&self) {
        let replicas = self.replicas_snapshot();
        let closes = std::iter::once(&self.primary)
            .chain(replicas.iter())
            .map(|pool| pool.close());
        join_all(closes).await;
        info!("Database cluster closed");
    }

    /// The primary pool: all writes, read-your-writes flows, and any
    /// transaction mixing reads and writes.
    pub fn primary(&self) -> Arc<Pool> {
        self.primary.clone()
    }

    /// A replica pool for stale-tolerant reads, chosen round-robin over the
    /// healthy replicas in insertion order. Falls back to the primary when
    /// no replicas remain.
    pub fn replica(&self) -> Arc<Pool> {
        let replicas = self.replicas.read().unwrap();
        if replicas.is_empty() {
            return self.primary.clone();
        }
        let index = self.replica_cursor.fetch_add(1, Ordering::Relaxed) % replicas.len();
        replicas[index].clone()
    }

    /// Probe the primary and every replica concurrently.
    ///
    /// Overall status: unhealthy when the primary is unhealthy, degraded
    /// when any replica is, healthy otherwise.
    pub async fn health_check(&self) -> ClusterHealthResult {
        let replicas = self.replicas_snapshot();

        let (primary_health, replica_healths) = futures::join!(
            self.primary.health_check(),
            join_all(replicas.iter().map(|replica| replica.health_check()))
        );

        let mut infos = Vec::with_capacity(replicas.len());
        let mut healthy_count = 0;
        for (replica, result) in replicas.iter().zip(replica_healths) {
            if result.is_healthy() {
                healthy_count += 1;
            }
            infos.push(ReplicaHealth {
                host: replica.config().connection.host.clone(),
                port: replica.config().connection.port,
                health: result,
            });
        }

        let status = if !primary_health.is_healthy() {
            HealthStatus::Unhealthy
        } else if healthy_count < infos.len() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        ClusterHealthResult {
            status,
            primary: primary_health,
            total_replica_count: infos.len(),
            healthy_replica_count: healthy_count,
            replicas: infos,
        }
    }

    /// Warm up the primary (failure propagates) and every replica (failure
    /// logged).
    pub async fn warmup(&self) -> DatabaseResult<()> {
        self.primary.warmup().await?;

        for (index, replica) in self.replicas_snapshot().iter().enumerate() {
            if let Err(e) = replica.warmup().await {
                warn!(replica_index = index, error = %e, "Replica warmup failed");
            }
        }
        Ok(())
    }

    /// Number of replicas currently in the rotation.
    pub fn replica_count(&self) -> usize {
        self.replicas.read().unwrap().len()
    }

    pub fn has_replicas(&self) -> bool {
        self.replica_count() > 0
    }

    fn replicas_snapshot(&self) -> Vec<Arc<Pool>> {
        self.replicas.read().unwrap().clone()
    }
}
