//! Health-report contracts shared by the connection pool, the database
//! cluster and the dead-letter queue.
//!
//! Monitoring collaborators consume these as-is; messages are human-readable
//! and never carry stack traces.

use serde::{Deserialize, Serialize};

/// Four-state health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Initializing,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Initializing => "initializing",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a health probe against a single component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResult {
    pub status: HealthStatus,
    pub pool_size: u32,
    pub pool_max_size: u32,
    pub pool_idle_size: u32,
    /// Probe round-trip in seconds, when the probe succeeded.
    pub latency_seconds: Option<f64>,
    pub message: Option<String>,
}

impl HealthResult {
    /// Component exists but has not been initialized yet.
    pub fn initializing(pool_max_size: u32) -> Self {
        Self {
            status: HealthStatus::Initializing,
            pool_size: 0,
            pool_max_size,
            pool_idle_size: 0,
            latency_seconds: None,
            message: Some("Pool not initialized".to_string()),
        }
    }

    /// Probe failed; `error` is surfaced as the message.
    pub fn unhealthy(pool_max_size: u32, error: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            pool_size: 0,
            pool_max_size,
            pool_idle_size: 0,
            latency_seconds: None,
            message: Some(error.into()),
        }
    }

    /// Probe succeeded within bounded time.
    pub fn healthy(
        pool_size: u32,
        pool_max_size: u32,
        pool_idle_size: u32,
        latency_seconds: f64,
    ) -> Self {
        Self {
            status: HealthStatus::Healthy,
            pool_size,
            pool_max_size,
            pool_idle_size,
            latency_seconds: Some(latency_seconds),
            message: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    /// Pool utilization as a percentage of `pool_max_size`.
    pub fn utilization_pct(&self) -> f64 {
        if self.pool_max_size == 0 {
            return 0.0;
        }
        (self.pool_size as f64 / self.pool_max_size as f64) * 100.0
    }
}

/// Health of one replica, tagged with its endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaHealth {
    pub host: String,
    pub port: u16,
    #[serde(flatten)]
    pub health: HealthResult,
}

/// Aggregated health of a primary/replica cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterHealthResult {
    pub status: HealthStatus,
    pub primary: HealthResult,
    pub replicas: Vec<ReplicaHealth>,
    pub healthy_replica_count: usize,
    pub total_replica_count: usize,
}

impl ClusterHealthResult {
    /// Primary and every replica are healthy.
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    /// The cluster can serve requests (primary healthy), replicas aside.
    pub fn is_operational(&self) -> bool {
        self.primary.status == HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        let init = HealthResult::initializing(20);
        assert_eq!(init.status, HealthStatus::Initializing);
        assert_eq!(init.pool_max_size, 20);
        assert!(!init.is_healthy());

        let bad = HealthResult::unhealthy(20, "connection refused");
        assert_eq!(bad.status, HealthStatus::Unhealthy);
        assert_eq!(bad.message.as_deref(), Some("connection refused"));

        let good = HealthResult::healthy(10, 20, 4, 0.003);
        assert!(good.is_healthy());
        assert_eq!(good.latency_seconds, Some(0.003));
    }

    #[test]
    fn test_utilization_pct() {
        let result = HealthResult::healthy(10, 20, 4, 0.001);
        assert!((result.utilization_pct() - 50.0).abs() < f64::EPSILON);

        let empty = HealthResult::unhealthy(0, "down");
        assert_eq!(empty.utilization_pct(), 0.0);
    }

    #[test]
    fn test_cluster_predicates() {
        let cluster = ClusterHealthResult {
            status: HealthStatus::Degraded,
            primary: HealthResult::healthy(5, 10, 2, 0.001),
            replicas: vec![ReplicaHealth {
                host: "replica-1.db".to_string(),
                port: 5432,
                health: HealthResult::unhealthy(10, "timeout"),
            }],
            healthy_replica_count: 0,
            total_replica_count: 1,
        };

        assert!(!cluster.is_healthy());
        assert!(cluster.is_operational());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&HealthStatus::Degraded).unwrap();
        assert_eq!(json, "\"degraded\"");
        assert_eq!(HealthStatus::Degraded.to_string(), "degraded");
    }
}
