//! Health reporting for the connection pool
//!
//! Turns a [`PoolStats`] snapshot into a status the HTTP layer and the CLI
//! can show.

use crate::db::PoolStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Share of issued connections in use above which the pool counts as
/// degraded
pub const DEGRADED_UTILIZATION_PERCENT: f64 = 80.0;

/// Overall health status of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Close to exhaustion
    Degraded,
    /// Closed
    Unhealthy,
}

/// Connection pool health information
#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub status: HealthStatus,
    pub utilization_percent: f64,
    pub pool: PoolStats,
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl PoolHealth {
    pub fn from_stats(stats: PoolStats) -> Self {
        let utilization_percent = if stats.max_size > 0 {
            (stats.in_use as f64 / stats.max_size as f64) * 100.0
        } else {
            0.0
        };

        let (status, message) = if stats.closed {
            (HealthStatus::Unhealthy, Some("Connection pool is closed".to_string()))
        } else if utilization_percent > DEGRADED_UTILIZATION_PERCENT {
            (
                HealthStatus::Degraded,
                Some("High connection pool utilization".to_string()),
            )
        } else {
            (HealthStatus::Healthy, None)
        };

        Self {
            status,
            utilization_percent,
            pool: stats,
            message,
            checked_at: Utc::now(),
        }
    }
}
