//! Liveness/readiness/health checks (§0.5).
//!
//! Grounded on the existing `HealthResponse`/`ServiceHealth` shape this
//! codebase already serves from `lib.rs`, trimmed to the one dependency this
//! system actually has: the Postgres pool (no Redis).

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,
    pub response_time_ms: Option<u64>,
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub correlation_id: Uuid,
    pub services: HashMap<String, ServiceHealth>,
}

pub struct HealthChecker;

impl HealthChecker {
    pub fn new() -> Self {
        Self
    }

    /// Full health check (§0.5): reports `healthy`/`degraded`/`unhealthy`
    /// from the database pool's reachability.
    pub async fn check_health(&self, pool: &PgPool) -> HealthCheckResponse {
        let started = Instant::now();
        let db_result = sqlx::query("SELECT 1").execute(pool).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let (db_status, message) = match db_result {
            Ok(_) => (HealthStatus::Healthy, None),
            Err(e) => (HealthStatus::Unhealthy, Some(e.to_string())),
        };

        let overall = if db_status == HealthStatus::Healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };

        let mut services = HashMap::new();
        services.insert(
            "database".to_string(),
            ServiceHealth {
                status: db_status,
                response_time_ms: Some(elapsed_ms),
                message,
            },
        );

        HealthCheckResponse {
            status: overall,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            correlation_id: Uuid::new_v4(),
            services,
        }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

/// Kubernetes readiness probe: the process can accept traffic.
pub async fn readiness_check(pool: &PgPool) -> Result<()> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map(|_| ())
        .map_err(AppError::Database)
}

/// Kubernetes liveness probe: the process is not deadlocked. Checks no
/// external dependency, matching the existing split between liveness
/// (process alive) and readiness (dependencies reachable).
pub async fn liveness_check() -> Result<()> {
    Ok(())
}
