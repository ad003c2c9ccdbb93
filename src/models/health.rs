use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ordered by severity, so the worst component decides the overall status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// State of one dependency of the worker: the broker link or a queue backlog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ComponentHealth {
    pub fn reachable(latency_ms: u64, message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            latency_ms: Some(latency_ms),
            message: Some(message.into()),
        }
    }

    /// Reachable, but holding work that needs an operator.
    pub fn backlog(latency_ms: u64, message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            latency_ms: Some(latency_ms),
            message: Some(message.into()),
        }
    }

    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            latency_ms: None,
            message: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthReport {
    pub fn from_components(components: BTreeMap<String, ComponentHealth>) -> Self {
        let status = components
            .values()
            .map(|component| component.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        Self {
            status,
            checked_at: Utc::now(),
            components,
        }
    }
}
