use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// How much a dependency outage matters to the service as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criticality {
    /// The admission chain or the queue can't work without it.
    Critical,
    /// Only a safeguard depends on it.
    Auxiliary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: HealthStatus,
    pub timestamp: String,
    pub checks: HashMap<String, ServiceHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceHealth {
    pub fn healthy(response_time: Duration) -> Self {
        Self {
            status: HealthStatus::Healthy,
            response_time_ms: Some(response_time.as_millis() as u64),
            error: None,
        }
    }

    /// A failed check: unhealthy for critical dependencies, degraded otherwise.
    pub fn failed(criticality: Criticality, error: impl ToString) -> Self {
        let status = match criticality {
            Criticality::Critical => HealthStatus::Unhealthy,
            Criticality::Auxiliary => HealthStatus::Degraded,
        };

        Self {
            status,
            response_time_ms: None,
            error: Some(error.to_string()),
        }
    }
}
