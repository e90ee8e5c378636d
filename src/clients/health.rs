use std::{collections::HashMap, sync::Arc};

use anyhow::Error;
use chrono::{SecondsFormat, Utc};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    clients::{broker::Broker, identity::IdentityStore, redis::RedisClient},
    models::health::{Criticality, HealthCheckResponse, HealthStatus, ServiceHealth},
};

const CRITICAL_CHECKS: &[&str] = &["message_broker", "consumer_broker", "identity_store"];

/// Probes the service's dependencies for the `/health` endpoint.
pub struct HealthChecker {
    broker: Arc<dyn Broker>,
    consumer_broker: Option<Arc<dyn Broker>>,
    identity_store: Arc<dyn IdentityStore>,
    redis_client: Option<RedisClient>,
}

impl HealthChecker {
    pub fn new(
        broker: Arc<dyn Broker>,
        identity_store: Arc<dyn IdentityStore>,
        redis_client: Option<RedisClient>,
    ) -> Self {
        Self {
            broker,
            consumer_broker: None,
            identity_store,
            redis_client,
        }
    }

    /// Also checks the connection the notification workers consume from,
    /// when it is separate from the publishing one.
    pub fn with_consumer_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.consumer_broker = Some(broker);
        self
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let mut checks = HashMap::new();

        checks.insert(
            "message_broker".to_string(),
            timed_check("message_broker", self.broker.health_check()).await,
        );
        if let Some(consumer_broker) = &self.consumer_broker {
            checks.insert(
                "consumer_broker".to_string(),
                timed_check("consumer_broker", consumer_broker.health_check()).await,
            );
        }
        checks.insert(
            "identity_store".to_string(),
            timed_check("identity_store", self.identity_store.health_check()).await,
        );

        // Redis only backs delivery idempotency.
        if let Some(redis_client) = &self.redis_client {
            checks.insert(
                "cache_service".to_string(),
                timed_check("cache_service", redis_client.health_check()).await,
            );
        }

        HealthCheckResponse {
            status: Self::determine_overall_status(&checks),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            checks,
        }
    }

    /// Unhealthy if any critical dependency is down, degraded if anything
    /// else is.
    pub fn determine_overall_status(checks: &HashMap<String, ServiceHealth>) -> HealthStatus {
        let critical_down = checks.iter().any(|(name, health)| {
            criticality(name) == Criticality::Critical && health.status != HealthStatus::Healthy
        });

        if critical_down {
            HealthStatus::Unhealthy
        } else if checks.values().any(|h| h.status != HealthStatus::Healthy) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

fn criticality(check: &str) -> Criticality {
    if CRITICAL_CHECKS.contains(&check) {
        Criticality::Critical
    } else {
        Criticality::Auxiliary
    }
}

async fn timed_check(
    name: &'static str,
    check: impl Future<Output = Result<(), Error>>,
) -> ServiceHealth {
    let started = Instant::now();

    match check.await {
        Ok(()) => {
            let elapsed = started.elapsed();
            debug!(
                check = name,
                response_time_ms = elapsed.as_millis() as u64,
                "Health check passed"
            );
            ServiceHealth::healthy(elapsed)
        }
        Err(e) => {
            warn!(check = name, error = %e, "Health check failed");
            ServiceHealth::failed(criticality(name), e)
        }
    }
}
