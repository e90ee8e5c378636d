use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::models::{rate_limit::RateLimitPolicy, retry::RetryConfig, topology::TopologyConfig};

#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    #[default]
    Rabbitmq,
    Memory,
}

#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    #[serde(default)]
    pub broker_backend: BrokerBackend,
    pub rabbitmq_url: String,
    pub exchange_name: String,
    pub main_queue_name: String,
    pub retry_queue_name: String,
    pub main_routing_key: String,
    pub retry_routing_key: String,
    pub retry_ttl_ms: u64,
    pub parking_queue_name: Option<String>,
    pub max_delivery_attempts: Option<u32>,
    pub prefetch_count: u16,
    pub worker_concurrency: usize,

    pub redis_url: String,
    pub idempotency_ttl_seconds: u64,

    pub database_url: String,

    pub fcm_project_id: String,
    pub relay_webhook_url: Option<String>,

    pub jwt_secret: String,
    #[serde(default = "default_jwt_ttl_seconds")]
    pub jwt_ttl_seconds: u64,

    pub api_rate_limit_capacity: u32,
    pub api_rate_limit_window_seconds: u64,
    pub otp_rate_limit_capacity: u32,
    pub otp_rate_limit_window_seconds: u64,
    pub verification_rate_limit_capacity: u32,
    pub verification_rate_limit_window_seconds: u64,
    #[serde(default = "default_rate_limit_cleanup_threshold")]
    pub rate_limit_cleanup_threshold: usize,

    #[serde(default = "default_passcode_ttl_seconds")]
    pub passcode_ttl_seconds: u64,

    pub max_retry_attempts: u32,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub retry_backoff_multiplier: u64,

    pub server_port: u16,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_jwt_ttl_seconds() -> u64 {
    3600
}

fn default_rate_limit_cleanup_threshold() -> usize {
    10_000
}

fn default_passcode_ttl_seconds() -> u64 {
    300
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.main_routing_key == self.retry_routing_key {
            return Err(anyhow!(
                "MAIN_ROUTING_KEY and RETRY_ROUTING_KEY must differ"
            ));
        }

        if self.retry_ttl_ms == 0 || self.retry_ttl_ms > u64::from(u32::MAX) {
            return Err(anyhow!("RETRY_TTL_MS must be between 1 and {}", u32::MAX));
        }

        if self.max_delivery_attempts.is_some() && self.parking_queue_name.is_none() {
            return Err(anyhow!(
                "MAX_DELIVERY_ATTEMPTS requires PARKING_QUEUE_NAME"
            ));
        }

        if self.worker_concurrency == 0 {
            return Err(anyhow!("WORKER_CONCURRENCY must be at least 1"));
        }

        Ok(())
    }

    pub fn topology(&self) -> TopologyConfig {
        TopologyConfig {
            exchange: self.exchange_name.clone(),
            main_queue: self.main_queue_name.clone(),
            retry_queue: self.retry_queue_name.clone(),
            main_routing_key: self.main_routing_key.clone(),
            retry_routing_key: self.retry_routing_key.clone(),
            retry_ttl: Duration::from_millis(self.retry_ttl_ms),
            parking_queue: self.parking_queue_name.clone(),
        }
    }

    pub fn api_rate_limit_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy::new(
            "api",
            self.api_rate_limit_capacity,
            Duration::from_secs(self.api_rate_limit_window_seconds),
        )
    }

    pub fn otp_rate_limit_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy::new(
            "otp",
            self.otp_rate_limit_capacity,
            Duration::from_secs(self.otp_rate_limit_window_seconds),
        )
    }

    pub fn verification_rate_limit_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy::new(
            "verification",
            self.verification_rate_limit_capacity,
            Duration::from_secs(self.verification_rate_limit_window_seconds),
        )
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retry_attempts,
            initial_delay_ms: self.initial_retry_delay_ms,
            max_delay_ms: self.max_retry_delay_ms,
            backoff_multiplier: self.retry_backoff_multiplier,
        }
    }
}
