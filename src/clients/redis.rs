use anyhow::{Error, Result, anyhow};
use redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use tracing::{info, warn};

use crate::{
    config::Config,
    models::{retry::RetryConfig, status::IdempotencyStatus},
    utils::retry_with_backoff,
};

const KEY_PREFIX: &str = "notification:";

fn marker_key(command_id: &str) -> String {
    format!("{}{}", KEY_PREFIX, command_id)
}

/// Delivery markers keyed by notification command id. Every marker expires
/// after the configured TTL, so a crashed worker's claim is released.
#[derive(Clone)]
pub struct RedisClient {
    connection: MultiplexedConnection,
    marker_ttl_seconds: u64,
    retry_config: RetryConfig,
}

impl RedisClient {
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        info!("Connecting to Redis...");

        let client = Client::open(config.redis_url.as_str())
            .map_err(|e| anyhow!("Failed to create redis client: {}", e))?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| anyhow!("Failed to connect to redis: {}", e))?;

        info!("Redis connection established");

        Ok(Self {
            connection,
            marker_ttl_seconds: config.idempotency_ttl_seconds,
            retry_config: config.retry_config(),
        })
    }

    pub async fn check_idempotency(&self, command_id: &str) -> Result<IdempotencyStatus, Error> {
        let mut connection = self.connection.clone();

        let marker: Option<String> = connection
            .get(marker_key(command_id))
            .await
            .map_err(|e| anyhow!("Failed to read delivery marker: {}", e))?;

        let Some(marker) = marker else {
            return Ok(IdempotencyStatus::NotFound);
        };

        Ok(IdempotencyStatus::from_marker(&marker).unwrap_or_else(|| {
            warn!(command_id, marker = %marker, "Unknown delivery marker, ignoring");
            IdempotencyStatus::NotFound
        }))
    }

    /// Claims the command for this worker. A marker left by a failed attempt
    /// is taken over; one that is processing or sent is not.
    pub async fn try_mark_as_processing(&self, command_id: &str) -> Result<bool, Error> {
        if self.set_if_absent(command_id, IdempotencyStatus::Processing).await? {
            return Ok(true);
        }

        match self.check_idempotency(command_id).await? {
            IdempotencyStatus::Failed | IdempotencyStatus::NotFound => {
                self.set_marker(command_id, IdempotencyStatus::Processing)
                    .await?;
                Ok(true)
            }
            IdempotencyStatus::Processing | IdempotencyStatus::Sent => Ok(false),
        }
    }

    /// Retried in-process: losing this marker means a redelivery sends the
    /// notification twice.
    pub async fn mark_as_sent(&self, command_id: &str) -> Result<(), Error> {
        retry_with_backoff(&self.retry_config, || {
            self.set_marker(command_id, IdempotencyStatus::Sent)
        })
        .await
    }

    pub async fn mark_as_failed(&self, command_id: &str) -> Result<(), Error> {
        self.set_marker(command_id, IdempotencyStatus::Failed).await
    }

    pub async fn health_check(&self) -> Result<(), Error> {
        let mut connection = self.connection.clone();

        connection
            .ping::<String>()
            .await
            .map_err(|e| anyhow!("Redis ping failed: {}", e))?;

        Ok(())
    }

    async fn set_marker(&self, command_id: &str, status: IdempotencyStatus) -> Result<(), Error> {
        let mut connection = self.connection.clone();

        connection
            .set_ex::<_, _, ()>(
                marker_key(command_id),
                status.as_marker(),
                self.marker_ttl_seconds,
            )
            .await
            .map_err(|e| anyhow!("Failed to store '{}' marker: {}", status.as_marker(), e))
    }

    async fn set_if_absent(&self, command_id: &str, status: IdempotencyStatus) -> Result<bool, Error> {
        let mut connection = self.connection.clone();

        let reply: Option<String> = redis::cmd("SET")
            .arg(marker_key(command_id))
            .arg(status.as_marker())
            .arg("NX")
            .arg("EX")
            .arg(self.marker_ttl_seconds)
            .query_async(&mut connection)
            .await
            .map_err(|e| anyhow!("Failed to claim delivery marker: {}", e))?;

        Ok(reply.is_some())
    }
}
