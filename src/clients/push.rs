use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use gcp_auth::TokenProvider;
use reqwest::Client;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::{
    clients::redis::RedisClient,
    config::Config,
    models::{
        fcm::FcmRequest,
        message::{Channel, NotificationCommand},
        retry::RetryConfig,
        status::IdempotencyStatus,
        validation::validate_device_token,
    },
    utils::retry_with_backoff,
};

const FCM_SCOPES: &[&str] = &["https://www.googleapis.com/auth/firebase.messaging"];
const FCM_BASE_URL: &str = "https://fcm.googleapis.com";
const RELAY_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends one notification through an external provider.
///
/// The consumer may call this again for a command that already went out
/// (redelivery after a lost ack), so implementations must tolerate repeats.
#[async_trait]
pub trait NotificationDeliverer: Send + Sync {
    async fn deliver(&self, command: &NotificationCommand) -> Result<(), Error>;
}

pub struct FcmDeliverer {
    http_client: Client,
    base_url: String,
    fcm_project_id: String,
    retry_config: RetryConfig,
    token_provider: OnceCell<Arc<dyn TokenProvider>>,
}

impl FcmDeliverer {
    pub fn new(config: &Config) -> Self {
        info!(project_id = %config.fcm_project_id, "FCM deliverer initialized");

        Self {
            http_client: Client::new(),
            base_url: FCM_BASE_URL.to_string(),
            fcm_project_id: config.fcm_project_id.clone(),
            retry_config: config.retry_config(),
            token_provider: OnceCell::new(),
        }
    }

    async fn send_once(&self, request: &FcmRequest) -> Result<(), Error> {
        let provider = self
            .token_provider
            .get_or_try_init(gcp_auth::provider)
            .await
            .map_err(|e| anyhow!("Failed to initialise GCP credentials: {}", e))?;

        let token = provider.token(FCM_SCOPES).await?;

        let url = format!(
            "{}/v1/projects/{}/messages:send",
            self.base_url, self.fcm_project_id
        );

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(token.as_str())
            .json(request)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let error_text = response.text().await?;
            Err(anyhow!("FCM request failed ({}): {}", status, error_text))
        }
    }
}

#[async_trait]
impl NotificationDeliverer for FcmDeliverer {
    async fn deliver(&self, command: &NotificationCommand) -> Result<(), Error> {
        validate_device_token(&command.recipient)?;

        debug!(command_id = %command.id, "Sending FCM push notification");

        let request = FcmRequest::for_command(command);

        retry_with_backoff(&self.retry_config, || self.send_once(&request)).await?;

        info!(command_id = %command.id, "FCM push notification sent successfully");
        Ok(())
    }
}

/// Hands email and SMS commands to an HTTP relay that owns the provider
/// integration. The command id is sent as `Idempotency-Key`.
pub struct WebhookDeliverer {
    http_client: Client,
    url: String,
}

impl WebhookDeliverer {
    pub fn new(url: impl Into<String>) -> Result<Self, Error> {
        let http_client = Client::builder()
            .timeout(RELAY_TIMEOUT)
            .build()
            .map_err(|e| anyhow!("Failed to build relay HTTP client: {}", e))?;

        Ok(Self {
            http_client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationDeliverer for WebhookDeliverer {
    async fn deliver(&self, command: &NotificationCommand) -> Result<(), Error> {
        let response = self
            .http_client
            .post(&self.url)
            .header("Idempotency-Key", command.id.to_string())
            .json(command)
            .send()
            .await
            .map_err(|e| anyhow!("Relay request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Relay responded with {}: {}", status, body));
        }

        info!(
            command_id = %command.id,
            channel = command.channel.as_str(),
            "Notification handed to relay"
        );
        Ok(())
    }
}

/// Dispatches each command to the deliverer registered for its channel.
#[derive(Default)]
pub struct ChannelRouter {
    routes: HashMap<Channel, Arc<dyn NotificationDeliverer>>,
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(mut self, channel: Channel, deliverer: Arc<dyn NotificationDeliverer>) -> Self {
        self.routes.insert(channel, deliverer);
        self
    }
}

#[async_trait]
impl NotificationDeliverer for ChannelRouter {
    async fn deliver(&self, command: &NotificationCommand) -> Result<(), Error> {
        let deliverer = self
            .routes
            .get(&command.channel)
            .ok_or_else(|| anyhow!("No deliverer configured for channel '{}'", command.channel.as_str()))?;

        deliverer.deliver(command).await
    }
}

/// Skips commands already marked sent in Redis and claims the command id
/// before delivering, so concurrent redeliveries don't double-send.
pub struct IdempotentDeliverer {
    inner: Arc<dyn NotificationDeliverer>,
    redis_client: RedisClient,
}

impl IdempotentDeliverer {
    pub fn new(inner: Arc<dyn NotificationDeliverer>, redis_client: RedisClient) -> Self {
        Self {
            inner,
            redis_client,
        }
    }
}

#[async_trait]
impl NotificationDeliverer for IdempotentDeliverer {
    async fn deliver(&self, command: &NotificationCommand) -> Result<(), Error> {
        let key = command.id.to_string();

        if self.redis_client.check_idempotency(&key).await? == IdempotencyStatus::Sent {
            info!(command_id = %key, "Notification already sent, skipping");
            return Ok(());
        }

        if !self.redis_client.try_mark_as_processing(&key).await? {
            if self.redis_client.check_idempotency(&key).await? == IdempotencyStatus::Sent {
                return Ok(());
            }
            // Leave it to the retry loop; the other worker either finishes or
            // its claim expires.
            return Err(anyhow!("Notification {} is being delivered elsewhere", key));
        }

        match self.inner.deliver(command).await {
            Ok(()) => {
                self.redis_client.mark_as_sent(&key).await?;
                Ok(())
            }
            Err(e) => {
                if let Err(mark_err) = self.redis_client.mark_as_failed(&key).await {
                    warn!(command_id = %key, error = %mark_err, "Failed to record delivery failure");
                }
                Err(e)
            }
        }
    }
}
