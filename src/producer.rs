use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    clients::broker::Broker,
    models::{message::NotificationCommand, topology::TopologyConfig},
    trace::TraceContext,
};

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("Failed to serialize notification command: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to publish notification command: {0}")]
    Publish(anyhow::Error),
}

/// Publishes notification commands to the main routing key of the
/// notification exchange.
#[derive(Clone)]
pub struct NotificationProducer {
    broker: Arc<dyn Broker>,
    exchange: String,
    routing_key: String,
}

impl NotificationProducer {
    pub fn new(broker: Arc<dyn Broker>, topology: &TopologyConfig) -> Self {
        Self {
            broker,
            exchange: topology.exchange.clone(),
            routing_key: topology.main_routing_key.clone(),
        }
    }

    /// Returns after the broker has confirmed the message. From then on
    /// delivery is the broker's and the consumer's concern.
    ///
    /// A command without a correlation id picks up the one of the current
    /// trace scope, so consumer logs line up with the originating request.
    pub async fn publish(&self, command: &NotificationCommand) -> Result<(), ProducerError> {
        let payload = if command.correlation_id.is_none() {
            let command = command
                .clone()
                .with_correlation_id(TraceContext::current_correlation_id());
            serde_json::to_vec(&command)?
        } else {
            serde_json::to_vec(command)?
        };

        self.broker
            .publish(&self.exchange, &self.routing_key, &payload)
            .await
            .map_err(|e| {
                warn!(command_id = %command.id, error = %e, "Notification publish failed");
                ProducerError::Publish(e)
            })?;

        debug!(
            command_id = %command.id,
            channel = command.channel.as_str(),
            exchange = %self.exchange,
            routing_key = %self.routing_key,
            "Notification command published"
        );

        Ok(())
    }
}
