use std::sync::Arc;

use anyhow::{Error, Result};
use chrono::{SecondsFormat, Utc};
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::{
    clients::{broker::Broker, push::NotificationDeliverer},
    models::{
        message::{Envelope, InboundMessage, ParkedMessage},
        retry::RetryConfig,
        status::DeliveryOutcome,
        topology::TopologyConfig,
    },
    trace::{TraceContext, generate_correlation_id, message_span},
};

const DEFAULT_EXCHANGE: &str = "";
const UNDECODABLE_COMMAND_ID: &str = "undecodable";

const RESUBSCRIBE_BACKOFF: RetryConfig = RetryConfig {
    max_attempts: u32::MAX,
    initial_delay_ms: 500,
    max_delay_ms: 30_000,
    backoff_multiplier: 2,
};

#[derive(Debug, Clone)]
struct ParkingPolicy {
    queue: String,
    max_attempts: u32,
}

/// Drains the main notification queue.
///
/// A delivered command is acknowledged. Anything else, including a payload
/// that does not decode, is rejected without requeue so the broker moves it to
/// the retry queue and brings it back after the retry TTL. Without an attempt
/// limit this loop has no end for a command that never succeeds.
#[derive(Clone)]
pub struct NotificationConsumer {
    broker: Arc<dyn Broker>,
    deliverer: Arc<dyn NotificationDeliverer>,
    main_queue: String,
    parking: Option<ParkingPolicy>,
}

impl NotificationConsumer {
    pub fn new(
        broker: Arc<dyn Broker>,
        deliverer: Arc<dyn NotificationDeliverer>,
        topology: &TopologyConfig,
    ) -> Self {
        Self {
            broker,
            deliverer,
            main_queue: topology.main_queue.clone(),
            parking: None,
        }
    }

    /// After `max_attempts` failed deliveries the command is moved to the
    /// topology's parking queue and acknowledged. Ignored when the topology
    /// has no parking queue.
    pub fn with_attempt_limit(mut self, topology: &TopologyConfig, max_attempts: u32) -> Self {
        match &topology.parking_queue {
            Some(queue) => {
                self.parking = Some(ParkingPolicy {
                    queue: queue.clone(),
                    max_attempts: max_attempts.max(1),
                });
            }
            None => warn!("Attempt limit ignored, no parking queue configured"),
        }
        self
    }

    /// Consumes until `shutdown` fires. Broker trouble never ends the loop:
    /// a message that could not be settled is left for the broker to redeliver,
    /// and a failed or closed subscription is reopened with backoff.
    pub async fn run(&self, consumer_tag: &str, shutdown: CancellationToken) {
        let mut failures: u32 = 0;

        'worker: while !shutdown.is_cancelled() {
            match self.broker.subscribe(&self.main_queue, consumer_tag).await {
                Ok(mut subscription) => {
                    info!(consumer_tag, queue = %self.main_queue, "Notification consumer subscribed");

                    loop {
                        let next = tokio::select! {
                            _ = shutdown.cancelled() => break 'worker,
                            next = subscription.next_message() => next,
                        };

                        match next {
                            Some(Ok(message)) => {
                                failures = 0;
                                let delivery_tag = message.delivery_tag;
                                if let Err(e) = self.handle(message).await {
                                    error!(
                                        consumer_tag,
                                        delivery_tag,
                                        error = %e,
                                        "Failed to settle message, leaving it to the broker"
                                    );
                                }
                            }
                            Some(Err(e)) => {
                                error!(consumer_tag, error = %e, "Subscription failed");
                                break;
                            }
                            None => {
                                warn!(consumer_tag, "Subscription closed by broker");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(consumer_tag, error = %e, "Failed to subscribe to notification queue");
                }
            }

            failures = failures.saturating_add(1);
            let delay = RESUBSCRIBE_BACKOFF.backoff(failures);
            warn!(
                consumer_tag,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "Resubscribing to notification queue"
            );

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        info!(consumer_tag, "Notification consumer stopped");
    }

    /// Processes one message and settles it with the broker. Errors are only
    /// returned when the broker itself could not be reached.
    pub async fn handle(&self, message: InboundMessage) -> Result<DeliveryOutcome, Error> {
        let envelope = match Envelope::decode(&message) {
            Ok(envelope) => envelope,
            Err(e) => {
                let correlation_id = generate_correlation_id();
                let attempt = message.death_count + 1;
                let span = message_span(&correlation_id, UNDECODABLE_COMMAND_ID, attempt);

                return TraceContext::with_correlation_id(correlation_id)
                    .scope(
                        async {
                            warn!(
                                delivery_tag = message.delivery_tag,
                                error = %e,
                                "Undecodable notification payload"
                            );
                            self.settle_failure(&message, attempt, format!("Invalid payload: {}", e))
                                .await
                        }
                        .instrument(span),
                    )
                    .await;
            }
        };

        let correlation_id = envelope
            .command
            .correlation_id
            .clone()
            .unwrap_or_else(generate_correlation_id);
        let span = message_span(
            &correlation_id,
            &envelope.command.id.to_string(),
            envelope.attempt(),
        );

        TraceContext::with_correlation_id(correlation_id)
            .scope(self.process(envelope, &message).instrument(span))
            .await
    }

    async fn process(
        &self,
        envelope: Envelope,
        message: &InboundMessage,
    ) -> Result<DeliveryOutcome, Error> {
        debug!(
            channel = envelope.command.channel.as_str(),
            redelivered = envelope.redelivered,
            "Delivering notification"
        );

        match self.deliverer.deliver(&envelope.command).await {
            Ok(()) => {
                self.broker.acknowledge(envelope.delivery_tag).await?;
                info!(attempt = envelope.attempt(), "Notification delivered");
                Ok(DeliveryOutcome::Delivered)
            }
            Err(e) => {
                self.settle_failure(message, envelope.attempt(), e.to_string())
                    .await
            }
        }
    }

    async fn settle_failure(
        &self,
        message: &InboundMessage,
        attempt: u32,
        reason: String,
    ) -> Result<DeliveryOutcome, Error> {
        let exhausted = self
            .parking
            .as_ref()
            .filter(|parking| attempt >= parking.max_attempts);

        if let Some(parking) = exhausted {
            match self.park(parking, message, attempt, &reason).await {
                Ok(()) => {
                    self.broker.acknowledge(message.delivery_tag).await?;
                    warn!(attempt, reason = %reason, queue = %parking.queue, "Notification parked");
                    return Ok(DeliveryOutcome::Parked);
                }
                Err(e) => {
                    error!(error = %e, "Parking failed, falling back to retry queue");
                }
            }
        }

        self.broker.reject(message.delivery_tag, false).await?;
        warn!(
            attempt,
            reason = %reason,
            "Notification delivery failed, dead-lettered for retry"
        );

        Ok(DeliveryOutcome::DeadLettered)
    }

    async fn park(
        &self,
        parking: &ParkingPolicy,
        message: &InboundMessage,
        attempts: u32,
        reason: &str,
    ) -> Result<(), Error> {
        let original_message = serde_json::from_slice(&message.data).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&message.data).into_owned())
        });

        let parked = ParkedMessage {
            original_message,
            failure_reason: reason.to_string(),
            attempts,
            parked_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };

        let payload = serde_json::to_vec(&parked)?;
        self.broker
            .publish(DEFAULT_EXCHANGE, &parking.queue, &payload)
            .await
    }
}

/// Starts `count` consumers on the same queue. The broker hands every message
/// to exactly one of them. Each worker runs until `shutdown` is cancelled.
pub fn spawn_workers(
    consumer: NotificationConsumer,
    count: usize,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|index| {
            let consumer = consumer.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let consumer_tag = format!("notification-worker-{}", index);
                consumer.run(&consumer_tag, shutdown).await
            })
        })
        .collect()
}
