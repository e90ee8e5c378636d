use std::sync::{PoisonError, RwLock};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    clients::broker::{Broker, Subscription},
    config::Config,
    models::{message::InboundMessage, topology::TopologyConfig},
};

const PERSISTENT: u8 = 2;

async fn open_channel(connection: &Connection, prefetch_count: u16) -> Result<Channel, Error> {
    let channel = connection
        .create_channel()
        .await
        .map_err(|e| anyhow!("RabbitMQ channel creation failed: {}", e))?;

    channel
        .basic_qos(prefetch_count, BasicQosOptions::default())
        .await
        .map_err(|e| anyhow!("Failed to set up QoS: {}", e))?;

    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .map_err(|e| anyhow!("Failed to enable publisher confirms: {}", e))?;

    Ok(channel)
}

pub struct RabbitMqClient {
    connection: Connection,
    channel: RwLock<Channel>,
    reopen: Mutex<()>,
    prefetch_count: u16,
}

impl RabbitMqClient {
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        info!("Connecting to RabbitMQ...");

        let connection = Connection::connect(&config.rabbitmq_url, ConnectionProperties::default())
            .await
            .map_err(|e| anyhow!("Failed to connect to RabbitMQ: {}", e))?;

        let channel = open_channel(&connection, config.prefetch_count).await?;

        info!(prefetch_count = config.prefetch_count, "RabbitMQ channel ready");

        Ok(Self {
            connection,
            channel: RwLock::new(channel),
            reopen: Mutex::new(()),
            prefetch_count: config.prefetch_count,
        })
    }

    fn channel(&self) -> Channel {
        self.channel
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The current channel, replaced first if the broker has closed it.
    /// Deliveries from the old channel are requeued by the broker, so nothing
    /// is lost with it.
    async fn usable_channel(&self) -> Result<Channel, Error> {
        let channel = self.channel();
        if channel.status().connected() {
            return Ok(channel);
        }

        let _reopening = self.reopen.lock().await;

        let channel = self.channel();
        if channel.status().connected() {
            return Ok(channel);
        }

        if !self.connection.status().connected() {
            return Err(anyhow!("RabbitMQ connection is closed"));
        }

        let fresh = open_channel(&self.connection, self.prefetch_count).await?;
        *self.channel.write().unwrap_or_else(PoisonError::into_inner) = fresh.clone();

        warn!("RabbitMQ channel was closed, opened a new one");
        Ok(fresh)
    }

    async fn declare_queue(&self, name: &str, arguments: FieldTable) -> Result<(), Error> {
        self.channel()
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|e| anyhow!("Failed to declare queue '{}': {}", name, e))?;

        debug!(queue = name, "Queue declared");
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), Error> {
        self.channel()
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                anyhow!(
                    "Failed to bind queue '{}' to '{}' with '{}': {}",
                    queue,
                    exchange,
                    routing_key,
                    e
                )
            })?;

        debug!(queue, exchange, routing_key, "Queue bound");
        Ok(())
    }
}

fn dead_letter_arguments(exchange: &str, routing_key: &str) -> FieldTable {
    let mut arguments = FieldTable::default();
    arguments.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(exchange.into()),
    );
    arguments.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(routing_key.into()),
    );
    arguments
}

/// Sums the broker's `x-death` counts recorded against `queue`.
fn death_count(delivery: &Delivery, queue: &str) -> u32 {
    let Some(headers) = delivery.properties.headers() else {
        return 0;
    };

    let Some((_, AMQPValue::FieldArray(deaths))) = headers
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == "x-death")
    else {
        return 0;
    };

    deaths
        .as_slice()
        .iter()
        .filter_map(|death| match death {
            AMQPValue::FieldTable(table) => Some(table),
            _ => None,
        })
        .filter(|table| {
            table.inner().iter().any(|(key, value)| {
                key.as_str() == "queue"
                    && matches!(value, AMQPValue::LongString(name)
                        if String::from_utf8_lossy(name.as_bytes()) == queue)
            })
        })
        .filter_map(|table| {
            table
                .inner()
                .iter()
                .find(|(key, _)| key.as_str() == "count")
                .and_then(|(_, value)| match value {
                    AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
                    AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
                    AMQPValue::LongUInt(n) => Some(*n),
                    _ => None,
                })
        })
        .fold(0u32, u32::saturating_add)
}

struct RabbitMqSubscription {
    consumer: Consumer,
    queue: String,
}

#[async_trait]
impl Subscription for RabbitMqSubscription {
    async fn next_message(&mut self) -> Option<Result<InboundMessage, Error>> {
        let delivery = self.consumer.next().await?;

        Some(
            delivery
                .map(|delivery| InboundMessage {
                    delivery_tag: delivery.delivery_tag,
                    routing_key: delivery.routing_key.as_str().to_string(),
                    redelivered: delivery.redelivered,
                    death_count: death_count(&delivery, &self.queue),
                    data: delivery.data,
                })
                .map_err(|e| anyhow!("Failed to receive delivery: {}", e)),
        )
    }
}

#[async_trait]
impl Broker for RabbitMqClient {
    async fn declare_topology(&self, topology: &TopologyConfig) -> Result<(), Error> {
        self.channel()
            .exchange_declare(
                topology.exchange.as_str(),
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to declare exchange '{}': {}", topology.exchange, e))?;

        self.declare_queue(
            &topology.main_queue,
            dead_letter_arguments(&topology.exchange, &topology.retry_routing_key),
        )
        .await?;

        let mut retry_arguments =
            dead_letter_arguments(&topology.exchange, &topology.main_routing_key);
        retry_arguments.insert(
            "x-message-ttl".into(),
            AMQPValue::LongUInt(topology.retry_ttl_ms()),
        );
        self.declare_queue(&topology.retry_queue, retry_arguments)
            .await?;

        self.bind_queue(
            &topology.main_queue,
            &topology.exchange,
            &topology.main_routing_key,
        )
        .await?;
        self.bind_queue(
            &topology.retry_queue,
            &topology.exchange,
            &topology.retry_routing_key,
        )
        .await?;

        if let Some(parking_queue) = &topology.parking_queue {
            self.declare_queue(parking_queue, FieldTable::default())
                .await?;
        }

        info!(
            exchange = %topology.exchange,
            main_queue = %topology.main_queue,
            retry_queue = %topology.retry_queue,
            retry_ttl_ms = topology.retry_ttl_ms(),
            "Broker topology declared"
        );

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), Error> {
        let confirmation = self
            .usable_channel()
            .await?
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                payload,
                BasicProperties::default()
                    .with_delivery_mode(PERSISTENT)
                    .with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| anyhow!("Failed to publish message: {}", e))?
            .await
            .map_err(|e| anyhow!("Failed to await publisher confirm: {}", e))?;

        match confirmation {
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
            Confirmation::Ack(Some(_)) => Err(anyhow!(
                "Message to '{}' with routing key '{}' was unroutable",
                exchange,
                routing_key
            )),
            Confirmation::Nack(_) => Err(anyhow!("Broker rejected published message")),
        }
    }

    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Box<dyn Subscription>, Error> {
        let consumer = self
            .usable_channel()
            .await?
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to create consumer: {}", e))?;

        info!(queue, consumer_tag, "Consumer created for queue");

        Ok(Box::new(RabbitMqSubscription {
            consumer,
            queue: queue.to_string(),
        }))
    }

    async fn acknowledge(&self, delivery_tag: u64) -> Result<(), Error> {
        self.channel()
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to acknowledge message: {}", e))?;

        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), Error> {
        self.channel()
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| anyhow!("Failed to reject message: {}", e))?;

        Ok(())
    }

    async fn health_check(&self) -> Result<(), Error> {
        if self.connection.status().connected() && self.channel().status().connected() {
            Ok(())
        } else {
            Err(anyhow!("RabbitMQ connection is not open"))
        }
    }
}
