use anyhow::{Error, Result};
use async_trait::async_trait;

use crate::models::{message::InboundMessage, topology::TopologyConfig};

/// A stream of messages from one queue.
#[async_trait]
pub trait Subscription: Send {
    /// `None` once the subscription is closed by the broker.
    async fn next_message(&mut self) -> Option<Result<InboundMessage, Error>>;
}

/// The operations the producer and consumer need from a message broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Asserts the exchange, queues and bindings of `topology`. Safe to call
    /// on every start; differing properties on an existing entity are an error.
    async fn declare_topology(&self, topology: &TopologyConfig) -> Result<(), Error>;

    /// Returns once the broker has taken responsibility for the message.
    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8])
    -> Result<(), Error>;

    async fn subscribe(&self, queue: &str, consumer_tag: &str)
    -> Result<Box<dyn Subscription>, Error>;

    async fn acknowledge(&self, delivery_tag: u64) -> Result<(), Error>;

    /// With `requeue == false` the broker dead-letters the message if the
    /// source queue has a dead-letter exchange configured.
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), Error>;

    async fn health_check(&self) -> Result<(), Error>;
}
