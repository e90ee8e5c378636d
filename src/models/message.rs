use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Push,
    Email,
    Sms,
}

impl Channel {
    pub fn as_str(&self) -> &str {
        match self {
            Channel::Push => "push",
            Channel::Email => "email",
            Channel::Sms => "sms",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,

    #[serde(default)]
    pub data: HashMap<String, String>,
}

/// A delivery request published to the notification exchange.
///
/// `id` doubles as the idempotency key on the consumer side, so redeliveries
/// of the same command share it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationCommand {
    pub id: Uuid,
    pub recipient: String,
    pub channel: Channel,
    pub payload: NotificationPayload,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl NotificationCommand {
    pub fn new(recipient: impl Into<String>, channel: Channel, payload: NotificationPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            recipient: recipient.into(),
            channel,
            payload,
            correlation_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}

/// Raw message handed out by a broker subscription.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub redelivered: bool,
    /// Times the broker has dead-lettered this message out of the main queue.
    pub death_count: u32,
    pub data: Vec<u8>,
}

/// A decoded command together with the broker metadata it arrived with.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub command: NotificationCommand,
    pub delivery_tag: u64,
    pub routing_key: String,
    pub redelivered: bool,
    pub death_count: u32,
}

impl Envelope {
    pub fn decode(message: &InboundMessage) -> Result<Self, serde_json::Error> {
        let command = serde_json::from_slice::<NotificationCommand>(&message.data)?;

        Ok(Self {
            command,
            delivery_tag: message.delivery_tag,
            routing_key: message.routing_key.clone(),
            redelivered: message.redelivered,
            death_count: message.death_count,
        })
    }

    pub fn attempt(&self) -> u32 {
        self.death_count + 1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParkedMessage {
    pub original_message: serde_json::Value,
    pub failure_reason: String,
    pub attempts: u32,
    pub parked_at: String,
}
