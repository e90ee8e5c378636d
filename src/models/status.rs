use std::fmt::{Display, Formatter, Result};

use serde::{Deserialize, Serialize};

/// Delivery marker stored per command id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyStatus {
    NotFound,
    Processing,
    Sent,
    Failed,
}

impl IdempotencyStatus {
    pub fn as_marker(&self) -> &'static str {
        match self {
            IdempotencyStatus::NotFound => "",
            IdempotencyStatus::Processing => "processing",
            IdempotencyStatus::Sent => "sent",
            IdempotencyStatus::Failed => "failed",
        }
    }

    pub fn from_marker(marker: &str) -> Option<Self> {
        match marker {
            "processing" => Some(IdempotencyStatus::Processing),
            "sent" => Some(IdempotencyStatus::Sent),
            "failed" => Some(IdempotencyStatus::Failed),
            _ => None,
        }
    }
}

/// What the consumer did with one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    DeadLettered,
    Parked,
}

/// Progress of a request through the admission chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionState {
    Received,
    Traced,
    Authenticated,
    Anonymous,
    Admitted,
    Rejected,
    Handled,
    Completed,
}

impl Display for DeliveryOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            DeliveryOutcome::Delivered => write!(f, "delivered"),
            DeliveryOutcome::DeadLettered => write!(f, "dead_lettered"),
            DeliveryOutcome::Parked => write!(f, "parked"),
        }
    }
}

impl Display for AdmissionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            AdmissionState::Received => write!(f, "received"),
            AdmissionState::Traced => write!(f, "traced"),
            AdmissionState::Authenticated => write!(f, "authenticated"),
            AdmissionState::Anonymous => write!(f, "anonymous"),
            AdmissionState::Admitted => write!(f, "admitted"),
            AdmissionState::Rejected => write!(f, "rejected"),
            AdmissionState::Handled => write!(f, "handled"),
            AdmissionState::Completed => write!(f, "completed"),
        }
    }
}
