use std::collections::HashMap;

use serde::Serialize;

use crate::models::message::NotificationCommand;

/// Body of an FCM HTTP v1 `messages:send` call.
#[derive(Debug, Clone, Serialize)]
pub struct FcmRequest {
    pub message: FcmMessage,
}

#[derive(Debug, Clone, Serialize)]
pub struct FcmMessage {
    pub token: String,
    pub notification: FcmNotification,

    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FcmNotification {
    pub title: String,
    pub body: String,
}

impl FcmRequest {
    /// Addresses the command's recipient as a device token. The command id
    /// and correlation id ride along in `data` so the app can report back.
    pub fn for_command(command: &NotificationCommand) -> Self {
        let mut data = command.payload.data.clone();
        data.insert("notification_id".to_string(), command.id.to_string());
        if let Some(correlation_id) = &command.correlation_id {
            data.insert("correlation_id".to_string(), correlation_id.clone());
        }

        Self {
            message: FcmMessage {
                token: command.recipient.clone(),
                notification: FcmNotification {
                    title: command.payload.title.clone(),
                    body: command.payload.body.clone(),
                },
                data,
            },
        }
    }
}
