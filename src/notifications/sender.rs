//! Delivery collaborators.

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::notifications::event::NotificationKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Email,
    Sms,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
        })
    }
}

#[derive(Debug, Clone, Error)]
#[error("{channel} delivery to {recipient} failed: {reason}")]
pub struct DeliveryError {
    pub channel: Channel,
    pub recipient: String,
    pub reason: String,
}

/// An e-mail or SMS gateway.
#[async_trait]
pub trait MessageSender: Send + Sync {
    fn channel(&self) -> Channel;

    async fn send(
        &self,
        recipient: &str,
        template: NotificationKind,
        payload: &Value,
    ) -> Result<(), DeliveryError>;
}

/// Writes every message to the log instead of delivering it.
#[derive(Debug, Clone, Copy)]
pub struct LoggingSender {
    channel: Channel,
}

impl LoggingSender {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl MessageSender for LoggingSender {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(
        &self,
        recipient: &str,
        template: NotificationKind,
        payload: &Value,
    ) -> Result<(), DeliveryError> {
        tracing::info!(
            component = "notification",
            channel = %self.channel,
            recipient,
            template = %template,
            user_id = payload["user_id"].as_str().unwrap_or_default(),
            "Notification sent"
        );
        Ok(())
    }
}
