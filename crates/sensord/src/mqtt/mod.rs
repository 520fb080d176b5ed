//! MQTT publishing for Home Assistant discovery.
//!
//! Entities describe themselves as pure data: a retained discovery config
//! [`Message`] and, for commandable entities, a [`Subscription`] binding a
//! command topic to a handler. The [`runner`] owns the broker connection.

mod client;
mod discovery;
mod entity;
pub mod runner;

use std::fmt;
use std::sync::Arc;

pub use client::ClientEvent;
#[cfg(test)]
pub use client::MockMqttClient;
pub use client::MqttClient;
#[cfg(feature = "mqtt")]
pub use client::RumqttcClient;
pub use discovery::Component;
pub use discovery::Device;
pub use discovery::DeviceInfo;
pub use discovery::DiscoveryConfig;
pub use entity::BinarySensorEntity;
pub use entity::ButtonEntity;
pub use entity::EntityError;
pub use entity::EntityInfo;
pub use entity::ImageEntity;
pub use entity::NumberEntity;
pub use entity::NumberMode;
pub use entity::SensorEntity;
pub use entity::SwitchEntity;
pub use runner::run;
pub use runner::unpublish;

/// A message to or from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }

    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }

    /// Payload as UTF-8, trimmed. Non-UTF-8 payloads yield `None`.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok().map(str::trim)
    }
}

/// Callback invoked for every message received on a subscribed topic
pub type Handler = Arc<dyn Fn(&Message) -> anyhow::Result<()> + Send + Sync>;

/// Binding of a topic to the handler for messages arriving on it
#[derive(Clone)]
pub struct Subscription {
    pub topic: String,
    pub handler: Handler,
}

impl Subscription {
    pub fn new<F>(topic: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            topic: topic.into(),
            handler: Arc::new(handler),
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("MQTT client not connected")]
    NotConnected,

    #[cfg(feature = "mqtt")]
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("MQTT error: {0}")]
    Other(String),
}
