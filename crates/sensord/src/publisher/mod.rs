//! Remote consumers of sensor state.

#[cfg(feature = "webhook")]
mod webhook;

use async_trait::async_trait;

#[cfg(feature = "webhook")]
pub use webhook::DeviceRegistrar;
#[cfg(feature = "webhook")]
pub use webhook::DeviceRegistration;
#[cfg(feature = "webhook")]
pub use webhook::RegistrationResponse;
#[cfg(feature = "webhook")]
pub use webhook::WebhookPublisher;

use crate::sensor::Snapshot;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[cfg(feature = "webhook")]
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("remote returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("remote rejected {id}: {reason}")]
    Rejected { id: String, reason: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// What the remote reported back for an accepted state update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateStatus {
    /// The sensor was disabled on the remote side
    pub disabled: bool,
}

/// Sink for sensor registrations and state updates.
///
/// Failures are reported to the caller, which decides whether to retry;
/// implementations do not retry on their own.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Announce a sensor the remote has not seen yet, including its current
    /// state.
    async fn register_sensor(&self, snapshot: &Snapshot) -> Result<(), PublishError>;

    /// Send a new state for an already registered sensor.
    async fn update_sensor(&self, snapshot: &Snapshot) -> Result<UpdateStatus, PublishError>;
}
