//! Home Assistant mobile_app webhook protocol.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use super::PublishError;
use super::Publisher;
use super::UpdateStatus;
use crate::sensor::Category;
use crate::sensor::Snapshot;

const REGISTRATION_PATH: &str = "/api/mobile_app/registrations";
const WEBHOOK_PATH: &str = "/api/webhook/";

/// Body of a webhook request: `{"type": ..., "data": ...}`
#[derive(Serialize)]
struct WebhookRequest<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'a str,
    data: T,
}

#[derive(Serialize)]
struct SensorRegistration<'a> {
    unique_id: &'a str,
    name: &'a str,
    state: &'a serde_json::Value,
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entity_category: Option<&'a str>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    attributes: &'a serde_json::Map<String, serde_json::Value>,
}

impl<'a> From<&'a Snapshot> for SensorRegistration<'a> {
    fn from(s: &'a Snapshot) -> Self {
        Self {
            unique_id: &s.id,
            name: &s.name,
            state: &s.state,
            kind: s.kind.to_string(),
            icon: s.icon.as_deref(),
            device_class: s.device_class.as_deref(),
            unit_of_measurement: s.units.as_deref(),
            state_class: s.state_class.map(|c| c.to_string()),
            entity_category: (s.category == Category::Diagnostic).then_some("diagnostic"),
            attributes: &s.attributes,
        }
    }
}

#[derive(Serialize)]
struct SensorState<'a> {
    unique_id: &'a str,
    state: &'a serde_json::Value,
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<&'a str>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    attributes: &'a serde_json::Map<String, serde_json::Value>,
}

impl<'a> From<&'a Snapshot> for SensorState<'a> {
    fn from(s: &'a Snapshot) -> Self {
        Self {
            unique_id: &s.id,
            state: &s.state,
            kind: s.kind.to_string(),
            icon: s.icon.as_deref(),
            attributes: &s.attributes,
        }
    }
}

/// Per-sensor result in an `update_sensor_states` response
#[derive(Debug, Deserialize)]
struct UpdateResult {
    success: bool,
    #[serde(default)]
    error: Option<UpdateError>,
    #[serde(default)]
    is_disabled: bool,
}

#[derive(Debug, Deserialize)]
struct UpdateError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, PublishError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(PublishError::Status {
        status: status.as_u16(),
        body,
    })
}

/// [`Publisher`] posting to a registered device's webhook URL
pub struct WebhookPublisher {
    client: Client,
    url: String,
}

impl WebhookPublisher {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, PublishError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn post<T: Serialize + Send>(
        &self,
        kind: &str,
        data: T,
    ) -> Result<reqwest::Response, PublishError> {
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookRequest { kind, data })
            .send()
            .await?;
        check_status(response).await
    }
}

#[async_trait]
impl Publisher for WebhookPublisher {
    async fn register_sensor(&self, snapshot: &Snapshot) -> Result<(), PublishError> {
        debug!("Registering sensor {}", snapshot.id);
        self.post("register_sensor", SensorRegistration::from(snapshot))
            .await?;
        Ok(())
    }

    async fn update_sensor(&self, snapshot: &Snapshot) -> Result<UpdateStatus, PublishError> {
        debug!("Updating sensor {}", snapshot.id);
        let response = self
            .post("update_sensor_states", [SensorState::from(snapshot)])
            .await?;

        let results: HashMap<String, UpdateResult> = response
            .json()
            .await
            .map_err(|e| PublishError::InvalidResponse(e.to_string()))?;

        match results.get(&snapshot.id) {
            Some(r) if !r.success => {
                let reason = r
                    .error
                    .as_ref()
                    .map(|e| {
                        format!(
                            "{} ({})",
                            e.message.as_deref().unwrap_or("unknown error"),
                            e.code.as_deref().unwrap_or("no code")
                        )
                    })
                    .unwrap_or_else(|| "unknown error".to_string());
                Err(PublishError::Rejected {
                    id: snapshot.id.clone(),
                    reason,
                })
            }
            Some(r) => Ok(UpdateStatus {
                disabled: r.is_disabled,
            }),
            None => Ok(UpdateStatus::default()),
        }
    }
}

/// Device details sent when registering with the mobile_app integration
#[derive(Debug, Clone, Serialize)]
pub struct DeviceRegistration {
    pub device_id: String,
    pub app_id: String,
    pub app_name: String,
    pub app_version: String,
    pub device_name: String,
    pub manufacturer: String,
    pub model: String,
    pub os_name: String,
    pub os_version: String,
    pub supports_encryption: bool,
    pub app_data: serde_json::Map<String, serde_json::Value>,
}

/// What the server hands back from a device registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub webhook_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloudhook_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ui_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl RegistrationResponse {
    /// URL updates should be posted to.
    ///
    /// Prefers the cloudhook, then the remote UI, then `server`. With
    /// `ignore_urls` only `server` is used.
    pub fn webhook_url(&self, server: &str, ignore_urls: bool) -> String {
        if !ignore_urls {
            if let Some(url) = &self.cloudhook_url {
                return url.clone();
            }
            if let Some(remote) = &self.remote_ui_url {
                return format!(
                    "{}{}{}",
                    remote.trim_end_matches('/'),
                    WEBHOOK_PATH,
                    self.webhook_id
                );
            }
        }
        format!(
            "{}{}{}",
            server.trim_end_matches('/'),
            WEBHOOK_PATH,
            self.webhook_id
        )
    }
}

/// Registers this device with a Home Assistant server
pub struct DeviceRegistrar {
    client: Client,
    server: String,
    token: String,
}

impl DeviceRegistrar {
    pub fn new(
        server: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, PublishError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            server: server.into(),
            token: token.into(),
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub async fn register(
        &self,
        device: &DeviceRegistration,
    ) -> Result<RegistrationResponse, PublishError> {
        let url = format!("{}{}", self.server.trim_end_matches('/'), REGISTRATION_PATH);
        debug!("Registering device {} at {}", device.device_name, url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(device)
            .send()
            .await?;
        let response = check_status(response).await?;

        let registration: RegistrationResponse = response
            .json()
            .await
            .map_err(|e| PublishError::InvalidResponse(e.to_string()))?;
        if registration.webhook_id.is_empty() {
            return Err(PublishError::InvalidResponse(
                "empty webhook_id".to_string(),
            ));
        }
        Ok(registration)
    }
}
