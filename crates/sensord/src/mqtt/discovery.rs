use serde::Deserialize;
use serde::Serialize;
use strum::Display;
use strum::EnumString;

use super::EntityError;

/// Home Assistant MQTT component types this agent publishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Component {
    Sensor,
    BinarySensor,
    Button,
    Number,
    Switch,
    Image,
}

/// Device block embedded in every discovery config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<String>,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<String>,
}

/// Where a device's entities live in the topic tree.
///
/// Topics have the form `{prefix}/{component}/{node_id}/{object_id}/{suffix}`.
#[derive(Debug, Clone)]
pub struct Device {
    prefix: String,
    node_id: String,
    info: DeviceInfo,
}

impl Device {
    pub fn new(
        prefix: impl Into<String>,
        node_id: impl Into<String>,
        info: DeviceInfo,
    ) -> Result<Self, EntityError> {
        let prefix = prefix.into();
        let node_id = node_id.into();
        if prefix.is_empty() || prefix.split('/').any(|s| !valid_segment(s)) {
            return Err(EntityError::InvalidTopic(prefix));
        }
        if !valid_segment(&node_id) {
            return Err(EntityError::InvalidTopic(node_id));
        }
        Ok(Self {
            prefix,
            node_id,
            info,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Unique id for an entity, scoped to this device
    pub fn unique_id(&self, object_id: &str) -> String {
        format!("{}_{}", self.node_id, object_id)
    }

    pub fn topic(&self, component: Component, object_id: &str, suffix: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.prefix, component, self.node_id, object_id, suffix
        )
    }

    pub fn config_topic(&self, component: Component, object_id: &str) -> String {
        self.topic(component, object_id, "config")
    }

    pub fn state_topic(&self, component: Component, object_id: &str) -> String {
        self.topic(component, object_id, "state")
    }

    pub fn command_topic(&self, component: Component, object_id: &str) -> String {
        self.topic(component, object_id, "set")
    }

    pub fn attributes_topic(&self, component: Component, object_id: &str) -> String {
        self.topic(component, object_id, "attributes")
    }
}

/// A topic segment may not be empty and may only hold `[A-Za-z0-9_-]`.
/// This keeps MQTT wildcards and separators out of generated topics.
pub fn valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// JSON payload published to a discovery config topic
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub name: String,
    pub unique_id: String,
    pub object_id: String,
    pub device: Option<DeviceInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_topic: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_topic: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_attributes_topic: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_topic: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_encoding: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_class: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_category: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_on: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_off: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_press: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// Split a config topic back into `(component, node_id, object_id)`.
pub fn parse_config_topic(topic: &str, prefix: &str) -> Option<(Component, String, String)> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let parts: Vec<&str> = rest.split('/').collect();
    match parts.as_slice() {
        [component, node_id, object_id, "config"] => Some((
            component.parse().ok()?,
            node_id.to_string(),
            object_id.to_string(),
        )),
        _ => None,
    }
}
