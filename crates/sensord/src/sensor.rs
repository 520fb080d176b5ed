//! Sensor snapshots
//!
//! A `Snapshot` is one immutable observation of a sensor: its stable id, its
//! current value and the metadata remote consumers need to display it.

use serde::Deserialize;
use serde::Serialize;
use strum::Display;
use strum::EnumString;

/// Whether a sensor reports an on/off value or an arbitrary one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SensorKind {
    #[default]
    Sensor,
    BinarySensor,
}

/// Primary sensors are shown prominently, diagnostic ones are tucked away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Category {
    #[default]
    Primary,
    Diagnostic,
}

/// How the remote consumer should aggregate values over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StateClass {
    Measurement,
    Total,
    TotalIncreasing,
}

/// One observation of a sensor's current value plus metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Stable identifier, derived from the name with [`sensor_id`]
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Current value
    pub state: serde_json::Value,

    #[serde(default)]
    pub kind: SensorKind,

    #[serde(default)]
    pub category: Category,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,

    /// Icon, e.g. "mdi:battery"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_class: Option<StateClass>,

    /// Free-form extra attributes (data source, raw readings, ...)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl Snapshot {
    /// Create a primary, multi-valued sensor snapshot named `name`.
    pub fn new(name: impl Into<String>, state: impl Into<serde_json::Value>) -> Self {
        let name = name.into();
        Self {
            id: sensor_id(&name),
            name,
            state: state.into(),
            kind: SensorKind::Sensor,
            category: Category::Primary,
            units: None,
            icon: None,
            device_class: None,
            state_class: None,
            attributes: serde_json::Map::new(),
        }
    }

    /// Create a binary sensor snapshot named `name`.
    pub fn binary(name: impl Into<String>, on: bool) -> Self {
        Self {
            kind: SensorKind::BinarySensor,
            ..Self::new(name, on)
        }
    }

    pub fn diagnostic(mut self) -> Self {
        self.category = Category::Diagnostic;
        self
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    pub fn with_device_class(mut self, class: impl Into<String>) -> Self {
        self.device_class = Some(class.into());
        self
    }

    pub fn with_state_class(mut self, class: StateClass) -> Self {
        self.state_class = Some(class);
        self
    }

    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn is_binary(&self) -> bool {
        self.kind == SensorKind::BinarySensor
    }

    pub fn is_diagnostic(&self) -> bool {
        self.category == Category::Diagnostic
    }
}

/// Derive a stable sensor id from a human-readable name.
///
/// The result is snake case: camel-case humps are split, anything that is not
/// ASCII alphanumeric becomes a single underscore, and leading/trailing
/// separators are dropped. "CPU Usage (%)" becomes "cpu_usage",
/// "diskReadRate" becomes "disk_read_rate".
pub fn sensor_id(name: &str) -> String {
    let mut id = String::with_capacity(name.len());
    let mut prev: Option<char> = None;
    let mut pending_sep = false;

    for c in name.chars() {
        if !c.is_ascii_alphanumeric() {
            pending_sep = !id.is_empty();
            prev = None;
            continue;
        }

        // lower -> Upper and digit -> Upper both start a new word
        let hump = c.is_ascii_uppercase()
            && prev.is_some_and(|p| p.is_ascii_lowercase() || p.is_ascii_digit());

        if (pending_sep || hump) && !id.is_empty() {
            id.push('_');
        }
        pending_sep = false;

        id.push(c.to_ascii_lowercase());
        prev = Some(c);
    }

    id
}
