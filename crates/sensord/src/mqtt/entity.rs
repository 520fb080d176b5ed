use std::fmt;
use std::sync::Arc;

use strum::Display;

use super::Component;
use super::Device;
use super::DiscoveryConfig;
use super::Message;
use super::Subscription;
use super::discovery::valid_segment;
use crate::sensor::StateClass;
use crate::sensor::sensor_id;

/// Payloads Home Assistant uses for on/off state and commands
const PAYLOAD_ON: &str = "ON";
const PAYLOAD_OFF: &str = "OFF";
const PAYLOAD_PRESS: &str = "PRESS";

#[derive(Debug, thiserror::Error)]
pub enum EntityError {
    #[error("entity name must not be empty")]
    EmptyName,

    #[error("invalid topic segment: {0:?}")]
    InvalidTopic(String),

    #[error("entity {0} accepts commands but has no handler")]
    MissingHandler(String),

    #[error("unexpected payload {payload:?} on {topic}")]
    InvalidPayload { topic: String, payload: String },

    #[error("failed to encode discovery config: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Metadata shared by every entity type
#[derive(Debug, Clone, Default)]
pub struct EntityInfo {
    pub name: String,
    pub icon: Option<String>,
    pub device_class: Option<String>,
    pub diagnostic: bool,
}

impl EntityInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    pub fn with_device_class(mut self, class: impl Into<String>) -> Self {
        self.device_class = Some(class.into());
        self
    }

    pub fn diagnostic(mut self) -> Self {
        self.diagnostic = true;
        self
    }

    /// Topic segment derived from the name
    pub fn object_id(&self) -> Result<String, EntityError> {
        if self.name.trim().is_empty() {
            return Err(EntityError::EmptyName);
        }
        let id = sensor_id(&self.name);
        if !valid_segment(&id) {
            return Err(EntityError::InvalidTopic(id));
        }
        Ok(id)
    }

    /// Discovery config fields common to all components
    fn base_config(&self, device: &Device) -> Result<DiscoveryConfig, EntityError> {
        let object_id = self.object_id()?;
        Ok(DiscoveryConfig {
            name: self.name.clone(),
            unique_id: device.unique_id(&object_id),
            object_id,
            device: Some(device.info().clone()),
            icon: self.icon.clone(),
            device_class: self.device_class.clone(),
            entity_category: self.diagnostic.then(|| "diagnostic".to_string()),
            ..Default::default()
        })
    }
}

fn config_message(
    device: &Device,
    component: Component,
    config: &DiscoveryConfig,
) -> Result<Message, EntityError> {
    let payload = serde_json::to_vec(config)?;
    Ok(Message::new(device.config_topic(component, &config.object_id), payload).retained())
}

fn parse_switch(msg: &Message) -> Result<bool, EntityError> {
    match msg.payload_str() {
        Some(PAYLOAD_ON) => Ok(true),
        Some(PAYLOAD_OFF) => Ok(false),
        _ => Err(invalid_payload(msg)),
    }
}

fn invalid_payload(msg: &Message) -> EntityError {
    EntityError::InvalidPayload {
        topic: msg.topic.clone(),
        payload: String::from_utf8_lossy(&msg.payload).into_owned(),
    }
}

/// Read-only value sensor
#[derive(Debug, Clone)]
pub struct SensorEntity {
    pub info: EntityInfo,
    pub units: Option<String>,
    pub state_class: Option<StateClass>,
}

impl SensorEntity {
    pub fn new(info: EntityInfo) -> Self {
        Self {
            info,
            units: None,
            state_class: None,
        }
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    pub fn with_state_class(mut self, class: StateClass) -> Self {
        self.state_class = Some(class);
        self
    }

    pub fn config(&self, device: &Device) -> Result<Message, EntityError> {
        let mut config = self.info.base_config(device)?;
        config.state_topic = Some(device.state_topic(Component::Sensor, &config.object_id));
        config.json_attributes_topic =
            Some(device.attributes_topic(Component::Sensor, &config.object_id));
        config.unit_of_measurement = self.units.clone();
        config.state_class = self.state_class.map(|c| c.to_string());
        config_message(device, Component::Sensor, &config)
    }

    pub fn state(
        &self,
        device: &Device,
        value: &serde_json::Value,
    ) -> Result<Message, EntityError> {
        let payload = match value {
            serde_json::Value::String(s) => s.clone().into_bytes(),
            other => serde_json::to_vec(other)?,
        };
        Ok(Message::new(
            device.state_topic(Component::Sensor, &self.info.object_id()?),
            payload,
        ))
    }
}

/// On/off sensor
#[derive(Debug, Clone)]
pub struct BinarySensorEntity {
    pub info: EntityInfo,
}

impl BinarySensorEntity {
    pub fn new(info: EntityInfo) -> Self {
        Self { info }
    }

    pub fn config(&self, device: &Device) -> Result<Message, EntityError> {
        let mut config = self.info.base_config(device)?;
        config.state_topic = Some(device.state_topic(Component::BinarySensor, &config.object_id));
        config.payload_on = Some(PAYLOAD_ON.to_string());
        config.payload_off = Some(PAYLOAD_OFF.to_string());
        config_message(device, Component::BinarySensor, &config)
    }

    pub fn state(&self, device: &Device, on: bool) -> Result<Message, EntityError> {
        let payload = if on { PAYLOAD_ON } else { PAYLOAD_OFF };
        Ok(Message::new(
            device.state_topic(Component::BinarySensor, &self.info.object_id()?),
            payload,
        )
        .retained())
    }
}

pub type PressHandler = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;
pub type SwitchHandler = Arc<dyn Fn(bool) -> anyhow::Result<()> + Send + Sync>;
pub type NumberHandler = Arc<dyn Fn(f64) -> anyhow::Result<()> + Send + Sync>;

/// Stateless trigger
#[derive(Clone)]
pub struct ButtonEntity {
    pub info: EntityInfo,
    handler: Option<PressHandler>,
}

impl ButtonEntity {
    pub fn new(info: EntityInfo) -> Self {
        Self {
            info,
            handler: None,
        }
    }

    pub fn on_press<F>(mut self, f: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(f));
        self
    }

    pub fn config(&self, device: &Device) -> Result<Message, EntityError> {
        let mut config = self.info.base_config(device)?;
        config.command_topic = Some(device.command_topic(Component::Button, &config.object_id));
        config.payload_press = Some(PAYLOAD_PRESS.to_string());
        config_message(device, Component::Button, &config)
    }

    pub fn subscription(&self, device: &Device) -> Result<Subscription, EntityError> {
        let object_id = self.info.object_id()?;
        let handler = self
            .handler
            .clone()
            .ok_or_else(|| EntityError::MissingHandler(self.info.name.clone()))?;
        Ok(Subscription::new(
            device.command_topic(Component::Button, &object_id),
            move |msg: &Message| match msg.payload_str() {
                Some(PAYLOAD_PRESS) => handler(),
                _ => Err(invalid_payload(msg).into()),
            },
        ))
    }
}

impl fmt::Debug for ButtonEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ButtonEntity")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// Commandable on/off entity
#[derive(Clone)]
pub struct SwitchEntity {
    pub info: EntityInfo,
    handler: Option<SwitchHandler>,
}

impl SwitchEntity {
    pub fn new(info: EntityInfo) -> Self {
        Self {
            info,
            handler: None,
        }
    }

    pub fn on_command<F>(mut self, f: F) -> Self
    where
        F: Fn(bool) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(f));
        self
    }

    pub fn config(&self, device: &Device) -> Result<Message, EntityError> {
        let mut config = self.info.base_config(device)?;
        config.state_topic = Some(device.state_topic(Component::Switch, &config.object_id));
        config.command_topic = Some(device.command_topic(Component::Switch, &config.object_id));
        config.payload_on = Some(PAYLOAD_ON.to_string());
        config.payload_off = Some(PAYLOAD_OFF.to_string());
        config_message(device, Component::Switch, &config)
    }

    pub fn subscription(&self, device: &Device) -> Result<Subscription, EntityError> {
        let object_id = self.info.object_id()?;
        let handler = self
            .handler
            .clone()
            .ok_or_else(|| EntityError::MissingHandler(self.info.name.clone()))?;
        Ok(Subscription::new(
            device.command_topic(Component::Switch, &object_id),
            move |msg: &Message| handler(parse_switch(msg)?),
        ))
    }

    pub fn state(&self, device: &Device, on: bool) -> Result<Message, EntityError> {
        let payload = if on { PAYLOAD_ON } else { PAYLOAD_OFF };
        Ok(Message::new(
            device.state_topic(Component::Switch, &self.info.object_id()?),
            payload,
        )
        .retained())
    }
}

impl fmt::Debug for SwitchEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwitchEntity")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
#[strum(serialize_all = "snake_case")]
pub enum NumberMode {
    #[default]
    Auto,
    Box,
    Slider,
}

/// Commandable numeric entity with a bounded range
#[derive(Clone)]
pub struct NumberEntity {
    pub info: EntityInfo,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub mode: NumberMode,
    pub units: Option<String>,
    handler: Option<NumberHandler>,
}

impl NumberEntity {
    pub fn new(info: EntityInfo, min: f64, max: f64, step: f64) -> Self {
        Self {
            info,
            min,
            max,
            step,
            mode: NumberMode::default(),
            units: None,
            handler: None,
        }
    }

    pub fn with_mode(mut self, mode: NumberMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    pub fn on_command<F>(mut self, f: F) -> Self
    where
        F: Fn(f64) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(f));
        self
    }

    pub fn config(&self, device: &Device) -> Result<Message, EntityError> {
        let mut config = self.info.base_config(device)?;
        config.state_topic = Some(device.state_topic(Component::Number, &config.object_id));
        config.command_topic = Some(device.command_topic(Component::Number, &config.object_id));
        config.min = Some(self.min);
        config.max = Some(self.max);
        config.step = Some(self.step);
        config.mode = Some(self.mode.to_string());
        config.unit_of_measurement = self.units.clone();
        config_message(device, Component::Number, &config)
    }

    pub fn subscription(&self, device: &Device) -> Result<Subscription, EntityError> {
        let object_id = self.info.object_id()?;
        let handler = self
            .handler
            .clone()
            .ok_or_else(|| EntityError::MissingHandler(self.info.name.clone()))?;
        let (min, max) = (self.min, self.max);
        Ok(Subscription::new(
            device.command_topic(Component::Number, &object_id),
            move |msg: &Message| {
                let value = msg
                    .payload_str()
                    .and_then(|s| s.parse::<f64>().ok())
                    .filter(|v| (min..=max).contains(v))
                    .ok_or_else(|| invalid_payload(msg))?;
                handler(value)
            },
        ))
    }

    pub fn state(&self, device: &Device, value: f64) -> Result<Message, EntityError> {
        Ok(Message::new(
            device.state_topic(Component::Number, &self.info.object_id()?),
            value.to_string(),
        )
        .retained())
    }
}

impl fmt::Debug for NumberEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NumberEntity")
            .field("info", &self.info)
            .field("min", &self.min)
            .field("max", &self.max)
            .field("step", &self.step)
            .finish_non_exhaustive()
    }
}

/// Image published as raw bytes or base64 on its image topic
#[derive(Debug, Clone)]
pub struct ImageEntity {
    pub info: EntityInfo,
    /// `Some("b64")` when frames are base64 encoded
    pub encoding: Option<String>,
}

impl ImageEntity {
    pub fn new(info: EntityInfo) -> Self {
        Self {
            info,
            encoding: None,
        }
    }

    pub fn config(&self, device: &Device) -> Result<Message, EntityError> {
        let mut config = self.info.base_config(device)?;
        config.image_topic = Some(device.topic(Component::Image, &config.object_id, "image"));
        config.image_encoding = self.encoding.clone();
        config_message(device, Component::Image, &config)
    }

    pub fn frame(&self, device: &Device, data: Vec<u8>) -> Result<Message, EntityError> {
        Ok(Message::new(
            device.topic(Component::Image, &self.info.object_id()?, "image"),
            data,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::mqtt::DeviceInfo;

    fn device() -> Device {
        Device::new(
            "homeassistant",
            "laptop",
            DeviceInfo {
                identifiers: vec!["laptop".to_string()],
                name: "laptop".to_string(),
                manufacturer: None,
                model: None,
                sw_version: None,
            },
        )
        .unwrap()
    }

    fn config_json(msg: &Message) -> serde_json::Value {
        serde_json::from_slice(&msg.payload).unwrap()
    }

    #[test]
    fn test_sensor_config() {
        let info = EntityInfo::new("Load 1m").with_icon("mdi:gauge").diagnostic();
        let sensor = SensorEntity::new(info).with_state_class(StateClass::Measurement);
        let msg = sensor.config(&device()).unwrap();

        assert_eq!(msg.topic, "homeassistant/sensor/laptop/load_1m/config");
        assert!(msg.retain);
        let json = config_json(&msg);
        assert_eq!(json["unique_id"], "laptop_load_1m");
        assert_eq!(json["state_topic"], "homeassistant/sensor/laptop/load_1m/state");
        assert_eq!(json["state_class"], "measurement");
        assert_eq!(json["entity_category"], "diagnostic");
        assert_eq!(json["device"]["name"], "laptop");
    }

    #[test]
    fn test_empty_name_fails() {
        let sensor = BinarySensorEntity::new(EntityInfo::new("  "));
        assert!(matches!(sensor.config(&device()), Err(EntityError::EmptyName)));

        let sensor = BinarySensorEntity::new(EntityInfo::new("%%%"));
        assert!(matches!(
            sensor.config(&device()),
            Err(EntityError::InvalidTopic(_))
        ));
    }

    #[test]
    fn test_button_without_handler_fails() {
        let button = ButtonEntity::new(EntityInfo::new("Shutdown"));
        assert!(button.config(&device()).is_ok());
        assert!(matches!(
            button.subscription(&device()),
            Err(EntityError::MissingHandler(_))
        ));
    }

    #[test]
    fn test_button_press() {
        let pressed = Arc::new(Mutex::new(0));
        let counter = pressed.clone();
        let button = ButtonEntity::new(EntityInfo::new("Shutdown")).on_press(move || {
            *counter.lock().unwrap() += 1;
            Ok(())
        });
        let sub = button.subscription(&device()).unwrap();
        assert_eq!(sub.topic, "homeassistant/button/laptop/shutdown/set");

        (sub.handler)(&Message::new(&sub.topic, "PRESS")).unwrap();
        assert!((sub.handler)(&Message::new(&sub.topic, "BOOP")).is_err());
        assert_eq!(*pressed.lock().unwrap(), 1);
    }

    #[test]
    fn test_switch_parses_payload() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let switch = SwitchEntity::new(EntityInfo::new("Do Not Disturb")).on_command(move |on| {
            log.lock().unwrap().push(on);
            Ok(())
        });
        let sub = switch.subscription(&device()).unwrap();

        (sub.handler)(&Message::new(&sub.topic, "ON")).unwrap();
        (sub.handler)(&Message::new(&sub.topic, "OFF\n")).unwrap();
        assert!((sub.handler)(&Message::new(&sub.topic, "maybe")).is_err());
        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn test_number_parses_and_bounds() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let number = NumberEntity::new(EntityInfo::new("Volume"), 0.0, 100.0, 1.0)
            .with_mode(NumberMode::Slider)
            .on_command(move |v| {
                log.lock().unwrap().push(v);
                Ok(())
            });

        let json = config_json(&number.config(&device()).unwrap());
        assert_eq!(json["mode"], "slider");
        assert_eq!(json["max"], 100.0);

        let sub = number.subscription(&device()).unwrap();
        (sub.handler)(&Message::new(&sub.topic, "42.5")).unwrap();
        assert!((sub.handler)(&Message::new(&sub.topic, "loud")).is_err());
        assert!((sub.handler)(&Message::new(&sub.topic, "101")).is_err());
        assert_eq!(*seen.lock().unwrap(), vec![42.5]);
    }

    #[test]
    fn test_image_topics() {
        let image = ImageEntity {
            info: EntityInfo::new("Webcam"),
            encoding: Some("b64".to_string()),
        };
        let json = config_json(&image.config(&device()).unwrap());
        assert_eq!(json["image_topic"], "homeassistant/image/laptop/webcam/image");
        assert_eq!(json["image_encoding"], "b64");
        assert_eq!(
            image.frame(&device(), vec![1, 2, 3]).unwrap().topic,
            "homeassistant/image/laptop/webcam/image"
        );
    }

    #[test]
    fn test_sensor_state_payload() {
        let sensor = SensorEntity::new(EntityInfo::new("Kernel"));
        let msg = sensor
            .state(&device(), &serde_json::json!("6.18.0"))
            .unwrap();
        assert_eq!(msg.payload, b"6.18.0");
        let msg = sensor.state(&device(), &serde_json::json!(3)).unwrap();
        assert_eq!(msg.payload, b"3");
    }
}
