//! Controllers supervise groups of workers and MQTT entities.
//!
//! - [`SensorController`]: starts/stops workers and merges their updates
//! - [`MqttController`]: declares MQTT discovery configs, command
//!   subscriptions and an outbound message channel

mod mqtt;
mod sensor;

pub use mqtt::EntityController;
pub use mqtt::EntityControllerBuilder;
pub use mqtt::MqttController;
pub use sensor::ControllerError;
pub use sensor::DeviceController;
pub use sensor::SensorController;
pub use sensor::WorkerState;
