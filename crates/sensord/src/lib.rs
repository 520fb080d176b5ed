pub mod agent;
pub mod api;
pub mod config;
pub mod controller;
mod fanin;
pub mod mqtt;
pub mod platform;
pub mod publisher;
pub mod registry;
pub mod sensor;
pub mod tracker;
pub mod worker;

pub use agent::Agent;
pub use agent::MqttSession;
pub use config::Config;
pub use config::LogLevel;
pub use config::Registration;
pub use controller::DeviceController;
pub use controller::MqttController;
pub use controller::SensorController;
pub use publisher::PublishError;
pub use publisher::Publisher;
pub use registry::Entry;
pub use registry::Registry;
pub use registry::SqliteRegistry;
pub use sensor::Snapshot;
pub use tracker::Tracker;
pub use worker::Worker;
