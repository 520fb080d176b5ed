//! Workers and MQTT entities shipped with the agent.
//!
//! Everything is constructed here from an explicit list; nothing registers
//! itself.

mod commands;
mod scripts;
mod system;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub use commands::CommandEntry;
pub use commands::CommandsError;
pub use commands::CommandsFile;
pub use commands::commands_controller;
pub use scripts::ScriptPoller;
pub use scripts::find_scripts;
pub use scripts::parse_schedule;
pub use system::InfoWorker;
pub use system::LoadAvgPoller;
pub use system::UptimePoller;

use crate::config::AgentConfig;
use crate::config::Config;
use crate::controller::DeviceController;
use crate::controller::EntityController;
use crate::controller::MqttController;
use crate::controller::SensorController;
use crate::mqtt::BinarySensorEntity;
use crate::mqtt::ButtonEntity;
use crate::mqtt::Device;
use crate::mqtt::DeviceInfo;
use crate::mqtt::EntityError;
use crate::mqtt::EntityInfo;
use crate::mqtt::Message;
use crate::sensor::sensor_id;
use crate::worker::PollingWorker;
use crate::worker::Worker;

/// Name of this host, or "unknown"
pub fn hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Stable identifier for this machine: the systemd machine id when there is
/// one, otherwise derived from the agent id and hostname.
pub fn device_id(root: &Path, agent_id: &str) -> String {
    match std::fs::read_to_string(root.join("etc/machine-id")) {
        Ok(id) if !id.trim().is_empty() => id.trim().to_string(),
        _ => format!("{}-{}", agent_id, sensor_id(&hostname())),
    }
}

/// Details sent when registering this device with Home Assistant
#[cfg(feature = "webhook")]
pub fn device_registration(root: &Path, agent_id: &str) -> crate::publisher::DeviceRegistration {
    let kernel = std::fs::read_to_string(root.join("proc/sys/kernel/osrelease"))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    crate::publisher::DeviceRegistration {
        device_id: device_id(root, agent_id),
        app_id: agent_id.to_string(),
        app_name: crate::config::APP_NAME.to_string(),
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        device_name: hostname(),
        manufacturer: "Unknown".to_string(),
        model: "Unknown".to_string(),
        os_name: std::env::consts::OS.to_string(),
        os_version: kernel,
        supports_encryption: false,
        app_data: serde_json::Map::new(),
    }
}

/// Sensor controllers for this host. `root` is the filesystem root procfs
/// and /etc are read from. Scripts found in the configured scripts
/// directory get a controller of their own.
pub fn sensor_controllers(root: &Path, agent: &AgentConfig) -> Vec<Arc<dyn SensorController>> {
    let workers: Vec<Arc<dyn Worker>> = vec![
        Arc::new(InfoWorker::new(root, hostname())),
        Arc::new(PollingWorker::new(UptimePoller::new(root))),
        Arc::new(PollingWorker::new(LoadAvgPoller::new(root))),
    ];
    let mut controllers: Vec<Arc<dyn SensorController>> =
        vec![Arc::new(DeviceController::new("system", workers))];

    let dir = agent.scripts_dir();
    match find_scripts(&dir) {
        Ok(scripts) if scripts.is_empty() => debug!("No sensor scripts in {}", dir.display()),
        Ok(scripts) => {
            info!("Found {} sensor scripts in {}", scripts.len(), dir.display());
            let timeout = Duration::from_secs(agent.poll_timeout_secs);
            let workers: Vec<Arc<dyn Worker>> = scripts
                .into_iter()
                .map(|path| {
                    let poller = ScriptPoller::new(path, timeout);
                    Arc::new(PollingWorker::new(poller)) as Arc<dyn Worker>
                })
                .collect();
            controllers.push(Arc::new(DeviceController::new("scripts", workers)));
        }
        Err(e) => warn!("Could not look for sensor scripts in {}: {}", dir.display(), e),
    }
    controllers
}

/// MQTT device for this agent, or `None` if MQTT is not configured
pub fn mqtt_device(config: &Config) -> Result<Option<Device>, EntityError> {
    let Some(mqtt) = &config.mqtt else {
        return Ok(None);
    };
    let host = hostname();
    let node_id = sensor_id(&host);
    let info = DeviceInfo {
        identifiers: vec![node_id.clone()],
        name: host,
        manufacturer: None,
        model: None,
        sw_version: Some(env!("CARGO_PKG_VERSION").to_string()),
    };
    Device::new(mqtt.discovery_prefix.clone(), node_id, info).map(Some)
}

fn online_entity() -> BinarySensorEntity {
    BinarySensorEntity::new(
        EntityInfo::new("Agent Online")
            .with_device_class("connectivity")
            .diagnostic(),
    )
}

/// Retained "Agent Online" OFF, for the broker to publish if the agent
/// vanishes without disconnecting
pub fn last_will(device: &Device) -> Result<Message, EntityError> {
    online_entity().state(device, false)
}

/// MQTT controllers for this agent.
///
/// The "Shutdown Agent" button cancels `shutdown`. Message forwarding stops
/// when `cancel` fires. "Agent Online" goes ON at start and OFF on a clean
/// exit. Entries in the `commands` file, when given and readable, become a
/// second controller.
pub fn mqtt_controllers(
    device: Device,
    commands: Option<&Path>,
    cancel: &CancellationToken,
    shutdown: CancellationToken,
) -> Vec<Arc<dyn MqttController>> {
    let mut controllers: Vec<Arc<dyn MqttController>> = Vec::new();
    if let Some(path) = commands {
        match CommandsFile::from_file(path) {
            Ok(file) => {
                controllers.push(Arc::new(commands_controller(&file, device.clone(), cancel)));
            }
            Err(e) => warn!("Could not set up commands from {}: {}", path.display(), e),
        }
    }

    let online = online_entity();
    let shutdown_button = ButtonEntity::new(
        EntityInfo::new("Shutdown Agent").with_icon("mdi:power"),
    )
    .on_press(move || {
        shutdown.cancel();
        Ok(())
    });

    let mut builder = EntityController::builder(device)
        .binary_sensor(online.clone())
        .button(shutdown_button);

    match online.state(builder.device(), true) {
        Ok(msg) => {
            if let Err(e) = builder.sender().try_send(msg) {
                warn!("Could not queue online state: {}", e);
            }
        }
        Err(e) => warn!("Could not build online state: {}", e),
    }
    match online.state(builder.device(), false) {
        Ok(msg) => builder = builder.on_shutdown(msg),
        Err(e) => warn!("Could not build offline state: {}", e),
    }

    controllers.insert(0, Arc::new(builder.build(cancel)));
    controllers
}
