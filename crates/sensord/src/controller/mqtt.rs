use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::mqtt::BinarySensorEntity;
use crate::mqtt::ButtonEntity;
use crate::mqtt::Device;
use crate::mqtt::EntityError;
use crate::mqtt::ImageEntity;
use crate::mqtt::Message;
use crate::mqtt::NumberEntity;
use crate::mqtt::SensorEntity;
use crate::mqtt::Subscription;
use crate::mqtt::SwitchEntity;

/// Capacity of an entity controller's outbound message channel
const MSG_CHANNEL_SIZE: usize = 64;

/// Something that exposes entities over MQTT.
pub trait MqttController: Send + Sync {
    /// Command topics to subscribe to, with their handlers
    fn subscriptions(&self) -> Vec<Subscription>;

    /// Retained discovery configs announcing each entity
    fn configs(&self) -> Vec<Message>;

    /// Outbound messages (state updates, images, ...). The receiver is handed
    /// out once; later calls return `None`.
    fn take_msgs(&self) -> Option<mpsc::Receiver<Message>>;

    /// Messages to publish just before a clean disconnect
    fn shutdown_msgs(&self) -> Vec<Message> {
        Vec::new()
    }
}

/// [`MqttController`] assembled from a declarative list of entities plus
/// free-standing control subscriptions.
pub struct EntityController {
    device: Device,
    sensors: Vec<SensorEntity>,
    binary_sensors: Vec<BinarySensorEntity>,
    buttons: Vec<ButtonEntity>,
    numbers: Vec<NumberEntity>,
    switches: Vec<SwitchEntity>,
    cameras: Vec<ImageEntity>,
    controls: Vec<Subscription>,
    on_shutdown: Vec<Message>,
    msgs: Mutex<Option<mpsc::Receiver<Message>>>,
}

pub struct EntityControllerBuilder {
    device: Device,
    sensors: Vec<SensorEntity>,
    binary_sensors: Vec<BinarySensorEntity>,
    buttons: Vec<ButtonEntity>,
    numbers: Vec<NumberEntity>,
    switches: Vec<SwitchEntity>,
    cameras: Vec<ImageEntity>,
    controls: Vec<Subscription>,
    on_shutdown: Vec<Message>,
    tx: mpsc::Sender<Message>,
    rx: mpsc::Receiver<Message>,
}

impl EntityControllerBuilder {
    pub fn sensor(mut self, entity: SensorEntity) -> Self {
        self.sensors.push(entity);
        self
    }

    pub fn binary_sensor(mut self, entity: BinarySensorEntity) -> Self {
        self.binary_sensors.push(entity);
        self
    }

    pub fn button(mut self, entity: ButtonEntity) -> Self {
        self.buttons.push(entity);
        self
    }

    pub fn number(mut self, entity: NumberEntity) -> Self {
        self.numbers.push(entity);
        self
    }

    pub fn switch(mut self, entity: SwitchEntity) -> Self {
        self.switches.push(entity);
        self
    }

    pub fn camera(mut self, entity: ImageEntity) -> Self {
        self.cameras.push(entity);
        self
    }

    pub fn control(mut self, subscription: Subscription) -> Self {
        self.controls.push(subscription);
        self
    }

    /// Publish `msg` when the session ends cleanly
    pub fn on_shutdown(mut self, msg: Message) -> Self {
        self.on_shutdown.push(msg);
        self
    }

    /// Sender for entity messages. Anything sent before or after `build` is
    /// forwarded until the controller's token is cancelled.
    pub fn sender(&self) -> mpsc::Sender<Message> {
        self.tx.clone()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Finish assembly and start forwarding entity messages. The outbound
    /// channel closes once `cancel` fires.
    pub fn build(self, cancel: &CancellationToken) -> EntityController {
        let (out_tx, out_rx) = mpsc::channel(MSG_CHANNEL_SIZE);
        let mut rx = self.rx;
        let cancel = cancel.clone();
        let node_id = self.device.node_id().to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(msg) => {
                            if out_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        // Every sender is gone; hold the channel open until
                        // cancellation so it only ever closes one way.
                        None => {
                            cancel.cancelled().await;
                            break;
                        }
                    },
                }
            }
            debug!("[{}] Entity message channel closed", node_id);
        });

        EntityController {
            device: self.device,
            sensors: self.sensors,
            binary_sensors: self.binary_sensors,
            buttons: self.buttons,
            numbers: self.numbers,
            switches: self.switches,
            cameras: self.cameras,
            controls: self.controls,
            on_shutdown: self.on_shutdown,
            msgs: Mutex::new(Some(out_rx)),
        }
    }
}

/// Keep the successes, warn about the failures
fn collect<T>(kind: &str, name: &str, result: Result<T, EntityError>, out: &mut Vec<T>) {
    match result {
        Ok(v) => out.push(v),
        Err(e) => warn!("Skipping {} {:?}: {}", kind, name, e),
    }
}

impl EntityController {
    pub fn builder(device: Device) -> EntityControllerBuilder {
        let (tx, rx) = mpsc::channel(MSG_CHANNEL_SIZE);
        EntityControllerBuilder {
            device,
            sensors: Vec::new(),
            binary_sensors: Vec::new(),
            buttons: Vec::new(),
            numbers: Vec::new(),
            switches: Vec::new(),
            cameras: Vec::new(),
            controls: Vec::new(),
            on_shutdown: Vec::new(),
            tx,
            rx,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl MqttController for EntityController {
    fn subscriptions(&self) -> Vec<Subscription> {
        let device = &self.device;
        let mut subs = Vec::new();
        for e in &self.buttons {
            collect("button", &e.info.name, e.subscription(device), &mut subs);
        }
        for e in &self.numbers {
            collect("number", &e.info.name, e.subscription(device), &mut subs);
        }
        for e in &self.switches {
            collect("switch", &e.info.name, e.subscription(device), &mut subs);
        }
        subs.extend(self.controls.iter().cloned());
        subs
    }

    fn configs(&self) -> Vec<Message> {
        let device = &self.device;
        let mut configs = Vec::new();
        for e in &self.sensors {
            collect("sensor", &e.info.name, e.config(device), &mut configs);
        }
        for e in &self.binary_sensors {
            collect("binary sensor", &e.info.name, e.config(device), &mut configs);
        }
        for e in &self.buttons {
            collect("button", &e.info.name, e.config(device), &mut configs);
        }
        for e in &self.numbers {
            collect("number", &e.info.name, e.config(device), &mut configs);
        }
        for e in &self.switches {
            collect("switch", &e.info.name, e.config(device), &mut configs);
        }
        for e in &self.cameras {
            collect("camera", &e.info.name, e.config(device), &mut configs);
        }
        configs
    }

    fn take_msgs(&self) -> Option<mpsc::Receiver<Message>> {
        self.msgs.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn shutdown_msgs(&self) -> Vec<Message> {
        self.on_shutdown.clone()
    }
}
