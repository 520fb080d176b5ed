//! Broker session driving a set of [`MqttController`]s.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::ClientEvent;
use super::Handler;
use super::Message;
use super::MqttClient;
use super::MqttError;
use super::discovery::parse_config_topic;
use crate::controller::MqttController;
use crate::fanin;

enum Event {
    Cancelled,
    Inbound(Message),
    Reconnected,
    Disconnected,
    Outbound(Message),
    OutboundClosed,
}

/// Connect, announce every controller's entities and serve commands until
/// `cancel` fires.
///
/// Discovery configs are published retained before any outbound traffic,
/// and again with every subscription after a reconnect. Inbound messages
/// are dispatched by exact topic. Handler and publish failures are logged
/// and do not end the session; failing to connect or subscribe does. On
/// cancel the controllers' shutdown messages go out before the disconnect.
pub async fn run<C: MqttClient>(
    mut client: C,
    controllers: Vec<Arc<dyn MqttController>>,
    cancel: CancellationToken,
) -> Result<(), MqttError> {
    let mut handlers: HashMap<String, Handler> = HashMap::new();
    let mut configs = Vec::new();
    let mut outbound = Vec::new();
    let mut farewell = Vec::new();

    for controller in &controllers {
        for sub in controller.subscriptions() {
            if handlers.contains_key(&sub.topic) {
                warn!("Duplicate subscription for {}, keeping the first", sub.topic);
                continue;
            }
            handlers.insert(sub.topic, sub.handler);
        }
        configs.extend(controller.configs());
        if let Some(rx) = controller.take_msgs() {
            outbound.push(rx);
        }
        farewell.extend(controller.shutdown_msgs());
    }

    client.connect().await?;
    announce(&mut client, &handlers, &configs).await?;
    info!(
        "MQTT session started ({} configs, {} subscriptions)",
        configs.len(),
        handlers.len()
    );

    let mut outbound = fanin::merge(&cancel, outbound);
    let mut outbound_open = true;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => Event::Cancelled,
            event = client.poll_event() => match event {
                Some(ClientEvent::Message(msg)) => Event::Inbound(msg),
                Some(ClientEvent::Reconnected) => Event::Reconnected,
                None => Event::Disconnected,
            },
            msg = outbound.recv(), if outbound_open => match msg {
                Some(msg) => Event::Outbound(msg),
                None => Event::OutboundClosed,
            },
        };

        match event {
            Event::Cancelled => {
                for msg in &farewell {
                    if let Err(e) = client.publish(msg).await {
                        warn!("Failed to publish to {}: {}", msg.topic, e);
                    }
                }
                break;
            }
            Event::Inbound(msg) => dispatch(&handlers, &msg),
            Event::Reconnected => {
                info!("Restoring subscriptions and discovery configs");
                if let Err(e) = announce(&mut client, &handlers, &configs).await {
                    warn!("Could not restore subscriptions: {}", e);
                }
            }
            Event::Disconnected => {
                warn!("MQTT connection closed");
                break;
            }
            Event::Outbound(msg) => {
                if let Err(e) = client.publish(&msg).await {
                    warn!("Failed to publish to {}: {}", msg.topic, e);
                }
            }
            Event::OutboundClosed => {
                debug!("All outbound message channels closed");
                outbound_open = false;
            }
        }
    }

    if let Err(e) = client.disconnect().await {
        debug!("Error disconnecting from broker: {}", e);
    }
    info!("MQTT session stopped");
    Ok(())
}

/// Subscribe to every command topic and publish every discovery config
async fn announce<C: MqttClient>(
    client: &mut C,
    handlers: &HashMap<String, Handler>,
    configs: &[Message],
) -> Result<(), MqttError> {
    for topic in handlers.keys() {
        client.subscribe(topic).await?;
        debug!("Subscribed to {}", topic);
    }
    for config in configs {
        if let Err(e) = client.publish(config).await {
            warn!("Failed to publish discovery config {}: {}", config.topic, e);
        }
    }
    Ok(())
}

fn dispatch(handlers: &HashMap<String, Handler>, msg: &Message) {
    let Some(handler) = handlers.get(&msg.topic) else {
        debug!("No handler for {}", msg.topic);
        return;
    };
    debug!("Dispatching command on {}", msg.topic);
    if let Err(e) = handler(msg) {
        warn!("Command handler for {} failed: {:#}", msg.topic, e);
    }
}

/// Remove entities from Home Assistant by publishing an empty retained
/// payload to each of their config topics.
pub async fn unpublish<C: MqttClient>(
    client: &mut C,
    configs: &[Message],
    prefix: &str,
) -> Result<(), MqttError> {
    let mut first_err = None;
    for config in configs {
        if let Some((component, _, object_id)) = parse_config_topic(&config.topic, prefix) {
            debug!("Removing {} {}", component, object_id);
        }
        let empty = Message::new(config.topic.clone(), Vec::new()).retained();
        if let Err(e) = client.publish(&empty).await {
            warn!("Failed to remove {}: {}", config.topic, e);
            first_err.get_or_insert(e);
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
