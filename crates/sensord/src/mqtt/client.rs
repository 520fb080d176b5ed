use async_trait::async_trait;

use super::Message;
use super::MqttError;

/// Something the connection reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A message on a subscribed topic
    Message(Message),
    /// The connection came back after dropping. The broker may have lost
    /// subscriptions and retained messages.
    Reconnected,
}

/// Broker operations needed by the runner.
///
/// Kept behind a trait so the runner can be driven by a mock in tests.
#[async_trait]
pub trait MqttClient: Send {
    async fn connect(&mut self) -> Result<(), MqttError>;

    async fn subscribe(&mut self, topic: &str) -> Result<(), MqttError>;

    async fn publish(&mut self, msg: &Message) -> Result<(), MqttError>;

    /// Wait for the next inbound message or reconnect.
    ///
    /// Returns `None` once the connection is gone for good. Must be cancel
    /// safe: dropping the future must not lose an event.
    async fn poll_event(&mut self) -> Option<ClientEvent>;

    /// Flush queued publishes and close the connection.
    async fn disconnect(&mut self) -> Result<(), MqttError>;
}

#[async_trait]
impl<C: MqttClient + ?Sized> MqttClient for Box<C> {
    async fn connect(&mut self) -> Result<(), MqttError> {
        (**self).connect().await
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), MqttError> {
        (**self).subscribe(topic).await
    }

    async fn publish(&mut self, msg: &Message) -> Result<(), MqttError> {
        (**self).publish(msg).await
    }

    async fn poll_event(&mut self) -> Option<ClientEvent> {
        (**self).poll_event().await
    }

    async fn disconnect(&mut self) -> Result<(), MqttError> {
        (**self).disconnect().await
    }
}

#[cfg(feature = "mqtt")]
pub use rumqttc_client::RumqttcClient;

#[cfg(feature = "mqtt")]
mod rumqttc_client {
    use std::time::Duration;

    use async_trait::async_trait;
    use rumqttc::AsyncClient;
    use rumqttc::Event;
    use rumqttc::LastWill;
    use rumqttc::MqttOptions;
    use rumqttc::Outgoing;
    use rumqttc::Packet;
    use rumqttc::QoS;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tracing::info;
    use tracing::warn;

    use super::ClientEvent;
    use super::MqttClient;
    use crate::config::MqttConfig;
    use crate::mqtt::Message;
    use crate::mqtt::MqttError;

    /// Capacity of rumqttc's request queue
    const REQUEST_CAPACITY: usize = 32;

    /// How long `disconnect` waits for queued requests to drain
    const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// [`MqttClient`] over rumqttc. The event loop runs on a background task
    /// that forwards inbound publishes to a channel.
    pub struct RumqttcClient {
        options: MqttOptions,
        client: Option<AsyncClient>,
        inbound: Option<mpsc::UnboundedReceiver<ClientEvent>>,
        event_loop: Option<JoinHandle<()>>,
    }

    impl RumqttcClient {
        pub fn new(config: &MqttConfig) -> Self {
            let mut options =
                MqttOptions::new(config.client_id.clone(), config.broker.clone(), config.port);
            options.set_keep_alive(Duration::from_secs(30));
            // Discovery payloads and images can be large
            options.set_max_packet_size(2 * 1024 * 1024, 2 * 1024 * 1024);

            if let (Some(username), Some(password)) = (&config.username, &config.password) {
                options.set_credentials(username, password);
            }

            Self {
                options,
                client: None,
                inbound: None,
                event_loop: None,
            }
        }

        /// Have the broker publish `will` if the connection drops without a
        /// disconnect.
        pub fn with_last_will(mut self, will: &Message) -> Self {
            self.options.set_last_will(LastWill::new(
                will.topic.clone(),
                will.payload.clone(),
                QoS::AtLeastOnce,
                will.retain,
            ));
            self
        }

        fn client(&self) -> Result<&AsyncClient, MqttError> {
            self.client.as_ref().ok_or(MqttError::NotConnected)
        }
    }

    #[async_trait]
    impl MqttClient for RumqttcClient {
        async fn connect(&mut self) -> Result<(), MqttError> {
            let (client, mut event_loop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);
            let (tx, rx) = mpsc::unbounded_channel();

            let task = tokio::spawn(async move {
                let mut connected_before = false;
                loop {
                    match event_loop.poll().await {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let msg = Message {
                                topic: publish.topic.to_string(),
                                payload: publish.payload.to_vec(),
                                retain: publish.retain,
                            };
                            if tx.send(ClientEvent::Message(msg)).is_err() {
                                break;
                            }
                        }
                        Ok(Event::Incoming(Packet::ConnAck(_))) if connected_before => {
                            info!("Reconnected to MQTT broker");
                            if tx.send(ClientEvent::Reconnected).is_err() {
                                break;
                            }
                        }
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("Connected to MQTT broker");
                            connected_before = true;
                        }
                        Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            warn!("MQTT event loop error: {}", e);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
                info!("MQTT event loop exiting");
            });

            if let Some(old) = self.event_loop.replace(task) {
                old.abort();
            }
            self.client = Some(client);
            self.inbound = Some(rx);
            Ok(())
        }

        async fn subscribe(&mut self, topic: &str) -> Result<(), MqttError> {
            self.client()?.subscribe(topic, QoS::AtMostOnce).await?;
            Ok(())
        }

        async fn publish(&mut self, msg: &Message) -> Result<(), MqttError> {
            self.client()?
                .publish(msg.topic.as_str(), QoS::AtLeastOnce, msg.retain, msg.payload.clone())
                .await?;
            Ok(())
        }

        async fn poll_event(&mut self) -> Option<ClientEvent> {
            match &mut self.inbound {
                Some(rx) => rx.recv().await,
                None => None,
            }
        }

        async fn disconnect(&mut self) -> Result<(), MqttError> {
            let Some(client) = self.client.take() else {
                return Ok(());
            };
            // Requests are handled in order, so everything queued before the
            // disconnect reaches the broker first.
            client.disconnect().await?;
            if let Some(mut task) = self.event_loop.take() {
                if tokio::time::timeout(DISCONNECT_TIMEOUT, &mut task).await.is_err() {
                    warn!("MQTT event loop did not finish within {:?}", DISCONNECT_TIMEOUT);
                    task.abort();
                }
            }
            self.inbound = None;
            Ok(())
        }
    }

    impl Drop for RumqttcClient {
        fn drop(&mut self) {
            if let Some(task) = self.event_loop.take() {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
pub use mock::MockMqttClient;
