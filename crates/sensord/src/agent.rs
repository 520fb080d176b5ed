//! Process lifetime: wires controllers to the tracker and MQTT, and tears
//! everything down on one cancellation token.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::Config;
#[cfg(feature = "webhook")]
use crate::config::Registration;
use crate::controller::MqttController;
use crate::controller::SensorController;
use crate::mqtt;
use crate::mqtt::MqttClient;
#[cfg(feature = "webhook")]
use crate::publisher::DeviceRegistrar;
use crate::registry::Registry;
use crate::tracker::Tracker;

/// A broker client together with the controllers it serves
pub struct MqttSession {
    pub client: Box<dyn MqttClient>,
    pub controllers: Vec<Arc<dyn MqttController>>,
}

pub struct Agent {
    config: Config,
    /// Filesystem root host information is read from
    root: PathBuf,
    cancel: CancellationToken,
}

impl Agent {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            root: PathBuf::from("/"),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Root token; every task the agent starts stops when it fires
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ask the agent to shut down. Safe to call more than once.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            debug!("Stopping agent");
        }
        self.cancel.cancel();
    }

    fn handle_signals(&self) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = shutdown_signal() => {
                    info!("Received shutdown signal");
                    cancel.cancel();
                }
            }
        });
    }

    /// Run until stopped.
    ///
    /// Starts every sensor controller and feeds their update streams to
    /// `tracker`.
    /// Runs the MQTT session and the local API when configured. On shutdown
    /// stops all controllers, gives background tasks the configured grace
    /// period and closes `registry`.
    pub async fn run(
        &self,
        tracker: Arc<Tracker>,
        registry: Arc<dyn Registry>,
        controllers: Vec<Arc<dyn SensorController>>,
        mqtt: Option<MqttSession>,
    ) -> anyhow::Result<()> {
        self.handle_signals();

        // Workers report their current values first on their own update
        // streams, so per-worker order is kept end to end.
        let mut streams = Vec::with_capacity(controllers.len());
        for controller in &controllers {
            match controller.start_all(&self.cancel).await {
                Ok(rx) => streams.push(rx),
                Err(e) => warn!("[{}] Starting controller had problems: {}", controller.name(), e),
            }
        }

        let mut tasks = JoinSet::new();
        {
            let tracker = tracker.clone();
            let registry = registry.clone();
            let cancel = self.cancel.clone();
            tasks.spawn(async move {
                tracker.process(&cancel, registry, streams).await;
            });
        }

        if let Some(session) = mqtt {
            let cancel = self.cancel.clone();
            tasks.spawn(async move {
                if let Err(e) = mqtt::run(session.client, session.controllers, cancel).await {
                    error!("MQTT session failed: {}", e);
                }
            });
        }

        if let Some(api) = self.config.api.clone() {
            let tracker = tracker.clone();
            let registry = registry.clone();
            let cancel = self.cancel.clone();
            tasks.spawn(async move {
                let served =
                    crate::api::serve(&api.listen, api.port, tracker, registry, cancel).await;
                if let Err(e) = served {
                    error!("HTTP API server failed: {:#}", e);
                }
            });
        }

        info!("Agent running");
        self.cancel.cancelled().await;
        info!("Agent shutting down");

        for controller in &controllers {
            if let Err(e) = controller.stop_all().await {
                debug!("[{}] Error stopping workers: {}", controller.name(), e);
            }
        }

        let grace = Duration::from_secs(self.config.agent.shutdown_grace_secs);
        let drained = tokio::time::timeout(grace, async {
            while let Some(res) = tasks.join_next().await {
                if let Err(e) = res {
                    warn!("Background task failed: {}", e);
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("Background tasks still running after {:?}, aborting", grace);
            tasks.abort_all();
        }

        registry.close();
        info!("Agent stopped");
        Ok(())
    }

    /// Register this device with Home Assistant unless already registered.
    ///
    /// With `force` the device is registered again and all local sensor state
    /// is discarded: the tracker cache is cleared and the registry is reset
    /// (or its store deleted when `registry` is not open).
    #[cfg(feature = "webhook")]
    pub async fn register(
        &self,
        registrar: &DeviceRegistrar,
        tracker: Option<&Tracker>,
        registry: Option<&dyn Registry>,
        force: bool,
    ) -> anyhow::Result<Registration> {
        let state_dir = self.config.agent.state_dir();
        if !force {
            if let Some(existing) = Registration::load(&state_dir)? {
                debug!("Already registered with {}", existing.server);
                return Ok(existing);
            }
        }

        let device = crate::platform::device_registration(&self.root, &self.config.agent.id);
        let response = registrar
            .register(&device)
            .await
            .context("device registration failed")?;

        let ignore_urls = self
            .config
            .remote
            .as_ref()
            .is_some_and(|r| r.ignore_urls);
        let registration = Registration {
            server: registrar.server().to_string(),
            webhook_url: response.webhook_url(registrar.server(), ignore_urls),
            webhook_id: response.webhook_id,
        };
        registration
            .save(&state_dir)
            .context("saving registration failed")?;

        if force {
            if let Some(tracker) = tracker {
                tracker.reset();
            }
            let reset = match registry {
                Some(registry) => registry.reset(),
                None => crate::registry::remove_store(&self.config.agent.registry_dir()),
            };
            if let Err(e) = reset {
                warn!("Problem resetting registry: {}", e);
            }
        }

        info!("Agent registered with {}", registration.server);
        Ok(registration)
    }

    /// Remove this agent's entities from Home Assistant's MQTT discovery.
    /// Failures are logged, not returned.
    pub async fn reset<C: MqttClient>(
        &self,
        mut client: C,
        controllers: &[Arc<dyn MqttController>],
    ) -> anyhow::Result<()> {
        let Some(config) = &self.config.mqtt else {
            return Ok(());
        };

        let configs: Vec<_> = controllers.iter().flat_map(|c| c.configs()).collect();
        let result = async {
            client.connect().await?;
            let removed = mqtt::unpublish(&mut client, &configs, &config.discovery_prefix).await;
            client.disconnect().await?;
            removed
        }
        .await;

        match result {
            Ok(()) => info!("Removed {} MQTT entities", configs.len()),
            Err(e) => warn!("Problems occurred resetting MQTT configuration: {}", e),
        }
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Could not listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::SignalKind;
        use tokio::signal::unix::signal;

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!("Could not listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::config::MqttConfig;
    use crate::controller::DeviceController;
    use crate::controller::EntityController;
    use crate::mqtt::BinarySensorEntity;
    use crate::mqtt::Device;
    use crate::mqtt::DeviceInfo;
    use crate::mqtt::EntityInfo;
    use crate::mqtt::MockMqttClient;
    use crate::publisher::PublishError;
    use crate::publisher::Publisher;
    use crate::publisher::UpdateStatus;
    use crate::registry::RegistryError;
    use crate::registry::SqliteRegistry;
    use crate::sensor::Snapshot;
    use crate::worker::UpdateReceiver;
    use crate::worker::Worker;
    use crate::worker::WorkerError;
    use crate::worker::idle_updates;

    #[derive(Default)]
    struct RecordingPublisher {
        registered: Mutex<Vec<String>>,
        /// States in the order they reached the publisher
        sent: Mutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn register_sensor(&self, s: &Snapshot) -> Result<(), PublishError> {
            self.registered.lock().unwrap().push(s.id.clone());
            self.sent.lock().unwrap().push(s.state.clone());
            Ok(())
        }

        async fn update_sensor(&self, s: &Snapshot) -> Result<UpdateStatus, PublishError> {
            self.sent.lock().unwrap().push(s.state.clone());
            Ok(UpdateStatus::default())
        }
    }

    /// Emits one snapshot, then idles until cancelled
    struct OneShotWorker;

    #[async_trait]
    impl Worker for OneShotWorker {
        fn id(&self) -> &str {
            "one_shot"
        }

        async fn sensors(&self, _cancel: &CancellationToken) -> Result<Vec<Snapshot>, WorkerError> {
            Ok(vec![Snapshot::new("Battery Level", 80)])
        }

        async fn updates(&self, cancel: CancellationToken) -> Result<UpdateReceiver, WorkerError> {
            let (tx, rx) = tokio::sync::mpsc::channel(1);
            let mut idle = idle_updates(cancel);
            tokio::spawn(async move {
                let _ = tx.send(Snapshot::new("Battery Level", 80)).await;
                idle.recv().await;
            });
            Ok(rx)
        }

        async fn stop(&self) -> Result<(), WorkerError> {
            Ok(())
        }
    }

    /// Slow to answer `sensors()`, quick to push a newer value on its stream
    struct SlowSnapshotWorker;

    #[async_trait]
    impl Worker for SlowSnapshotWorker {
        fn id(&self) -> &str {
            "slow_snapshot"
        }

        async fn sensors(&self, _cancel: &CancellationToken) -> Result<Vec<Snapshot>, WorkerError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(vec![Snapshot::new("Temp", 1)])
        }

        async fn updates(&self, cancel: CancellationToken) -> Result<UpdateReceiver, WorkerError> {
            let (tx, rx) = tokio::sync::mpsc::channel(1);
            let mut idle = idle_updates(cancel);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let _ = tx.send(Snapshot::new("Temp", 2)).await;
                idle.recv().await;
            });
            Ok(rx)
        }

        async fn stop(&self) -> Result<(), WorkerError> {
            Ok(())
        }
    }

    fn config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.agent.state_dir = Some(dir.to_path_buf());
        config.agent.shutdown_grace_secs = 1;
        config.mqtt = Some(MqttConfig {
            broker: "localhost".to_string(),
            port: 1883,
            client_id: "sensord".to_string(),
            discovery_prefix: "homeassistant".to_string(),
            username: None,
            password: None,
            commands: None,
        });
        config
    }

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

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let agent = Agent::new(Config::default());
        agent.stop();
        agent.stop();
        assert!(agent.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_run_until_stopped() {
        let dir = TempDir::new().unwrap();
        let agent = Arc::new(Agent::new(config(dir.path())));
        let publisher = Arc::new(RecordingPublisher::default());
        let tracker = Arc::new(Tracker::new(publisher.clone()));
        let registry = Arc::new(SqliteRegistry::open(agent.config().agent.registry_dir()).unwrap());
        let controllers: Vec<Arc<dyn SensorController>> = vec![Arc::new(DeviceController::new(
            "test",
            vec![Arc::new(OneShotWorker)],
        ))];

        let cancel = agent.cancel_token();
        let entities: Vec<Arc<dyn MqttController>> = vec![Arc::new(
            EntityController::builder(device())
                .binary_sensor(BinarySensorEntity::new(EntityInfo::new("Agent Online")))
                .build(&cancel),
        )];
        let mock = MockMqttClient::new();
        let session = MqttSession {
            client: Box::new(mock.clone()),
            controllers: entities,
        };

        let run = {
            let agent = agent.clone();
            let tracker = tracker.clone();
            let registry: Arc<dyn Registry> = registry.clone();
            tokio::spawn(
                async move { agent.run(tracker, registry, controllers, Some(session)).await },
            )
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while publisher.registered.lock().unwrap().is_empty() || mock.published().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        agent.stop();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(*publisher.registered.lock().unwrap(), vec!["battery_level"]);
        assert_eq!(
            mock.published()[0].topic,
            "homeassistant/binary_sensor/laptop/agent_online/config"
        );
        // Registry is closed on the way out
        assert!(matches!(registry.get("battery_level"), Err(RegistryError::Closed)));
    }

    #[tokio::test]
    async fn test_run_keeps_update_order() {
        let dir = TempDir::new().unwrap();
        let agent = Arc::new(Agent::new(config(dir.path())));
        let publisher = Arc::new(RecordingPublisher::default());
        let tracker = Arc::new(Tracker::new(publisher.clone()));
        let registry: Arc<dyn Registry> =
            Arc::new(SqliteRegistry::open(agent.config().agent.registry_dir()).unwrap());
        let controllers: Vec<Arc<dyn SensorController>> = vec![Arc::new(DeviceController::new(
            "test",
            vec![Arc::new(SlowSnapshotWorker)],
        ))];

        let run = {
            let agent = agent.clone();
            let tracker = tracker.clone();
            tokio::spawn(async move { agent.run(tracker, registry, controllers, None).await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while publisher.sent.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        // Long enough for a late answer from sensors() to show up
        tokio::time::sleep(Duration::from_millis(300)).await;

        agent.stop();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(*publisher.sent.lock().unwrap(), vec![serde_json::json!(2)]);
        assert_eq!(tracker.get("temp").unwrap().state, serde_json::json!(2));
    }

    #[tokio::test]
    async fn test_reset_unpublishes_configs() {
        let dir = TempDir::new().unwrap();
        let agent = Agent::new(config(dir.path()));
        let controllers: Vec<Arc<dyn MqttController>> = vec![Arc::new(
            EntityController::builder(device())
                .binary_sensor(BinarySensorEntity::new(EntityInfo::new("Agent Online")))
                .build(&agent.cancel_token()),
        )];

        let mock = MockMqttClient::new();
        agent.reset(mock.clone(), &controllers).await.unwrap();

        let published = mock.published();
        assert_eq!(published.len(), 1);
        assert!(published[0].payload.is_empty());
        assert!(published[0].retain);
    }

    #[tokio::test]
    async fn test_reset_without_mqtt_is_noop() {
        let agent = Agent::new(Config::default());
        let mock = MockMqttClient::new();
        agent.reset(mock.clone(), &[]).await.unwrap();
        assert!(!mock.is_connected());
    }

    #[cfg(feature = "webhook")]
    mod register {
        use mockito::Server;

        use super::*;

        async fn registration_server() -> (mockito::ServerGuard, mockito::Mock) {
            let mut server = Server::new_async().await;
            let mock = server
                .mock("POST", "/api/mobile_app/registrations")
                .with_status(201)
                .with_body(r#"{"webhook_id": "hook1"}"#)
                .create_async()
                .await;
            (server, mock)
        }

        #[tokio::test]
        async fn test_register_once() {
            let dir = TempDir::new().unwrap();
            let (server, mock) = registration_server().await;
            let agent = Agent::new(config(dir.path())).with_root(dir.path());
            let registrar =
                DeviceRegistrar::new(server.url(), "token", Duration::from_secs(5)).unwrap();
            let tracker = Tracker::new(Arc::new(RecordingPublisher::default()));

            let reg = agent.register(&registrar, Some(&tracker), None, false).await.unwrap();
            assert_eq!(reg.webhook_id, "hook1");
            assert_eq!(reg.webhook_url, format!("{}/api/webhook/hook1", server.url()));
            assert_eq!(Registration::load(dir.path()).unwrap(), Some(reg.clone()));

            // Already registered: no second request
            let again = agent.register(&registrar, Some(&tracker), None, false).await.unwrap();
            assert_eq!(again, reg);
            mock.expect(1).assert_async().await;
        }

        #[tokio::test]
        async fn test_force_register_resets_state() {
            let dir = TempDir::new().unwrap();
            let (server, _mock) = registration_server().await;
            let agent = Agent::new(config(dir.path())).with_root(dir.path());
            let registrar =
                DeviceRegistrar::new(server.url(), "token", Duration::from_secs(5)).unwrap();

            let tracker = Tracker::new(Arc::new(RecordingPublisher::default()));
            let registry = SqliteRegistry::open(agent.config().agent.registry_dir()).unwrap();
            registry.set_registered("battery_level", true).unwrap();

            agent
                .register(&registrar, Some(&tracker), Some(&registry as &dyn Registry), true)
                .await
                .unwrap();
            assert!(matches!(
                registry.get("battery_level"),
                Err(RegistryError::NotFound(_))
            ));
        }

        #[tokio::test]
        async fn test_register_failure_is_fatal() {
            let dir = TempDir::new().unwrap();
            let mut server = Server::new_async().await;
            server
                .mock("POST", "/api/mobile_app/registrations")
                .with_status(401)
                .create_async()
                .await;
            let agent = Agent::new(config(dir.path())).with_root(dir.path());
            let registrar =
                DeviceRegistrar::new(server.url(), "bad", Duration::from_secs(5)).unwrap();
            let tracker = Tracker::new(Arc::new(RecordingPublisher::default()));

            assert!(agent.register(&registrar, Some(&tracker), None, false).await.is_err());
            assert_eq!(Registration::load(dir.path()).unwrap(), None);
        }
    }
}
