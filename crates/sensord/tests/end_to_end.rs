//! Workers through controller, tracker and registry to a publisher.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sensord::DeviceController;
use sensord::PublishError;
use sensord::Publisher;
use sensord::Registry;
use sensord::SensorController;
use sensord::Snapshot;
use sensord::SqliteRegistry;
use sensord::Tracker;
use sensord::Worker;
use sensord::publisher::UpdateStatus;
use sensord::registry::Entry;
use sensord::worker::UpdateReceiver;
use sensord::worker::WorkerError;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Register(String, serde_json::Value),
    Update(String, serde_json::Value),
}

#[derive(Default)]
struct RecordingPublisher {
    calls: Mutex<Vec<Call>>,
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn register_sensor(&self, s: &Snapshot) -> Result<(), PublishError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Register(s.id.clone(), s.state.clone()));
        Ok(())
    }

    async fn update_sensor(&self, s: &Snapshot) -> Result<UpdateStatus, PublishError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Update(s.id.clone(), s.state.clone()));
        Ok(UpdateStatus::default())
    }
}

/// Sends its script, then closes its stream
struct ScriptedWorker {
    id: &'static str,
    script: Vec<Snapshot>,
}

#[async_trait]
impl Worker for ScriptedWorker {
    fn id(&self) -> &str {
        self.id
    }

    async fn sensors(&self, _cancel: &CancellationToken) -> Result<Vec<Snapshot>, WorkerError> {
        Ok(self.script.last().cloned().into_iter().collect())
    }

    async fn updates(&self, _cancel: CancellationToken) -> Result<UpdateReceiver, WorkerError> {
        let (tx, rx) = mpsc::channel(self.script.len().max(1));
        for s in &self.script {
            let _ = tx.send(s.clone()).await;
        }
        Ok(rx)
    }

    async fn stop(&self) -> Result<(), WorkerError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_battery_and_cpu_reach_publisher() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(SqliteRegistry::open(dir.path()).unwrap());
    let publisher = Arc::new(RecordingPublisher::default());
    let tracker = Tracker::new(publisher.clone());

    let controller = DeviceController::new(
        "test",
        vec![
            Arc::new(ScriptedWorker {
                id: "battery",
                script: vec![Snapshot::new("Battery Level", 42)],
            }),
            Arc::new(ScriptedWorker {
                id: "cpu",
                script: vec![Snapshot::new("cpu_pct", 10), Snapshot::new("cpu_pct", 15)],
            }),
        ],
    );

    let cancel = CancellationToken::new();
    let stream = controller.start_all(&cancel).await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        tracker.process(&cancel, registry.clone(), vec![stream]),
    )
    .await
    .unwrap();

    let calls = publisher.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 3);
    assert!(calls.contains(&Call::Register("battery_level".to_string(), 42.into())));

    let cpu: Vec<_> = calls
        .iter()
        .filter(|c| matches!(c, Call::Register(id, _) | Call::Update(id, _) if id == "cpu_pct"))
        .cloned()
        .collect();
    assert_eq!(
        cpu,
        vec![
            Call::Register("cpu_pct".to_string(), 10.into()),
            Call::Update("cpu_pct".to_string(), 15.into()),
        ]
    );

    let registered = Entry {
        registered: true,
        disabled: false,
    };
    assert_eq!(registry.get("battery_level").unwrap(), registered);
    assert_eq!(registry.get("cpu_pct").unwrap(), registered);

    controller.stop_all().await.unwrap();
    assert!(controller.active_workers().await.is_empty());
    registry.close();
}

#[tokio::test]
async fn test_disabled_sensor_resumes_when_enabled() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(SqliteRegistry::open(dir.path()).unwrap());
    let publisher = Arc::new(RecordingPublisher::default());
    let tracker = Tracker::new(publisher.clone());
    let cancel = CancellationToken::new();

    registry.add("cpu_pct").unwrap();
    registry.set_registered("cpu_pct", true).unwrap();
    registry.set_disabled("cpu_pct", true).unwrap();

    let (tx, rx) = mpsc::channel(4);
    tx.send(Snapshot::new("cpu_pct", 10)).await.unwrap();
    drop(tx);
    tracker.process(&cancel, registry.clone(), vec![rx]).await;
    assert!(publisher.calls.lock().unwrap().is_empty());
    // Still visible locally
    assert_eq!(tracker.get("cpu_pct").unwrap().state, 10);

    registry.set_disabled("cpu_pct", false).unwrap();
    let (tx, rx) = mpsc::channel(4);
    tx.send(Snapshot::new("cpu_pct", 20)).await.unwrap();
    drop(tx);
    tracker.process(&cancel, registry.clone(), vec![rx]).await;
    assert_eq!(
        *publisher.calls.lock().unwrap(),
        vec![Call::Update("cpu_pct".to_string(), 20.into())]
    );
}
