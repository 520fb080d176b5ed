use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::fanin;
use crate::sensor::Snapshot;
use crate::worker::UpdateReceiver;
use crate::worker::Worker;
use crate::worker::WorkerError;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    #[error("worker already started: {0}")]
    WorkerAlreadyStarted(String),

    #[error("worker not running: {0}")]
    WorkerNotRunning(String),

    /// Stopped workers cannot be restarted; construct a fresh one instead
    #[error("worker already stopped: {0}")]
    WorkerStopped(String),

    #[error("worker {id} failed: {source}")]
    Worker {
        id: String,
        #[source]
        source: WorkerError,
    },
}

/// Lifecycle of a worker managed by a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    Running,
    Stopped,
}

/// Supervisor for a named group of workers
#[async_trait]
pub trait SensorController: Send + Sync {
    fn name(&self) -> &str;

    /// Names of all running workers
    async fn active_workers(&self) -> Vec<String>;

    /// Names of all workers that are not running
    async fn inactive_workers(&self) -> Vec<String>;

    /// Start the named worker and return its update stream.
    async fn start(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<UpdateReceiver, ControllerError>;

    /// Stop the named worker.
    async fn stop(&self, name: &str) -> Result<(), ControllerError>;

    /// Start every worker that is not running yet and merge their streams.
    ///
    /// Workers that fail to start are logged and left out of the merged stream.
    async fn start_all(&self, cancel: &CancellationToken)
    -> Result<UpdateReceiver, ControllerError>;

    /// Stop every running worker. Keeps going after a failure and returns the
    /// first error encountered.
    async fn stop_all(&self) -> Result<(), ControllerError>;

    /// Poll the current value of every worker's sensors, each bounded by
    /// `timeout`. Workers that fail or time out are logged and skipped.
    async fn sensors(&self, cancel: &CancellationToken, timeout: Duration) -> Vec<Snapshot>;
}

struct ManagedWorker {
    worker: Arc<dyn Worker>,
    state: WorkerState,
    /// Child token handed to the worker's update production
    cancel: Option<CancellationToken>,
}

/// Controller owning a fixed set of workers, supplied at construction
pub struct DeviceController {
    name: String,
    workers: Mutex<BTreeMap<String, ManagedWorker>>,
}

impl DeviceController {
    /// Create a controller for `workers`. Later workers replace earlier ones
    /// with the same id.
    pub fn new(name: impl Into<String>, workers: Vec<Arc<dyn Worker>>) -> Self {
        let name = name.into();
        let mut map = BTreeMap::new();
        for worker in workers {
            let id = worker.id().to_string();
            if map.contains_key(&id) {
                warn!("[{}] Duplicate worker id {}, replacing", name, id);
            }
            map.insert(
                id,
                ManagedWorker {
                    worker,
                    state: WorkerState::NotStarted,
                    cancel: None,
                },
            );
        }
        Self {
            name,
            workers: Mutex::new(map),
        }
    }

    /// Current state of the named worker
    pub async fn state(&self, name: &str) -> Option<WorkerState> {
        self.workers.lock().await.get(name).map(|w| w.state)
    }

    async fn start_worker(
        &self,
        managed: &mut ManagedWorker,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<UpdateReceiver, ControllerError> {
        match managed.state {
            WorkerState::Running => {
                return Err(ControllerError::WorkerAlreadyStarted(name.to_string()));
            }
            WorkerState::Stopped => return Err(ControllerError::WorkerStopped(name.to_string())),
            WorkerState::NotStarted => {}
        }

        let token = cancel.child_token();
        let rx = managed
            .worker
            .updates(token.clone())
            .await
            .map_err(|source| ControllerError::Worker {
                id: name.to_string(),
                source,
            })?;

        managed.state = WorkerState::Running;
        managed.cancel = Some(token);
        debug!("[{}] Started worker {}", self.name, name);
        Ok(rx)
    }

    async fn stop_worker(managed: &mut ManagedWorker, name: &str) -> Result<(), ControllerError> {
        if managed.state != WorkerState::Running {
            return Err(ControllerError::WorkerNotRunning(name.to_string()));
        }

        if let Some(token) = managed.cancel.take() {
            token.cancel();
        }
        managed.state = WorkerState::Stopped;

        managed
            .worker
            .stop()
            .await
            .map_err(|source| ControllerError::Worker {
                id: name.to_string(),
                source,
            })
    }

    async fn workers_in(&self, running: bool) -> Vec<String> {
        self.workers
            .lock()
            .await
            .iter()
            .filter(|(_, w)| (w.state == WorkerState::Running) == running)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[async_trait]
impl SensorController for DeviceController {
    fn name(&self) -> &str {
        &self.name
    }

    async fn active_workers(&self) -> Vec<String> {
        self.workers_in(true).await
    }

    async fn inactive_workers(&self) -> Vec<String> {
        self.workers_in(false).await
    }

    async fn start(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<UpdateReceiver, ControllerError> {
        let mut workers = self.workers.lock().await;
        let managed = workers
            .get_mut(name)
            .ok_or_else(|| ControllerError::UnknownWorker(name.to_string()))?;
        self.start_worker(managed, cancel, name).await
    }

    async fn stop(&self, name: &str) -> Result<(), ControllerError> {
        let mut workers = self.workers.lock().await;
        let managed = workers
            .get_mut(name)
            .ok_or_else(|| ControllerError::UnknownWorker(name.to_string()))?;
        Self::stop_worker(managed, name).await
    }

    async fn start_all(
        &self,
        cancel: &CancellationToken,
    ) -> Result<UpdateReceiver, ControllerError> {
        let mut streams = Vec::new();

        {
            let mut workers = self.workers.lock().await;
            for (name, managed) in workers.iter_mut() {
                if managed.state != WorkerState::NotStarted {
                    continue;
                }
                match self.start_worker(managed, cancel, name).await {
                    Ok(rx) => streams.push(rx),
                    Err(e) => warn!("[{}] Could not start worker: {}", self.name, e),
                }
            }
        }

        info!("[{}] Started {} workers", self.name, streams.len());
        Ok(fanin::merge(cancel, streams))
    }

    async fn stop_all(&self) -> Result<(), ControllerError> {
        let mut first_err = None;
        let mut workers = self.workers.lock().await;

        for (name, managed) in workers.iter_mut() {
            if managed.state != WorkerState::Running {
                continue;
            }
            if let Err(e) = Self::stop_worker(managed, name).await {
                warn!("[{}] Error stopping worker: {}", self.name, e);
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn sensors(&self, cancel: &CancellationToken, timeout: Duration) -> Vec<Snapshot> {
        let workers: Vec<Arc<dyn Worker>> = self
            .workers
            .lock()
            .await
            .values()
            .map(|w| w.worker.clone())
            .collect();

        let mut polls = JoinSet::new();
        for worker in workers {
            let cancel = cancel.clone();
            polls.spawn(async move {
                let id = worker.id().to_string();
                let res = tokio::time::timeout(timeout, worker.sensors(&cancel)).await;
                (id, res)
            });
        }

        let mut snapshots = Vec::new();
        while let Some(joined) = polls.join_next().await {
            match joined {
                Ok((_, Ok(Ok(mut s)))) => snapshots.append(&mut s),
                Ok((id, Ok(Err(e)))) => warn!("[{}] Worker {} poll failed: {}", self.name, id, e),
                Ok((id, Err(_))) => warn!("[{}] Worker {} poll timed out", self.name, id),
                Err(e) => warn!("[{}] Worker poll task failed: {}", self.name, e),
            }
        }
        snapshots
    }
}
