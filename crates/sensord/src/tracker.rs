//! Fan-in of worker updates to a remote [`Publisher`].
//!
//! Every snapshot is cached as the sensor's last known value, then filtered
//! through the [`Registry`]: new sensors are registered with the publisher,
//! disabled ones are dropped and the rest are sent as state updates.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::fanin;
use crate::publisher::Publisher;
use crate::registry::Entry;
use crate::registry::Registry;
use crate::registry::RegistryError;
use crate::sensor::Snapshot;
use crate::worker::UpdateReceiver;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("sensor not tracked: {0}")]
    NotFound(String),
}

pub struct Tracker {
    publisher: Arc<dyn Publisher>,
    cache: Mutex<HashMap<String, Snapshot>>,
}

impl Tracker {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self {
            publisher,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, Snapshot>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Consume `streams` until `cancel` fires or every stream closes.
    ///
    /// Updates from one stream are handled in the order they were produced;
    /// there is no ordering across streams. Publish failures are logged and
    /// the update is dropped.
    pub async fn process(
        &self,
        cancel: &CancellationToken,
        registry: Arc<dyn Registry>,
        streams: Vec<UpdateReceiver>,
    ) {
        info!("Tracking updates from {} streams", streams.len());
        let mut merged = fanin::merge(cancel, streams);

        loop {
            let snapshot = tokio::select! {
                _ = cancel.cancelled() => break,
                snapshot = merged.recv() => match snapshot {
                    Some(s) => s,
                    None => break,
                },
            };
            self.handle(registry.as_ref(), snapshot).await;
        }
        info!("Stopped tracking updates");
    }

    async fn handle(&self, registry: &dyn Registry, snapshot: Snapshot) {
        let id = snapshot.id.clone();
        self.cache().insert(id.clone(), snapshot.clone());

        let entry = match registry.get(&id) {
            Ok(entry) => entry,
            Err(RegistryError::NotFound(_)) => registry.add(&id).unwrap_or_else(|e| {
                warn!("[{}] Could not add to registry, assuming defaults: {}", id, e);
                Entry::default()
            }),
            Err(e) => {
                warn!("[{}] Registry unavailable, assuming defaults: {}", id, e);
                Entry::default()
            }
        };

        if entry.disabled {
            debug!("[{}] Disabled, not sending", id);
            return;
        }

        if !entry.registered {
            match self.publisher.register_sensor(&snapshot).await {
                Ok(()) => {
                    info!("[{}] Registered sensor", id);
                    if let Err(e) = registry.set_registered(&id, true) {
                        warn!("[{}] Could not record registration: {}", id, e);
                    }
                }
                Err(e) => warn!("[{}] Registration failed: {}", id, e),
            }
            return;
        }

        match self.publisher.update_sensor(&snapshot).await {
            Ok(status) if status.disabled => {
                info!("[{}] Disabled remotely, dropping further updates", id);
                if let Err(e) = registry.set_disabled(&id, true) {
                    warn!("[{}] Could not record disabled state: {}", id, e);
                }
            }
            Ok(_) => debug!("[{}] Sent update", id),
            Err(e) => warn!("[{}] Update failed: {}", id, e),
        }
    }

    /// Ids of every sensor seen since start or the last reset, sorted
    pub fn sensor_list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.cache().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Last known value of a sensor
    pub fn get(&self, id: &str) -> Result<Snapshot, TrackerError> {
        self.cache()
            .get(id)
            .cloned()
            .ok_or_else(|| TrackerError::NotFound(id.to_string()))
    }

    /// Forget every cached value. The registry is untouched.
    pub fn reset(&self) {
        self.cache().clear();
    }
}
