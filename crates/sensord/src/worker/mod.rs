mod polling;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use polling::Poller;
pub use polling::PollingWorker;

use crate::sensor::Snapshot;

/// Capacity for a single worker's update channel
pub const UPDATE_CHANNEL_SIZE: usize = 64;

pub type UpdateSender = mpsc::Sender<Snapshot>;
pub type UpdateReceiver = mpsc::Receiver<Snapshot>;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The underlying data source is temporarily unavailable
    #[error("data source unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// A producer of sensor snapshots.
///
/// Workers know nothing about controllers or publishing. They report current
/// values on request and optionally push updates as they happen.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Stable, non-empty identifier, unique within a controller
    fn id(&self) -> &str;

    /// Current value of every sensor this worker owns.
    async fn sensors(&self, cancel: &CancellationToken) -> Result<Vec<Snapshot>, WorkerError>;

    /// Start producing updates.
    ///
    /// The returned stream must close once `cancel` fires. Workers that only
    /// support polling may return a stream that never emits.
    async fn updates(&self, cancel: CancellationToken) -> Result<UpdateReceiver, WorkerError>;

    /// Release background resources. Safe to call before `updates` and more
    /// than once.
    async fn stop(&self) -> Result<(), WorkerError>;
}

/// Stream for workers with nothing to push: it never emits and closes when
/// `cancel` fires.
pub fn idle_updates(cancel: CancellationToken) -> UpdateReceiver {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        cancel.cancelled().await;
        drop(tx);
    });
    rx
}
