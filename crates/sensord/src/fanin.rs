//! Many-to-one channel merging.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of merged channels. Provides backpressure when sources produce
/// faster than the consumer drains.
pub const MERGE_CHANNEL_SIZE: usize = 1024;

/// Merge `sources` into a single receiver.
///
/// One forwarding task is spawned per source. Each forwards values in the
/// order its source produced them and exits when its source closes, when the
/// merged receiver is dropped, or when `cancel` fires. The merged receiver
/// closes once every forwarding task has exited.
pub fn merge<T: Send + 'static>(
    cancel: &CancellationToken,
    sources: Vec<mpsc::Receiver<T>>,
) -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel(MERGE_CHANNEL_SIZE);

    for mut source in sources {
        let tx = tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => break,
                    item = source.recv() => item,
                };
                let Some(item) = item else { break };
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });
    }

    rx
}
