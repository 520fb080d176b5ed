use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use super::UPDATE_CHANNEL_SIZE;
use super::UpdateReceiver;
use super::Worker;
use super::WorkerError;
use crate::sensor::Snapshot;

/// Something that can be sampled periodically.
#[async_trait]
pub trait Poller: Send + Sync + 'static {
    fn id(&self) -> &str;

    /// Base time between polls
    fn interval(&self) -> Duration;

    /// Maximum random deviation applied to each interval
    fn jitter(&self) -> Duration {
        Duration::ZERO
    }

    /// Sample all sensors. `elapsed` is the time since the previous poll (zero
    /// on the first one), for pollers that report rates.
    async fn poll(&self, elapsed: Duration) -> Result<Vec<Snapshot>, WorkerError>;
}

/// Adapts a [`Poller`] into a [`Worker`] whose update stream emits every poll.
pub struct PollingWorker<P: Poller> {
    poller: std::sync::Arc<P>,
    /// Token for the running poll task, if any
    running: Mutex<Option<CancellationToken>>,
}

impl<P: Poller> PollingWorker<P> {
    pub fn new(poller: P) -> Self {
        Self {
            poller: std::sync::Arc::new(poller),
            running: Mutex::new(None),
        }
    }

    fn next_delay(interval: Duration, jitter: Duration) -> Duration {
        if jitter.is_zero() {
            return interval;
        }
        let jitter_ms = jitter.as_millis() as i64;
        let offset = rand::thread_rng().gen_range(-jitter_ms..=jitter_ms);
        let delay = interval.as_millis() as i64 + offset;
        Duration::from_millis(delay.max(1) as u64)
    }
}

#[async_trait]
impl<P: Poller> Worker for PollingWorker<P> {
    fn id(&self) -> &str {
        self.poller.id()
    }

    async fn sensors(&self, _cancel: &CancellationToken) -> Result<Vec<Snapshot>, WorkerError> {
        self.poller.poll(Duration::ZERO).await
    }

    async fn updates(&self, cancel: CancellationToken) -> Result<UpdateReceiver, WorkerError> {
        let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_SIZE);
        let token = cancel.child_token();

        {
            let mut running = self
                .running
                .lock()
                .map_err(|e| WorkerError::Other(e.to_string()))?;
            if let Some(old) = running.replace(token.clone()) {
                old.cancel();
            }
        }

        let poller = self.poller.clone();
        tokio::spawn(async move {
            let id = poller.id().to_string();
            let mut last: Option<Instant> = None;
            loop {
                let now = Instant::now();
                let elapsed = last.map(|l| now - l).unwrap_or_default();
                last = Some(now);

                match poller.poll(elapsed).await {
                    Ok(snapshots) => {
                        for snapshot in snapshots {
                            if tx.send(snapshot).await.is_err() {
                                debug!("[{}] Update receiver dropped, stopping", id);
                                return;
                            }
                        }
                    }
                    Err(e) => warn!("[{}] Poll failed: {}", id, e),
                }

                let delay = Self::next_delay(poller.interval(), poller.jitter());
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            debug!("[{}] Polling stopped", id);
        });

        Ok(rx)
    }

    async fn stop(&self) -> Result<(), WorkerError> {
        let token = self
            .running
            .lock()
            .map_err(|e| WorkerError::Other(e.to_string()))?
            .take();
        if let Some(token) = token {
            token.cancel();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;

    struct Counter {
        polls: Arc<AtomicUsize>,
        fail_on: Option<usize>,
    }

    #[async_trait]
    impl Poller for Counter {
        fn id(&self) -> &str {
            "counter"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(5)
        }

        async fn poll(&self, _elapsed: Duration) -> Result<Vec<Snapshot>, WorkerError> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on == Some(n) {
                return Err(WorkerError::Unavailable("flaky".to_string()));
            }
            Ok(vec![Snapshot::new("Count", n)])
        }
    }

    #[tokio::test]
    async fn test_polling_worker_emits_in_order() {
        let polls = Arc::new(AtomicUsize::new(0));
        let worker = PollingWorker::new(Counter {
            polls: polls.clone(),
            fail_on: Some(1),
        });
        let cancel = CancellationToken::new();
        let mut rx = worker.updates(cancel.clone()).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.state, serde_json::json!(0));
        // Poll #1 failed and was skipped
        assert_eq!(second.state, serde_json::json!(2));

        cancel.cancel();
        while rx.recv().await.is_some() {}
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_closes_stream() {
        let worker = PollingWorker::new(Counter {
            polls: Arc::new(AtomicUsize::new(0)),
            fail_on: None,
        });

        // Safe before start
        worker.stop().await.unwrap();

        let mut rx = worker.updates(CancellationToken::new()).await.unwrap();
        worker.stop().await.unwrap();
        worker.stop().await.unwrap();

        let drained = tokio::time::timeout(Duration::from_secs(1), async {
            while rx.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok());
    }

    #[test]
    fn test_next_delay_within_jitter() {
        for _ in 0..100 {
            let d = PollingWorker::<Counter>::next_delay(
                Duration::from_millis(100),
                Duration::from_millis(10),
            );
            assert!(d >= Duration::from_millis(90) && d <= Duration::from_millis(110));
        }
        assert_eq!(
            PollingWorker::<Counter>::next_delay(Duration::from_secs(5), Duration::ZERO),
            Duration::from_secs(5)
        );
    }
}
