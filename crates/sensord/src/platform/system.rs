//! Host information and procfs-backed workers.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::sensor::Snapshot;
use crate::sensor::StateClass;
use crate::worker::Poller;
use crate::worker::UpdateReceiver;
use crate::worker::Worker;
use crate::worker::WorkerError;

const DATA_SOURCE: &str = "data_source";
const PROCFS: &str = "procfs";

/// Read a file below `root`, trimming whitespace
async fn read_trimmed(root: &Path, rel: &str) -> Result<String, WorkerError> {
    let contents = tokio::fs::read_to_string(root.join(rel)).await?;
    Ok(contents.trim().to_string())
}

/// `(NAME, VERSION_ID)` from an os-release file
pub fn parse_os_release(contents: &str) -> (Option<String>, Option<String>) {
    let mut name = None;
    let mut version = None;
    for line in contents.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim() {
            "NAME" => name = Some(value),
            "VERSION_ID" => version = Some(value),
            _ => {}
        }
    }
    (name, version)
}

/// Seconds since boot from `/proc/uptime`
pub fn parse_uptime(contents: &str) -> Result<f64, WorkerError> {
    contents
        .split_whitespace()
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| WorkerError::Other(format!("malformed uptime: {:?}", contents)))
}

/// 1, 5 and 15 minute load averages from `/proc/loadavg`
pub fn parse_loadavg(contents: &str) -> Result<[f64; 3], WorkerError> {
    let mut fields = contents.split_whitespace().map(str::parse::<f64>);
    let mut out = [0.0; 3];
    for slot in &mut out {
        *slot = match fields.next() {
            Some(Ok(v)) => v,
            _ => {
                return Err(WorkerError::Other(format!(
                    "malformed loadavg: {:?}",
                    contents
                )));
            }
        };
    }
    Ok(out)
}

/// Static facts about the host and agent: reported once on start.
pub struct InfoWorker {
    root: PathBuf,
    hostname: String,
}

impl InfoWorker {
    pub const ID: &'static str = "system_info";

    pub fn new(root: impl Into<PathBuf>, hostname: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            hostname: hostname.into(),
        }
    }
}

#[async_trait]
impl Worker for InfoWorker {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn sensors(&self, _cancel: &CancellationToken) -> Result<Vec<Snapshot>, WorkerError> {
        let mut sensors = vec![
            Snapshot::new("Agent Version", env!("CARGO_PKG_VERSION"))
                .diagnostic()
                .with_icon("mdi:information-outline"),
            Snapshot::new("Hostname", self.hostname.as_str())
                .diagnostic()
                .with_icon("mdi:network"),
        ];

        match read_trimmed(&self.root, "proc/sys/kernel/osrelease").await {
            Ok(kernel) => sensors.push(
                Snapshot::new("Kernel Version", kernel)
                    .diagnostic()
                    .with_icon("mdi:chip")
                    .with_attribute(DATA_SOURCE, PROCFS),
            ),
            Err(e) => warn!("[{}] Could not read kernel version: {}", Self::ID, e),
        }

        match read_trimmed(&self.root, "etc/os-release").await {
            Ok(contents) => {
                let (name, version) = parse_os_release(&contents);
                if let Some(name) = name {
                    sensors.push(
                        Snapshot::new("Distribution Name", name)
                            .diagnostic()
                            .with_icon("mdi:linux"),
                    );
                }
                if let Some(version) = version {
                    sensors.push(
                        Snapshot::new("Distribution Version", version)
                            .diagnostic()
                            .with_icon("mdi:numeric"),
                    );
                }
            }
            Err(e) => warn!("[{}] Could not read os-release: {}", Self::ID, e),
        }

        Ok(sensors)
    }

    async fn updates(&self, cancel: CancellationToken) -> Result<UpdateReceiver, WorkerError> {
        let sensors = self.sensors(&cancel).await?;
        let (tx, rx) = mpsc::channel(sensors.len().max(1));
        tokio::spawn(async move {
            for s in sensors {
                if tx.send(s).await.is_err() {
                    return;
                }
            }
            // Nothing changes after start; hold the stream open until told
            // to stop.
            cancel.cancelled().await;
        });
        Ok(rx)
    }

    async fn stop(&self) -> Result<(), WorkerError> {
        Ok(())
    }
}

/// Time since boot
pub struct UptimePoller {
    root: PathBuf,
}

impl UptimePoller {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Poller for UptimePoller {
    fn id(&self) -> &str {
        "uptime"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(15 * 60)
    }

    fn jitter(&self) -> Duration {
        Duration::from_secs(30)
    }

    async fn poll(&self, _elapsed: Duration) -> Result<Vec<Snapshot>, WorkerError> {
        let secs = parse_uptime(&read_trimmed(&self.root, "proc/uptime").await?)?;
        Ok(vec![
            Snapshot::new("Uptime", (secs / 3600.0 * 100.0).round() / 100.0)
                .diagnostic()
                .with_units("h")
                .with_device_class("duration")
                .with_state_class(StateClass::Measurement)
                .with_icon("mdi:restart")
                .with_attribute(DATA_SOURCE, PROCFS),
        ])
    }
}

/// CPU load averages
pub struct LoadAvgPoller {
    root: PathBuf,
}

impl LoadAvgPoller {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Poller for LoadAvgPoller {
    fn id(&self) -> &str {
        "load_average"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn jitter(&self) -> Duration {
        Duration::from_secs(5)
    }

    async fn poll(&self, _elapsed: Duration) -> Result<Vec<Snapshot>, WorkerError> {
        let loads = parse_loadavg(&read_trimmed(&self.root, "proc/loadavg").await?)?;
        Ok(["1 min", "5 min", "15 min"]
            .iter()
            .zip(loads)
            .map(|(period, load)| {
                Snapshot::new(format!("CPU load average ({})", period), load)
                    .with_units("load")
                    .with_state_class(StateClass::Measurement)
                    .with_icon("mdi:chip")
                    .with_attribute(DATA_SOURCE, PROCFS)
            })
            .collect())
    }
}
