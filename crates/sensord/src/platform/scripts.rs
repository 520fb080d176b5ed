//! Custom sensors reported by user scripts.
//!
//! Every executable in the scripts directory is run on its own schedule. A
//! script prints JSON (or TOML) naming its schedule and sensors:
//!
//! ```json
//! {
//!   "schedule": "@every 30s",
//!   "sensors": [
//!     {"sensor_name": "Backup Age", "sensor_state": 3, "sensor_units": "d"}
//!   ]
//! }
//! ```

use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;
use tracing::warn;

use crate::sensor::Snapshot;
use crate::sensor::StateClass;
use crate::sensor::sensor_id;
use crate::worker::Poller;
use crate::worker::WorkerError;

/// Used until a script has reported a schedule we understand
const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

const DATA_SOURCE: &str = "data_source";
const SCRIPT: &str = "script";

#[derive(Debug, Deserialize)]
struct ScriptOutput {
    schedule: String,
    #[serde(default)]
    sensors: Vec<ScriptSensor>,
}

#[derive(Debug, Deserialize)]
struct ScriptSensor {
    sensor_name: String,
    sensor_state: serde_json::Value,
    #[serde(default)]
    sensor_icon: Option<String>,
    #[serde(default)]
    sensor_units: Option<String>,
    /// "binary" for on/off sensors
    #[serde(default)]
    sensor_type: Option<String>,
    #[serde(default)]
    sensor_device_class: Option<String>,
    #[serde(default)]
    sensor_state_class: Option<String>,
    #[serde(default)]
    sensor_attributes: serde_json::Map<String, serde_json::Value>,
}

impl ScriptSensor {
    fn into_snapshot(self, script: &str) -> Snapshot {
        let binary = matches!(self.sensor_type.as_deref(), Some("binary" | "binary_sensor"));
        let mut snapshot = if binary {
            Snapshot::binary(self.sensor_name, truthy(&self.sensor_state))
        } else {
            Snapshot::new(self.sensor_name, self.sensor_state)
        };
        snapshot.icon = self.sensor_icon;
        snapshot.units = self.sensor_units;
        snapshot.device_class = self.sensor_device_class;
        snapshot.state_class = match self.sensor_state_class {
            Some(class) => match class.parse::<StateClass>() {
                Ok(class) => Some(class),
                Err(_) => {
                    warn!("[{}] Unknown state class {:?}", script, class);
                    None
                }
            },
            None => None,
        };
        snapshot.attributes = self.sensor_attributes;
        snapshot
            .attributes
            .insert(DATA_SOURCE.to_string(), SCRIPT.into());
        snapshot
    }
}

fn truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::String(s) => {
            matches!(s.to_ascii_lowercase().as_str(), "on" | "true" | "yes" | "1")
        }
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        _ => false,
    }
}

fn parse_output(text: &str) -> Result<ScriptOutput, WorkerError> {
    serde_json::from_str(text).or_else(|json_err| {
        toml::from_str(text).map_err(|toml_err| {
            WorkerError::Other(format!(
                "output is neither JSON ({}) nor TOML ({})",
                json_err, toml_err
            ))
        })
    })
}

/// Interval for a script schedule.
///
/// Accepts `@every <duration>` with `ms`, `s`, `m` and `h` parts (e.g.
/// `@every 1m30s`) plus `@hourly`, `@daily`, `@midnight` and `@weekly`.
/// The named ones run at that period from agent start, not on the wall
/// clock. Cron field expressions are not supported.
pub fn parse_schedule(schedule: &str) -> Option<Duration> {
    let schedule = schedule.trim();
    if let Some(every) = schedule.strip_prefix("@every") {
        return parse_duration(every.trim());
    }
    match schedule {
        "@hourly" => Some(Duration::from_secs(3600)),
        "@daily" | "@midnight" => Some(Duration::from_secs(24 * 3600)),
        "@weekly" => Some(Duration::from_secs(7 * 24 * 3600)),
        _ => None,
    }
}

fn parse_duration(s: &str) -> Option<Duration> {
    let mut rest = s;
    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit())?;
        if digits == 0 {
            return None;
        }
        let value: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        total += match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.checked_mul(60)?),
            "h" => Duration::from_secs(value.checked_mul(3600)?),
            _ => return None,
        };
        rest = &rest[unit_len..];
    }
    (!total.is_zero()).then_some(total)
}

/// Executables directly inside `dir`, sorted. A missing directory has none.
pub fn find_scripts(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut scripts = Vec::new();
    for entry in entries {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_file() && is_executable(&metadata) {
            scripts.push(entry.path());
        }
    }
    scripts.sort();
    Ok(scripts)
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}

/// Runs one script per poll and follows the schedule it reports
pub struct ScriptPoller {
    id: String,
    path: PathBuf,
    timeout: Duration,
    interval: Mutex<Duration>,
}

impl ScriptPoller {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            id: format!("script_{}", sensor_id(&name)),
            path,
            timeout,
            interval: Mutex::new(DEFAULT_INTERVAL),
        }
    }

    async fn run(&self) -> Result<String, WorkerError> {
        let mut command = Command::new(&self.path);
        command.kill_on_drop(true);
        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                WorkerError::Unavailable(format!("timed out after {:?}", self.timeout))
            })??;
        if !output.status.success() {
            return Err(WorkerError::Other(format!(
                "exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Poller for ScriptPoller {
    fn id(&self) -> &str {
        &self.id
    }

    fn interval(&self) -> Duration {
        *self.interval.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn poll(&self, _elapsed: Duration) -> Result<Vec<Snapshot>, WorkerError> {
        let output = parse_output(&self.run().await?)?;

        match parse_schedule(&output.schedule) {
            Some(interval) => {
                *self.interval.lock().unwrap_or_else(|e| e.into_inner()) = interval;
            }
            None => warn!(
                "[{}] Unsupported schedule {:?}, running every {:?}",
                self.id,
                output.schedule,
                self.interval()
            ),
        }

        debug!("[{}] Reported {} sensors", self.id, output.sensors.len());
        Ok(output
            .sensors
            .into_iter()
            .map(|s| s.into_snapshot(&self.id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::sensor::SensorKind;

    #[test]
    fn test_parse_schedule() {
        assert_eq!(parse_schedule("@every 5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_schedule("@every 1m30s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_schedule(" @every 2h "), Some(Duration::from_secs(7200)));
        assert_eq!(parse_schedule("@every 250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_schedule("@hourly"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_schedule("@daily"), Some(Duration::from_secs(86400)));

        assert_eq!(parse_schedule("@every 0s"), None);
        assert_eq!(parse_schedule("@every 5"), None);
        assert_eq!(parse_schedule("@every s"), None);
        assert_eq!(parse_schedule("@every 5d"), None);
        assert_eq!(parse_schedule("*/5 * * * *"), None);
    }

    #[test]
    fn test_parse_json_output() {
        let output = parse_output(
            r#"{
                "schedule": "@every 10s",
                "sensors": [
                    {
                        "sensor_name": "Backup Age",
                        "sensor_state": 3,
                        "sensor_units": "d",
                        "sensor_icon": "mdi:backup-restore",
                        "sensor_state_class": "measurement",
                        "sensor_attributes": {"target": "nas"}
                    },
                    {
                        "sensor_name": "Backup Running",
                        "sensor_state": "on",
                        "sensor_type": "binary"
                    }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(output.schedule, "@every 10s");

        let snapshots: Vec<_> = output
            .sensors
            .into_iter()
            .map(|s| s.into_snapshot("test"))
            .collect();
        assert_eq!(snapshots[0].id, "backup_age");
        assert_eq!(snapshots[0].state, serde_json::json!(3));
        assert_eq!(snapshots[0].units.as_deref(), Some("d"));
        assert_eq!(snapshots[0].state_class, Some(StateClass::Measurement));
        assert_eq!(snapshots[0].attributes["target"], "nas");
        assert_eq!(snapshots[0].attributes[DATA_SOURCE], SCRIPT);

        assert_eq!(snapshots[1].kind, SensorKind::BinarySensor);
        assert_eq!(snapshots[1].state, serde_json::json!(true));
    }

    #[test]
    fn test_parse_toml_output() {
        let output = parse_output(
            r#"
                schedule = "@hourly"

                [[sensors]]
                sensor_name = "Pending Updates"
                sensor_state = 12
            "#,
        )
        .unwrap();
        assert_eq!(output.schedule, "@hourly");
        assert_eq!(output.sensors.len(), 1);
        assert_eq!(output.sensors[0].sensor_state, serde_json::json!(12));
    }

    #[test]
    fn test_parse_garbage_output() {
        assert!(matches!(
            parse_output("hello world"),
            Err(WorkerError::Other(_))
        ));
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_find_scripts_missing_dir() {
        let dir = TempDir::new().unwrap();
        assert!(find_scripts(&dir.path().join("nope")).unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_find_scripts_only_executables() {
        let dir = TempDir::new().unwrap();
        let b = write_script(dir.path(), "b.sh", "true");
        let a = write_script(dir.path(), "a.sh", "true");
        std::fs::write(dir.path().join("README"), "not a script").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        assert_eq!(find_scripts(dir.path()).unwrap(), vec![a, b]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_poll_runs_script_and_follows_schedule() {
        let dir = TempDir::new().unwrap();
        let path = write_script(
            dir.path(),
            "disk-check.sh",
            r#"cat <<'EOF'
{
  "schedule": "@every 30s",
  "sensors": [{"sensor_name": "Disk OK", "sensor_state": true, "sensor_type": "binary"}]
}
EOF"#,
        );
        let poller = ScriptPoller::new(path, Duration::from_secs(5));
        assert_eq!(poller.id(), "script_disk_check_sh");
        assert_eq!(poller.interval(), DEFAULT_INTERVAL);

        let snapshots = poller.poll(Duration::ZERO).await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].id, "disk_ok");
        assert!(snapshots[0].is_binary());
        assert_eq!(poller.interval(), Duration::from_secs(30));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_poll_failures() {
        let dir = TempDir::new().unwrap();

        let failing = write_script(dir.path(), "fail.sh", "echo broken >&2\nexit 3");
        let err = ScriptPoller::new(failing, Duration::from_secs(5))
            .poll(Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("broken"));

        let slow = write_script(dir.path(), "slow.sh", "sleep 5");
        let err = ScriptPoller::new(slow, Duration::from_millis(100))
            .poll(Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Unavailable(_)));
    }
}
