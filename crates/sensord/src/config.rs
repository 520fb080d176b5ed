//! Configuration file parsing and structures.
//!
//! sensord reads a single TOML file. Every section is optional: a missing
//! `[remote]`, `[mqtt]` or `[api]` section disables that feature.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::filter::LevelFilter;

pub const APP_NAME: &str = "sensord";
pub const CONFIG_FILE: &str = "sensord.toml";
pub const REGISTRATION_FILE: &str = "registration.toml";
pub const REGISTRY_DIR: &str = "sensorRegistry";
pub const SCRIPTS_DIR: &str = "scripts";

/// Top-level configuration structure
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub remote: Option<RemoteConfig>,

    #[serde(default)]
    pub mqtt: Option<MqttConfig>,

    #[serde(default)]
    pub api: Option<ApiConfig>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,

    /// Per-target levels, e.g. `"sensord::tracker" = "debug"`
    #[serde(default)]
    pub overrides: HashMap<String, LogLevel>,
}

impl LoggingConfig {
    /// Filter for the global subscriber: `level` for everything, plus one
    /// directive per override.
    pub fn env_filter(&self) -> Result<EnvFilter, ConfigError> {
        let mut filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::from(self.level).into())
            .parse_lossy("");

        let mut targets: Vec<_> = self.overrides.iter().collect();
        targets.sort();
        for (target, level) in targets {
            let directive: Directive = format!("{}={}", target, LevelFilter::from(*level))
                .parse()
                .map_err(|e| ConfigError::Logging(format!("{}: {}", target, e)))?;
            filter = filter.add_directive(directive);
        }
        Ok(filter)
    }
}

fn default_agent_id() -> String {
    APP_NAME.to_string()
}

fn default_poll_timeout_secs() -> u64 {
    5
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_maintenance_interval_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Name of this agent; also the default state directory name
    #[serde(default = "default_agent_id")]
    pub id: String,

    /// Where the registry and registration live
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    /// Executables reporting custom sensors. Defaults to `<state_dir>/scripts`.
    #[serde(default)]
    pub scripts_dir: Option<PathBuf>,

    /// Upper bound for one run of a sensor script
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,

    /// How long shutdown waits for background tasks
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: default_agent_id(),
            state_dir: None,
            scripts_dir: None,
            poll_timeout_secs: default_poll_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
        }
    }
}

impl AgentConfig {
    /// Configured state directory, or `<config dir>/<id>`
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(&self.id)
        })
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.state_dir().join(REGISTRY_DIR)
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.scripts_dir
            .clone()
            .unwrap_or_else(|| self.state_dir().join(SCRIPTS_DIR))
    }
}

fn default_remote_timeout_secs() -> u64 {
    30
}

/// Home Assistant server to register with
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    pub server: Option<String>,

    /// Long-lived access token, only needed to register
    pub token: Option<String>,

    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,

    /// Post to the server URL even if registration returned cloud URLs
    #[serde(default)]
    pub ignore_urls: bool,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

/// Configuration for the MQTT broker connection
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// MQTT broker hostname or IP address
    pub broker: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default = "default_agent_id")]
    pub client_id: String,

    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,

    pub username: Option<String>,

    pub password: Option<String>,

    /// TOML file of `[[button]]` and `[[switch]]` entries exposing local
    /// commands as entities
    #[serde(default)]
    pub commands: Option<PathBuf>,
}

fn default_api_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8565
}

/// Local HTTP API
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_listen")]
    pub listen: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// `$XDG_CONFIG_HOME/sensord/sensord.toml` (or platform equivalent)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Load `path` if given. Otherwise try `./sensord.toml`, then the
    /// default path, then fall back to built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        if let Some(path) = path {
            return Ok((Self::from_file(path)?, Some(path.to_path_buf())));
        }

        let candidates = std::iter::once(PathBuf::from(CONFIG_FILE)).chain(Self::default_path());
        for candidate in candidates {
            if candidate.is_file() {
                return Ok((Self::from_file(&candidate)?, Some(candidate)));
            }
        }
        Ok((Self::default(), None))
    }
}

/// Result of registering this device, persisted in the state directory
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Registration {
    pub server: String,
    pub webhook_id: String,
    pub webhook_url: String,
}

impl Registration {
    pub fn path(state_dir: &Path) -> PathBuf {
        state_dir.join(REGISTRATION_FILE)
    }

    /// Read the saved registration. A missing file means not registered.
    pub fn load(state_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let path = Self::path(state_dir);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ConfigError::Io(path, e)),
        };
        Ok(Some(toml::from_str(&contents)?))
    }

    pub fn save(&self, state_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(state_dir)
            .map_err(|e| ConfigError::Io(state_dir.to_path_buf(), e))?;
        let path = Self::path(state_dir);
        let contents = toml::to_string(self)?;
        std::fs::write(&path, contents).map_err(|e| ConfigError::Io(path, e))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid logging override {0}")]
    Logging(String),
}
