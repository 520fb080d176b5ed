//! Local commands exposed as MQTT buttons and switches.
//!
//! The commands file is TOML:
//!
//! ```toml
//! [[button]]
//! name = "Lock Screen"
//! exec = "loginctl lock-session"
//! icon = "mdi:lock"
//!
//! [[switch]]
//! name = "Do Not Disturb"
//! exec = "/usr/local/bin/dnd"
//! ```
//!
//! A button runs `exec` on every press. A switch runs `exec ON` or
//! `exec OFF` and reports the new state when that succeeds; its initial
//! state is read by running `exec` with no arguments and looking for `ON`
//! or `OFF` in the output.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::controller::EntityController;
use crate::mqtt::ButtonEntity;
use crate::mqtt::Device;
use crate::mqtt::EntityError;
use crate::mqtt::EntityInfo;
use crate::mqtt::Message;
use crate::mqtt::SwitchEntity;

/// Upper bound for reading a switch's current state
const STATE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum CommandsError {
    #[error("Failed to read {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse commands file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("command {0:?} has nothing to execute")]
    EmptyExec(String),

    #[error(transparent)]
    Entity(#[from] EntityError),
}

#[derive(Debug, Default, Deserialize)]
pub struct CommandsFile {
    #[serde(default)]
    pub button: Vec<CommandEntry>,

    #[serde(default)]
    pub switch: Vec<CommandEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandEntry {
    pub name: String,

    /// Program and arguments, split on whitespace
    pub exec: String,

    #[serde(default)]
    pub icon: Option<String>,
}

impl CommandEntry {
    fn argv(&self) -> Result<Vec<String>, CommandsError> {
        let argv: Vec<String> = self.exec.split_whitespace().map(String::from).collect();
        if argv.is_empty() {
            return Err(CommandsError::EmptyExec(self.name.clone()));
        }
        Ok(argv)
    }

    fn info(&self) -> EntityInfo {
        let info = EntityInfo::new(self.name.clone());
        match &self.icon {
            Some(icon) => info.with_icon(icon.clone()),
            None => info,
        }
    }
}

impl CommandsFile {
    pub fn from_file(path: &Path) -> Result<Self, CommandsError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| CommandsError::Io(path.to_path_buf(), e))?;
        Ok(toml::from_str(&contents)?)
    }
}

/// Run `argv` plus `extra`, returning stdout
async fn exec(argv: &[String], extra: Option<&str>) -> anyhow::Result<String> {
    let mut command = Command::new(&argv[0]);
    command.args(&argv[1..]);
    if let Some(arg) = extra {
        command.arg(arg);
    }
    let output = command.output().await?;
    if !output.status.success() {
        anyhow::bail!(
            "exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// `ON`/`OFF` anywhere in a switch's status output
fn parse_state(output: &str) -> Option<bool> {
    output
        .split_whitespace()
        .find_map(|word| match word.to_ascii_uppercase().as_str() {
            "ON" => Some(true),
            "OFF" => Some(false),
            _ => None,
        })
}

fn button(device: &Device, entry: &CommandEntry) -> Result<ButtonEntity, CommandsError> {
    let argv = entry.argv()?;
    let name = entry.name.clone();
    let button = ButtonEntity::new(entry.info()).on_press(move || {
        let argv = argv.clone();
        let name = name.clone();
        tokio::spawn(async move {
            match exec(&argv, None).await {
                Ok(_) => info!("[{}] Command ran", name),
                Err(e) => warn!("[{}] Command failed: {:#}", name, e),
            }
        });
        Ok(())
    });
    // Validate the topic up front
    button.config(device)?;
    Ok(button)
}

fn switch(
    device: &Device,
    entry: &CommandEntry,
    tx: mpsc::Sender<Message>,
) -> Result<SwitchEntity, CommandsError> {
    let argv = entry.argv()?;
    let base = SwitchEntity::new(entry.info());
    let on = base.state(device, true)?;
    let off = base.state(device, false)?;

    {
        let argv = argv.clone();
        let name = entry.name.clone();
        let (on, off, tx) = (on.clone(), off.clone(), tx.clone());
        tokio::spawn(async move {
            let state = match tokio::time::timeout(STATE_TIMEOUT, exec(&argv, None)).await {
                Ok(Ok(output)) => parse_state(&output),
                Ok(Err(e)) => {
                    warn!("[{}] Could not read state: {:#}", name, e);
                    None
                }
                Err(_) => {
                    warn!("[{}] Reading state timed out", name);
                    None
                }
            };
            match state {
                Some(state) => {
                    let _ = tx.send(if state { on } else { off }).await;
                }
                None => debug!("[{}] No initial state", name),
            }
        });
    }

    let name = entry.name.clone();
    Ok(base.on_command(move |state| {
        let argv = argv.clone();
        let name = name.clone();
        let msg = if state { on.clone() } else { off.clone() };
        let tx = tx.clone();
        tokio::spawn(async move {
            let arg = if state { "ON" } else { "OFF" };
            match exec(&argv, Some(arg)).await {
                Ok(_) => {
                    info!("[{}] Switched {}", name, arg);
                    let _ = tx.send(msg).await;
                }
                Err(e) => warn!("[{}] Switching {} failed: {:#}", name, arg, e),
            }
        });
        Ok(())
    }))
}

/// Controller exposing every entry in `commands`. Entries that cannot be
/// turned into entities are skipped with a warning.
pub fn commands_controller(
    commands: &CommandsFile,
    device: Device,
    cancel: &CancellationToken,
) -> EntityController {
    let mut builder = EntityController::builder(device.clone());
    for entry in &commands.button {
        match button(&device, entry) {
            Ok(b) => builder = builder.button(b),
            Err(e) => warn!("Skipping button {:?}: {}", entry.name, e),
        }
    }
    for entry in &commands.switch {
        match switch(&device, entry, builder.sender()) {
            Ok(s) => builder = builder.switch(s),
            Err(e) => warn!("Skipping switch {:?}: {}", entry.name, e),
        }
    }
    info!(
        "Loaded {} command buttons and {} command switches",
        commands.button.len(),
        commands.switch.len()
    );
    builder.build(cancel)
}
