use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use sensord::Agent;
use sensord::Config;
use sensord::MqttSession;
use sensord::Registration;
use sensord::SqliteRegistry;
use sensord::Tracker;
use sensord::mqtt::RumqttcClient;
use sensord::platform;
use sensord::publisher::DeviceRegistrar;
use sensord::publisher::WebhookPublisher;
use sensord::registry;
use tracing::info;
use tracing::warn;

#[derive(Parser)]
#[command(name = "sensord", version)]
#[command(about = "Collects host sensors and publishes them to Home Assistant")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, short, env = "SENSORD_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent until interrupted
    Run,
    /// Register this device with Home Assistant
    Register {
        /// Server URL, overrides [remote] server
        #[arg(long)]
        server: Option<String>,

        /// Long-lived access token, overrides [remote] token
        #[arg(long)]
        token: Option<String>,

        /// Register again, discarding all local sensor state
        #[arg(long)]
        force: bool,
    },
    /// Remove MQTT entities and local state
    Reset,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (config, path) = Config::load(cli.config.as_deref()).context("loading configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(config.logging.env_filter()?)
        .init();

    info!("sensord {} starting", env!("CARGO_PKG_VERSION"));
    match &path {
        Some(path) => info!("Loaded config from: {}", path.display()),
        None => info!("No config file found, using defaults"),
    }

    let agent = Agent::new(config);
    match cli.command {
        Commands::Run => run(&agent).await,
        Commands::Register {
            server,
            token,
            force,
        } => {
            let registrar = registrar(agent.config(), server, token)?;
            agent.register(&registrar, None, None, force).await?;
            Ok(())
        }
        Commands::Reset => reset(&agent).await,
    }
}

fn remote_timeout(config: &Config) -> Duration {
    Duration::from_secs(config.remote.as_ref().map_or(30, |r| r.timeout_secs))
}

fn registrar(
    config: &Config,
    server: Option<String>,
    token: Option<String>,
) -> anyhow::Result<DeviceRegistrar> {
    let remote = config.remote.as_ref();
    let server = server
        .or_else(|| remote.and_then(|r| r.server.clone()))
        .context("no server to register with; set [remote] server or pass --server")?;
    let token = token
        .or_else(|| remote.and_then(|r| r.token.clone()))
        .context("no access token; set [remote] token or pass --token")?;
    Ok(DeviceRegistrar::new(server, token, remote_timeout(config))?)
}

async fn run(agent: &Agent) -> anyhow::Result<()> {
    let config = agent.config();

    let registration = match Registration::load(&config.agent.state_dir())? {
        Some(registration) => registration,
        None => {
            info!("Device not registered yet");
            let registrar = registrar(config, None, None)?;
            agent.register(&registrar, None, None, false).await?
        }
    };

    let registry = Arc::new(
        SqliteRegistry::open(config.agent.registry_dir()).context("opening sensor registry")?,
    );
    let cancel = agent.cancel_token();
    registry.start_maintenance(
        &cancel,
        Duration::from_secs(config.agent.maintenance_interval_secs),
    );

    let publisher = WebhookPublisher::new(registration.webhook_url, remote_timeout(config))
        .context("creating webhook publisher")?;
    let tracker = Arc::new(Tracker::new(Arc::new(publisher)));

    let controllers = platform::sensor_controllers(agent.root(), &config.agent);

    let mqtt = match (platform::mqtt_device(config)?, &config.mqtt) {
        (Some(device), Some(mqtt)) => {
            let will = platform::last_will(&device)?;
            let commands = mqtt.commands.as_deref();
            Some(MqttSession {
                client: Box::new(RumqttcClient::new(mqtt).with_last_will(&will)),
                controllers: platform::mqtt_controllers(device, commands, &cancel, cancel.clone()),
            })
        }
        _ => None,
    };

    agent.run(tracker, registry, controllers, mqtt).await
}

async fn reset(agent: &Agent) -> anyhow::Result<()> {
    let config = agent.config();

    if let (Some(device), Some(mqtt)) = (platform::mqtt_device(config)?, &config.mqtt) {
        let cancel = agent.cancel_token();
        let commands = mqtt.commands.as_deref();
        let controllers = platform::mqtt_controllers(device, commands, &cancel, cancel.clone());
        agent.reset(RumqttcClient::new(mqtt), &controllers).await?;
    }

    if let Err(e) = registry::remove_store(&config.agent.registry_dir()) {
        warn!("Could not remove sensor registry: {}", e);
    }
    let registration = Registration::path(&config.agent.state_dir());
    match std::fs::remove_file(&registration) {
        Ok(()) => info!("Removed {}", registration.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove {}: {}", registration.display(), e),
    }

    agent.stop();
    Ok(())
}
