//! deskrelay CLI - relay remote desktop sessions through a public broker
//!
//! `deskrelay relay` runs the broker, `deskrelay agent` runs next to the desktop service.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use deskrelay_agent::HostAgent;
use deskrelay_config::{ConfigManager, Settings};
use deskrelay_connection::{Worker, WorkerState};
use deskrelay_server::Broker;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = concat!(
    env!("GIT_TAG"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// deskrelay - reach a desktop behind NAT through a public relay
#[derive(Parser, Debug)]
#[command(name = "deskrelay")]
#[command(about = "deskrelay - reach a desktop behind NAT through a public relay")]
#[command(version = VERSION)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "DESKRELAY_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay broker
    #[command(long_about = r#"
Run the relay broker. Host agents register on the host port; public clients
connect to the receive port their host claimed.

EXAMPLES:
  # Defaults: registration on 21000, receive ports 21001-21999
  deskrelay relay

  # Restrict the receive ports and listen on one interface
  deskrelay relay --port-range 21001-21010 --bind 10.0.0.5

ENVIRONMENT VARIABLES:
  DESKRELAY_CONFIG       Settings file (.json, .yaml or .yml)
  DESKRELAY_HOST_PORT    Registration port
  DESKRELAY_PORT_RANGE   Receive port range (start-end)
  DESKRELAY_BIND         Interface to listen on
    "#)]
    Relay {
        /// Settings file (created with defaults if missing)
        #[arg(long, short = 'c', env = "DESKRELAY_CONFIG")]
        config: Option<PathBuf>,

        /// Registration port
        #[arg(long, env = "DESKRELAY_HOST_PORT")]
        host_port: Option<u16>,

        /// Receive port range, e.g. 21001-21999
        #[arg(long, env = "DESKRELAY_PORT_RANGE", value_parser = parse_port_range)]
        port_range: Option<(u16, u16)>,

        /// Interface to listen on
        #[arg(long, env = "DESKRELAY_BIND")]
        bind: Option<IpAddr>,
    },

    /// Run the host agent next to the desktop service
    #[command(long_about = r#"
Register with a relay and forward each matched public client to the local
desktop service. Reconnects automatically.

EXAMPLES:
  # Claim receive port 21005 on relay.example.com
  deskrelay agent --relay relay.example.com --receive-port 21005 --name office

  # Desktop service on a non-default port
  deskrelay agent --relay relay.example.com --local 127.0.0.1:3390

ENVIRONMENT VARIABLES:
  DESKRELAY_CONFIG        Settings file (.json, .yaml or .yml)
  DESKRELAY_RELAY         Relay host
  DESKRELAY_RELAY_PORT    Relay registration port
  DESKRELAY_NAME          Name reported to the relay
  DESKRELAY_RECEIVE_PORT  Receive port to claim
  DESKRELAY_LOCAL         Local desktop service (host:port)
    "#)]
    Agent {
        /// Settings file (created with defaults if missing)
        #[arg(long, short = 'c', env = "DESKRELAY_CONFIG")]
        config: Option<PathBuf>,

        /// Relay host
        #[arg(long, env = "DESKRELAY_RELAY")]
        relay: Option<String>,

        /// Relay registration port
        #[arg(long, env = "DESKRELAY_RELAY_PORT")]
        relay_port: Option<u16>,

        /// Name reported to the relay (generated if not specified)
        #[arg(long, env = "DESKRELAY_NAME")]
        name: Option<String>,

        /// Receive port to claim on the relay
        #[arg(long, env = "DESKRELAY_RECEIVE_PORT")]
        receive_port: Option<u16>,

        /// Local desktop service (host:port)
        #[arg(long, env = "DESKRELAY_LOCAL")]
        local: Option<String>,

        /// Maximum consecutive failed attempts (0 = infinite)
        #[arg(long, default_value = "0")]
        max_reconnect_attempts: usize,

        /// Delay between attempts in seconds
        #[arg(long, default_value = "1")]
        reconnect_delay: u64,
    },

    /// Write a settings file with default values
    InitConfig {
        /// Destination (.json, .yaml or .yml)
        path: PathBuf,
    },
}

/// Parse `start-end`
fn parse_port_range(value: &str) -> Result<(u16, u16), String> {
    let (start, end) = value
        .split_once('-')
        .ok_or_else(|| format!("expected start-end, got '{}'", value))?;
    let start: u16 = start
        .trim()
        .parse()
        .map_err(|_| format!("invalid start port '{}'", start))?;
    let end: u16 = end
        .trim()
        .parse()
        .map_err(|_| format!("invalid end port '{}'", end))?;
    if start > end {
        return Err(format!("start port {} exceeds end port {}", start, end));
    }
    Ok((start, end))
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    match path {
        Some(path) => ConfigManager::load_or_init(path)
            .with_context(|| format!("Failed to load settings from {:?}", path)),
        None => Ok(Settings::default()),
    }
}

async fn run_relay(
    config: Option<PathBuf>,
    host_port: Option<u16>,
    port_range: Option<(u16, u16)>,
    bind: Option<IpAddr>,
) -> Result<()> {
    let mut settings = load_settings(config.as_deref())?;
    if let Some(port) = host_port {
        settings.host_port = port;
    }
    if let Some((start, end)) = port_range {
        settings.remote_port_start = start;
        settings.remote_port_end = end;
    }
    if let Some(bind) = bind {
        settings.relay.bind = bind.to_string();
    }

    let broker = Broker::new(settings.broker_config().context("Invalid relay settings")?);
    let addr = broker.start().await.context("Failed to start relay")?;
    info!("Relay ready on {}", addr);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");

    broker.stop().await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_agent(
    config: Option<PathBuf>,
    relay: Option<String>,
    relay_port: Option<u16>,
    name: Option<String>,
    receive_port: Option<u16>,
    local: Option<String>,
    max_reconnect_attempts: usize,
    reconnect_delay: u64,
) -> Result<()> {
    let mut settings = load_settings(config.as_deref())?;
    if let Some(relay) = relay {
        settings.client.domain = relay;
    }
    if let Some(port) = relay_port {
        settings.host_port = port;
    }
    if name.is_some() {
        settings.client.name = name;
    }
    if let Some(port) = receive_port {
        settings.client.port = port;
    }
    if let Some(local) = local {
        settings.client.local = local;
    }

    let mut agent_config = settings.agent_config().context("Invalid agent settings")?;
    agent_config.reconnect.initial_backoff = Duration::from_secs(reconnect_delay);
    agent_config.reconnect.max_attempts =
        (max_reconnect_attempts > 0).then_some(max_reconnect_attempts);

    if settings.client.name.is_none() {
        info!("Auto-generated agent name: {}", agent_config.name);
    }

    let agent = HostAgent::new(agent_config).context("Failed to create agent")?;
    agent.start().context("Failed to start agent")?;

    let mut states = agent.subscribe();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            changed = states.changed() => {
                if changed.is_err() || !agent.is_running() {
                    warn!("Agent stopped on its own");
                    break;
                }
            }
        }
    }

    agent.stop().await;
    if agent.state() == WorkerState::Faulted {
        anyhow::bail!("Agent gave up reconnecting");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level)?;

    match cli.command {
        Commands::Relay {
            config,
            host_port,
            port_range,
            bind,
        } => {
            info!("deskrelay relay {} starting...", VERSION);
            run_relay(config, host_port, port_range, bind).await
        }
        Commands::Agent {
            config,
            relay,
            relay_port,
            name,
            receive_port,
            local,
            max_reconnect_attempts,
            reconnect_delay,
        } => {
            info!("deskrelay agent {} starting...", VERSION);
            run_agent(
                config,
                relay,
                relay_port,
                name,
                receive_port,
                local,
                max_reconnect_attempts,
                reconnect_delay,
            )
            .await
        }
        Commands::InitConfig { path } => {
            let settings = ConfigManager::load_or_init(&path)
                .with_context(|| format!("Failed to write settings to {:?}", path))?;
            println!("Settings written to {}", path.display());
            println!("Agent name: {}", settings.client.name.unwrap_or_default());
            Ok(())
        }
    }
}
