//! Settings file for the relay and the host agent
//!
//! Settings are stored as JSON (`.json`) or YAML (`.yaml`/`.yml`). Every field has a default,
//! so a partial file is valid. [`Settings::broker_config`] and [`Settings::agent_config`] turn
//! the file into validated runtime snapshots.

use deskrelay_agent::{default_agent_name, AgentConfig};
use deskrelay_connection::PumpConfig;
use deskrelay_proto::messages::validate_name;
use deskrelay_proto::{
    PortRange, DEFAULT_HOST_PORT, DEFAULT_REMOTE_PORT_END, DEFAULT_REMOTE_PORT_START,
};
use deskrelay_server::{BrokerConfig, RendezvousConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write config file {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path:?}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Failed to serialize config: {0}")]
    Serialize(String),

    #[error("Unsupported config format {0:?} (use .json, .yaml or .yml)")]
    UnsupportedFormat(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Relay-only settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Interface the registration and receive ports listen on
    pub bind: String,
    /// Seconds a public client may wait for a host
    pub match_window: u64,
    /// Seconds before an unused receive port is released
    pub idle_timeout: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            match_window: 15,
            idle_timeout: 300,
        }
    }
}

/// Host agent settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Name reported to the relay; generated when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Relay host
    pub domain: String,
    /// Receive port to claim on the relay
    pub port: u16,
    /// Local desktop service (host:port)
    pub local: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            name: None,
            domain: "localhost".to_string(),
            port: DEFAULT_REMOTE_PORT_START,
            local: "127.0.0.1:3389".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Pump buffer per direction, in bytes
    pub buffer_size: usize,
    /// Registration port
    pub host_port: u16,
    pub remote_port_start: u16,
    pub remote_port_end: u16,
    /// Pump stall timeout, in seconds
    pub timeout: u64,
    pub relay: RelaySettings,
    pub client: ClientSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            buffer_size: 1024 * 1024,
            host_port: DEFAULT_HOST_PORT,
            remote_port_start: DEFAULT_REMOTE_PORT_START,
            remote_port_end: DEFAULT_REMOTE_PORT_END,
            timeout: 5,
            relay: RelaySettings::default(),
            client: ClientSettings::default(),
        }
    }
}

impl Settings {
    pub fn port_range(&self) -> PortRange {
        PortRange::new(self.remote_port_start, self.remote_port_end)
    }

    fn pump_config(&self) -> PumpConfig {
        PumpConfig {
            buffer_size: self.buffer_size,
            stall_timeout: Duration::from_secs(self.timeout),
            ..Default::default()
        }
    }

    /// Check the values shared by both roles
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "buffer_size must be greater than 0".to_string(),
            ));
        }
        if self.timeout == 0 {
            return Err(ConfigError::Invalid(
                "timeout must be at least 1 second".to_string(),
            ));
        }
        if self.port_range().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "remote_port_start ({}) must not exceed remote_port_end ({})",
                self.remote_port_start, self.remote_port_end
            )));
        }
        if self.port_range().contains(i32::from(self.host_port)) {
            return Err(ConfigError::Invalid(format!(
                "host_port {} overlaps the receive port range {}",
                self.host_port,
                self.port_range()
            )));
        }
        Ok(())
    }

    /// Relay snapshot
    pub fn broker_config(&self) -> Result<BrokerConfig, ConfigError> {
        self.validate()?;

        let bind_host: IpAddr = self.relay.bind.parse().map_err(|_| {
            ConfigError::Invalid(format!("Invalid bind address '{}'", self.relay.bind))
        })?;

        Ok(BrokerConfig {
            bind_addr: SocketAddr::new(bind_host, self.host_port),
            port_range: self.port_range(),
            pump: self.pump_config(),
            rendezvous: RendezvousConfig {
                bind_host,
                match_window: Duration::from_secs(self.relay.match_window),
                ..Default::default()
            },
            idle_timeout: Duration::from_secs(self.relay.idle_timeout),
            ..Default::default()
        })
    }

    /// Host agent snapshot; an unset name gets a generated one
    ///
    /// The receive port is checked against the relay's own range at registration.
    pub fn agent_config(&self) -> Result<AgentConfig, ConfigError> {
        self.validate()?;

        let name = match &self.client.name {
            Some(name) => {
                validate_name(name).map_err(|e| ConfigError::Invalid(e.to_string()))?;
                name.clone()
            }
            None => default_agent_name(),
        };

        if self.client.port == 0 {
            return Err(ConfigError::Invalid("client port must not be 0".to_string()));
        }

        Ok(AgentConfig {
            name,
            relay_host: self.client.domain.clone(),
            relay_port: self.host_port,
            receive_port: self.client.port,
            local_addr: self.client.local.clone(),
            pump: self.pump_config(),
            ..Default::default()
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Yaml,
}

impl Format {
    fn of(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Ok(Format::Json),
            Some("yaml") | Some("yml") => Ok(Format::Yaml),
            _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

/// Configuration manager
pub struct ConfigManager;

impl ConfigManager {
    /// Load the settings from disk
    pub fn load(path: &Path) -> Result<Settings, ConfigError> {
        let format = Format::of(path)?;
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let parsed = match format {
            Format::Json => serde_json::from_str(&text).map_err(|e| e.to_string()),
            Format::Yaml => serde_yaml::from_str(&text).map_err(|e| e.to_string()),
        };

        let settings = parsed.map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })?;
        debug!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    /// Load the settings, writing defaults first if the file does not exist
    ///
    /// A freshly written file gets a generated agent name, so the host keeps the same name
    /// across restarts.
    pub fn load_or_init(path: &Path) -> Result<Settings, ConfigError> {
        if path.exists() {
            return Self::load(path);
        }

        let mut settings = Settings::default();
        settings.client.name = Some(default_agent_name());
        Self::save(path, &settings)?;
        info!("Wrote default settings to {:?}", path);
        Ok(settings)
    }

    /// Save the settings to disk
    pub fn save(path: &Path, settings: &Settings) -> Result<(), ConfigError> {
        let format = Format::of(path)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let text = match format {
            Format::Json => serde_json::to_string_pretty(settings).map_err(|e| e.to_string()),
            Format::Yaml => serde_yaml::to_string(settings).map_err(|e| e.to_string()),
        }
        .map_err(ConfigError::Serialize)?;

        fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}
