use crate::reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
use async_trait::async_trait;
use deskrelay_connection::{
    CancellationToken, Lifecycle, LifecycleError, PumpConfig, PumpEnd, PumpError, PumpReport,
    RelayPump, SessionState, SessionStateCell, Worker, WorkerState,
};
use deskrelay_proto::messages::validate_name;
use deskrelay_proto::{
    read_control, write_registration, ControlMessage, ProtocolError, RegistrationHeader,
    DEFAULT_HOST_PORT, DEFAULT_REMOTE_PORT_START,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

/// Errors that can occur in the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid agent configuration: {0}")]
    InvalidConfig(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Failed to connect to relay {addr}: {source}")]
    RelayConnect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect to local desktop service {addr}: {source}")]
    LocalConnect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out {0}")]
    Timeout(&'static str),

    #[error("Relay closed the connection")]
    RelayClosed,

    #[error("Relay rejected registration: {0}")]
    Rejected(String),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Name used when none is configured: `Unknown-` plus 6 random hex digits
pub fn default_agent_name() -> String {
    format!("Unknown-{:06x}", rand::random::<u32>() & 0x00ff_ffff)
}

/// Configuration for the host agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Name reported to the relay
    pub name: String,

    /// Relay host name or address
    pub relay_host: String,

    /// Relay registration port
    pub relay_port: u16,

    /// Public port on the relay that clients use to reach this host
    pub receive_port: u16,

    /// Desktop service on this machine (host:port)
    pub local_addr: String,

    /// Bound on connects and on the wait for each relay opcode
    pub io_timeout: Duration,

    pub reconnect: ReconnectConfig,

    pub pump: PumpConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            relay_host: "localhost".to_string(),
            relay_port: DEFAULT_HOST_PORT,
            receive_port: DEFAULT_REMOTE_PORT_START,
            local_addr: "127.0.0.1:3389".to_string(),
            io_timeout: Duration::from_secs(3),
            reconnect: ReconnectConfig::default(),
            pump: PumpConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn relay_addr(&self) -> String {
        format!("{}:{}", self.relay_host, self.relay_port)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        validate_name(&self.name).map_err(|e| AgentError::InvalidConfig(e.to_string()))?;

        if self.relay_host.trim().is_empty() {
            return Err(AgentError::InvalidConfig(
                "Relay host cannot be empty".to_string(),
            ));
        }

        if !self.local_addr.contains(':') {
            return Err(AgentError::InvalidConfig(format!(
                "Invalid local address '{}'. Expected 'host:port' (e.g., '127.0.0.1:3389')",
                self.local_addr
            )));
        }

        Ok(())
    }
}

/// How one registration attempt ended
enum Attempt {
    /// A relay session ran; reconnect right away
    Relayed(Result<PumpReport, PumpError>),
    Cancelled,
}

/// State shared with the background loop
struct Shared {
    config: AgentConfig,
    lifecycle: Lifecycle,
    session: SessionStateCell,
    sessions_completed: AtomicU64,
}

/// The host agent - keeps a registration open at the relay and serves one client at a time
pub struct HostAgent {
    shared: Arc<Shared>,
}

impl HostAgent {
    /// Create a new agent, validating the configuration
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        config.validate()?;

        let lifecycle = Lifecycle::new(format!("agent:{}", config.name));
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                lifecycle,
                session: SessionStateCell::new(),
                sessions_completed: AtomicU64::new(0),
            }),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.shared.config
    }

    pub fn state(&self) -> WorkerState {
        self.shared.lifecycle.state()
    }

    /// Current session state, updated as the agent moves through each attempt
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.session.subscribe()
    }

    pub fn session_state(&self) -> SessionState {
        self.shared.session.get()
    }

    /// Relay sessions that ran to completion
    pub fn sessions_completed(&self) -> u64 {
        self.shared.sessions_completed.load(Ordering::Relaxed)
    }

    /// Start the reconnect loop in the background
    pub fn start(&self) -> Result<(), AgentError> {
        let lifecycle = &self.shared.lifecycle;
        let token = lifecycle.begin(None)?;
        lifecycle.started()?;

        info!(
            "Agent {} serving {} through relay {} (receive port {})",
            self.shared.config.name,
            self.shared.config.local_addr,
            self.shared.config.relay_addr(),
            self.shared.config.receive_port
        );

        lifecycle.spawn(run_loop(self.shared.clone(), token));
        Ok(())
    }

    /// Stop the loop and wait until any active relay session has been torn down
    pub async fn shutdown(&self) {
        self.shared.lifecycle.shutdown().await;
        self.shared.session.close();
        info!("Agent {} stopped", self.shared.config.name);
    }
}

#[async_trait]
impl Worker for HostAgent {
    type Error = AgentError;

    fn state(&self) -> WorkerState {
        self.shared.lifecycle.state()
    }

    async fn start(&self) -> Result<(), AgentError> {
        HostAgent::start(self)
    }

    async fn stop(&self) {
        self.shutdown().await;
    }
}

async fn run_loop(shared: Arc<Shared>, token: CancellationToken) {
    let mut reconnect = ReconnectManager::new(shared.config.reconnect.clone());

    while !token.is_cancelled() {
        shared.session.reset();

        match attempt(&shared.config, &shared.session, &token).await {
            Ok(Attempt::Relayed(result)) => {
                shared.sessions_completed.fetch_add(1, Ordering::Relaxed);
                match result {
                    Ok(report) => info!(
                        bytes_to_desktop = report.a_to_b,
                        bytes_from_desktop = report.b_to_a,
                        "Relay session finished"
                    ),
                    Err(e) => warn!("Relay session ended: {}", e),
                }
                reconnect.reset();
                continue;
            }
            Ok(Attempt::Cancelled) => break,
            Err(e) => {
                shared.session.close();
                warn!("Registration attempt failed: {}", e);
            }
        }

        match reconnect.wait(&token).await {
            Ok(()) => {}
            Err(ReconnectError::Cancelled) => break,
            Err(ReconnectError::MaxAttemptsReached) => {
                error!(
                    "Giving up after {} failed attempts",
                    reconnect.attempt() - 1
                );
                shared.lifecycle.fault();
                break;
            }
        }
    }

    shared.session.close();
    debug!("Agent loop exited");
}

/// Register once, wait for a client and relay it
async fn attempt(
    config: &AgentConfig,
    session: &SessionStateCell,
    token: &CancellationToken,
) -> Result<Attempt, AgentError> {
    let relay_addr = config.relay_addr();
    debug!("Connecting to relay {}", relay_addr);

    let connected = tokio::select! {
        biased;
        _ = token.cancelled() => return Ok(Attempt::Cancelled),
        connected = tokio::time::timeout(config.io_timeout, TcpStream::connect(&relay_addr)) => connected,
    };
    let mut relay = match connected {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(AgentError::RelayConnect {
                addr: relay_addr,
                source,
            })
        }
        Err(_) => return Err(AgentError::Timeout("connecting to relay")),
    };
    let _ = relay.set_nodelay(true);

    let header = RegistrationHeader::new(config.name.clone(), config.receive_port)?;
    let written = tokio::select! {
        biased;
        _ = token.cancelled() => return Ok(Attempt::Cancelled),
        written = tokio::time::timeout(config.io_timeout, write_registration(&mut relay, &header)) => written,
    };
    match written {
        Ok(result) => result?,
        Err(_) => return Err(AgentError::Timeout("sending registration")),
    }
    session.advance(SessionState::Registered);
    info!(
        "Registered as {} for port {}, waiting for a client",
        config.name, config.receive_port
    );

    loop {
        let read = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(Attempt::Cancelled),
            read = tokio::time::timeout(config.io_timeout, read_control(&mut relay)) => read,
        };

        match read {
            Ok(Ok(Some(ControlMessage::Ping))) => {
                session.advance(SessionState::AwaitingTarget);
                trace!("PING from relay");
            }
            Ok(Ok(Some(ControlMessage::Connect))) => break,
            Ok(Ok(Some(ControlMessage::Error(message)))) => {
                error!("Relay rejected registration: {}", message);
                return Err(AgentError::Rejected(message));
            }
            Ok(Ok(None)) => return Err(AgentError::RelayClosed),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(AgentError::Timeout("waiting for relay keep-alive")),
        }
    }

    session.advance(SessionState::AwaitingTarget);
    session.advance(SessionState::Matched);
    info!("Client connected, opening {}", config.local_addr);

    let connected = tokio::select! {
        biased;
        _ = token.cancelled() => {
            session.close();
            return Ok(Attempt::Cancelled);
        }
        connected = tokio::time::timeout(
            config.io_timeout,
            TcpStream::connect(config.local_addr.as_str()),
        ) => connected,
    };
    let local = match connected {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(AgentError::LocalConnect {
                addr: config.local_addr.clone(),
                source,
            })
        }
        Err(_) => return Err(AgentError::Timeout("connecting to local desktop service")),
    };
    let _ = local.set_nodelay(true);

    session.advance(SessionState::Relaying);
    let pump = RelayPump::new(config.pump.clone()).with_labels("relay", "desktop");
    let result = pump.run(relay, local, token).await;
    session.close();

    if matches!(&result, Ok(report) if report.end == PumpEnd::Cancelled) {
        return Ok(Attempt::Cancelled);
    }
    Ok(Attempt::Relayed(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_name_format() {
        let name = default_agent_name();
        assert!(name.starts_with("Unknown-"));
        let suffix = &name["Unknown-".len()..];
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(validate_name(&name).is_ok());
    }

    #[test]
    fn test_new_rejects_invalid_name() {
        let blank = AgentConfig {
            name: "   ".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            HostAgent::new(blank),
            Err(AgentError::InvalidConfig(_))
        ));

        let long = AgentConfig {
            name: "x".repeat(33),
            ..Default::default()
        };
        assert!(HostAgent::new(long).is_err());
    }

    #[test]
    fn test_new_rejects_bad_local_address() {
        let config = AgentConfig {
            local_addr: "desktop".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            HostAgent::new(config),
            Err(AgentError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let agent = HostAgent::new(AgentConfig {
            name: "A".to_string(),
            relay_host: "127.0.0.1".to_string(),
            relay_port: 1,
            reconnect: ReconnectConfig {
                initial_backoff: Duration::from_millis(10),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();

        agent.start().unwrap();
        assert!(matches!(agent.start(), Err(AgentError::Lifecycle(_))));
        agent.shutdown().await;
        assert_eq!(agent.state(), WorkerState::Stopped);
        assert_eq!(agent.session_state(), SessionState::Closed);
    }
}
