//! Registration broker
//!
//! Accepts host agents on the registration port. Each connection gets its own task that reads
//! and validates the registration header, claims the rendezvous server for the requested
//! receive port and keeps the host alive with `PING` until a public client arrives. On a match
//! the host receives `CONNECT` and a [`RelayPump`] joins it to the client.

use crate::error::{BrokerError, RendezvousError};
use crate::queue::{Admission, MatchedTarget};
use crate::registry::PortRegistry;
use crate::rendezvous::{PortRendezvousServer, RendezvousConfig};
use crate::session::HostSession;
use async_trait::async_trait;
use chrono::Utc;
use deskrelay_connection::{
    CancellationToken, Lifecycle, PumpConfig, RelayPump, SessionState, TaskTracker, Worker,
    WorkerState,
};
use deskrelay_proto::{
    read_registration, write_control, ControlMessage, PortRange, ProtocolError,
    DEFAULT_HOST_PORT,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

/// How often a claim is retried when it races with idle retirement
const ADMIT_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Registration listener address
    pub bind_addr: SocketAddr,
    /// Receive ports hosts may claim
    pub port_range: PortRange,
    /// Bound on header reads and control writes
    pub io_timeout: Duration,
    /// Keep-alive interval while a host waits for a client
    pub ping_interval: Duration,
    pub pump: PumpConfig,
    pub rendezvous: RendezvousConfig,
    /// Rendezvous servers idle this long are retired
    pub idle_timeout: Duration,
    pub eviction_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_HOST_PORT)),
            port_range: PortRange::default(),
            io_timeout: Duration::from_secs(3),
            ping_interval: Duration::from_secs(1),
            pump: PumpConfig::default(),
            rendezvous: RendezvousConfig::default(),
            idle_timeout: Duration::from_secs(300),
            eviction_interval: Duration::from_secs(30),
        }
    }
}

/// Shared state handed to every connection task
#[derive(Clone)]
struct HandlerContext {
    config: Arc<BrokerConfig>,
    registry: Arc<PortRegistry>,
    token: CancellationToken,
    sessions_relayed: Arc<AtomicU64>,
}

pub struct Broker {
    config: Arc<BrokerConfig>,
    registry: Arc<PortRegistry>,
    lifecycle: Lifecycle,
    local_addr: Mutex<Option<SocketAddr>>,
    sessions_relayed: Arc<AtomicU64>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let registry = Arc::new(PortRegistry::new(config.rendezvous.clone()));
        Self {
            config: Arc::new(config),
            registry,
            lifecycle: Lifecycle::new("broker"),
            local_addr: Mutex::new(None),
            sessions_relayed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PortRegistry> {
        &self.registry
    }

    pub fn state(&self) -> WorkerState {
        self.lifecycle.state()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live host sessions waiting on `port`
    pub fn pending_sessions(&self, port: u16) -> usize {
        self.registry
            .get(port)
            .map(|server| server.pending_len())
            .unwrap_or(0)
    }

    /// Ports with a running rendezvous server
    pub fn active_ports(&self) -> Vec<u16> {
        self.registry.ports()
    }

    /// Relay sessions that ran to completion since construction
    pub fn sessions_relayed(&self) -> u64 {
        self.sessions_relayed.load(Ordering::Relaxed)
    }

    /// Bind the registration port and start serving; returns the bound address
    pub async fn start(&self) -> Result<SocketAddr, BrokerError> {
        let range = self.config.port_range;
        if range.is_empty() {
            return Err(BrokerError::InvalidPortRange(range));
        }

        let token = self.lifecycle.begin(None)?;

        let listener = match TcpListener::bind(self.config.bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.lifecycle.fault();
                return Err(BrokerError::BindError {
                    address: self.config.bind_addr.ip().to_string(),
                    port: self.config.bind_addr.port(),
                    reason: e.to_string(),
                });
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.lifecycle.fault();
                return Err(e.into());
            }
        };

        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(addr);
        self.lifecycle.started()?;

        info!(
            "Relay broker listening on {} (receive ports {})",
            addr, self.config.port_range
        );

        let context = HandlerContext {
            config: self.config.clone(),
            registry: self.registry.clone(),
            token: token.clone(),
            sessions_relayed: self.sessions_relayed.clone(),
        };
        let tracker = self.lifecycle.tracker();
        self.lifecycle.spawn(accept_loop(listener, context, tracker));
        self.lifecycle.spawn(janitor(
            self.registry.clone(),
            self.config.idle_timeout,
            self.config.eviction_interval,
            token,
        ));

        Ok(addr)
    }

    /// Cancel every task, wait for all of them, then stop the rendezvous servers
    pub async fn shutdown(&self) {
        info!("Stopping relay broker");
        self.lifecycle.shutdown().await;
        self.registry.shutdown().await;
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = None;
        info!(
            sessions_relayed = self.sessions_relayed(),
            "Relay broker stopped"
        );
    }
}

#[async_trait]
impl Worker for Broker {
    type Error = BrokerError;

    fn state(&self) -> WorkerState {
        self.lifecycle.state()
    }

    async fn start(&self) -> Result<(), BrokerError> {
        Broker::start(self).await.map(|_| ())
    }

    async fn stop(&self) {
        self.shutdown().await;
    }
}

async fn accept_loop(listener: TcpListener, context: HandlerContext, tracker: TaskTracker) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = context.token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                debug!("Accepted host connection from {}", peer_addr);
                let context = context.clone();
                tracker.spawn(async move {
                    if let Err(e) = handle_host(stream, peer_addr, &context).await {
                        warn!("Host connection from {} ended: {}", peer_addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept host connection: {}", e);
            }
        }
    }

    debug!("Broker accept loop exited");
}

async fn janitor(
    registry: Arc<PortRegistry>,
    idle_timeout: Duration,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let retired = registry.evict_idle(idle_timeout).await;
                if retired > 0 {
                    debug!("Janitor retired {} idle rendezvous servers", retired);
                }
            }
        }
    }
}

/// Send `ERROR` with `message` and close
async fn reject(stream: &mut TcpStream, message: String, io_timeout: Duration) {
    let error = ControlMessage::Error(message);
    match tokio::time::timeout(io_timeout, write_control(stream, &error)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Failed to deliver rejection: {}", e),
        Err(_) => debug!("Timed out delivering rejection"),
    }
    let _ = stream.shutdown().await;
}

/// Drain bytes the host already sent so closing ends with FIN rather than RST
fn discard_unread(stream: &mut TcpStream) {
    let mut buf = [0u8; 1024];
    loop {
        match stream.try_read(&mut buf) {
            Ok(0) => break,
            Ok(n) => trace!("Discarded {} unread bytes from host", n),
            Err(_) => break,
        }
    }
}

async fn handle_host(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    context: &HandlerContext,
) -> Result<(), BrokerError> {
    let io_timeout = context.config.io_timeout;

    let read = tokio::select! {
        biased;
        _ = context.token.cancelled() => return Ok(()),
        read = tokio::time::timeout(io_timeout, read_registration(&mut stream)) => read,
    };

    let header = match read {
        Ok(Ok(header)) => header,
        Ok(Err(e)) => {
            let err = BrokerError::from(e);
            if let Some(reason) = err.rejection() {
                warn!("Rejecting registration from {}: {}", peer_addr, reason);
                reject(&mut stream, reason, io_timeout).await;
            }
            return Err(err);
        }
        Err(_) => return Err(BrokerError::Timeout("registration")),
    };

    if let Err(e) = header.validate(&context.config.port_range) {
        let err = BrokerError::from(e);
        if let Some(reason) = err.rejection() {
            warn!(
                "Rejecting registration from {} ({}): {}",
                peer_addr, header.name, reason
            );
            reject(&mut stream, reason, io_timeout).await;
        }
        return Err(err);
    }

    let session = Arc::new(HostSession::new(
        header.name.clone(),
        header.port(),
        peer_addr,
    ));
    session.advance(SessionState::Registered);
    info!(
        session_id = %session.id(),
        port = session.receive_port(),
        "Host {} registered from {}",
        session.name(),
        peer_addr
    );

    session.advance(SessionState::AwaitingTarget);
    let (server, admission) = match admit(context, &session).await {
        Ok(admitted) => admitted,
        Err(_) if context.token.is_cancelled() => {
            session.close();
            debug!(session_id = %session.id(), "Host session cancelled while claiming");
            return Ok(());
        }
        Err(err) => {
            session.close();
            if let Some(reason) = err.rejection() {
                reject(&mut stream, reason, io_timeout).await;
            }
            return Err(err);
        }
    };

    let target = match admission {
        Admission::Matched(target) => target,
        Admission::Waiting(target_rx) => {
            let waited =
                wait_for_target(&mut stream, session.receive_port(), target_rx, context).await;
            if !matches!(waited, Ok(Some(_))) {
                server.remove_connection(session.id());
                session.close();
            }
            match waited {
                Ok(Some(target)) => target,
                Ok(None) => {
                    debug!(session_id = %session.id(), "Host session cancelled while waiting");
                    return Ok(());
                }
                Err(e) => {
                    if let Some(reason) = e.rejection() {
                        warn!(
                            session_id = %session.id(),
                            "Rejecting host {}: {}", session.name(), reason
                        );
                        discard_unread(&mut stream);
                        reject(&mut stream, reason, io_timeout).await;
                    }
                    return Err(e);
                }
            }
        }
    };

    relay(stream, target, &session, context).await
}

/// Claim the port's rendezvous server and queue the session
async fn admit(
    context: &HandlerContext,
    session: &Arc<HostSession>,
) -> Result<(Arc<PortRendezvousServer>, Admission<TcpStream>), BrokerError> {
    let port = session.receive_port();

    for _ in 0..ADMIT_ATTEMPTS {
        let server = context.registry.claim(port, &context.token).await?;
        match server.add_connection(session.clone()) {
            Ok(admission) => return Ok((server, admission)),
            Err(RendezvousError::Retired { .. }) => {
                // Lost a race with idle retirement, claim a fresh server
                context.registry.release(&server);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(RendezvousError::Retired { port }.into())
}

/// Ping the host until a client is matched, the host goes away or the broker stops
///
/// Returns Ok(None) on cancellation.
async fn wait_for_target(
    stream: &mut TcpStream,
    port: u16,
    mut target_rx: oneshot::Receiver<MatchedTarget<TcpStream>>,
    context: &HandlerContext,
) -> Result<Option<MatchedTarget<TcpStream>>, BrokerError> {
    let config = &context.config;
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + config.ping_interval,
        config.ping_interval,
    );
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut early = [0u8; 1];

    loop {
        tokio::select! {
            biased;
            _ = context.token.cancelled() => return Ok(None),
            target = &mut target_rx => {
                return match target {
                    Ok(target) => Ok(Some(target)),
                    Err(_) => Err(RendezvousError::Retired { port }.into()),
                };
            }
            _ = ticker.tick() => {
                match tokio::time::timeout(
                    config.io_timeout,
                    write_control(stream, &ControlMessage::Ping),
                )
                .await
                {
                    Ok(Ok(())) => trace!("Sent PING"),
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => return Err(BrokerError::Timeout("ping")),
                }
            }
            peeked = stream.peek(&mut early) => {
                return match peeked {
                    Ok(0) => Err(BrokerError::HostDisconnected),
                    Ok(_) => Err(ProtocolError::MalformedFrame(
                        "unexpected data from host before CONNECT".to_string(),
                    )
                    .into()),
                    Err(e) => Err(e.into()),
                };
            }
        }
    }
}

/// Tell the host to connect through and pump until either side ends
async fn relay(
    mut stream: TcpStream,
    target: MatchedTarget<TcpStream>,
    session: &Arc<HostSession>,
    context: &HandlerContext,
) -> Result<(), BrokerError> {
    let MatchedTarget {
        stream: client,
        guard: _guard,
    } = target;

    session.advance(SessionState::Matched);

    let written = tokio::select! {
        biased;
        _ = context.token.cancelled() => {
            session.close();
            return Ok(());
        }
        written = tokio::time::timeout(
            context.config.io_timeout,
            write_control(&mut stream, &ControlMessage::Connect),
        ) => written,
    };

    match written {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            session.close();
            return Err(e.into());
        }
        Err(_) => {
            session.close();
            return Err(BrokerError::Timeout("connect"));
        }
    }

    session.advance(SessionState::Relaying);
    info!(
        session_id = %session.id(),
        port = session.receive_port(),
        waited_ms = (Utc::now() - session.registered_at()).num_milliseconds(),
        "Relaying host {} to public client",
        session.name()
    );

    let pump = RelayPump::new(context.config.pump.clone())
        .with_labels(format!("host:{}", session.name()), "client");
    let result = pump.run(stream, client, &context.token).await;
    session.close();

    let report = result?;
    context.sessions_relayed.fetch_add(1, Ordering::Relaxed);
    info!(
        session_id = %session.id(),
        bytes_from_host = report.a_to_b,
        bytes_from_client = report.b_to_a,
        "Relay session for {} finished",
        session.name()
    );
    Ok(())
}
