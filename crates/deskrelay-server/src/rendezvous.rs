//! Per-port rendezvous server
//!
//! Listens on one receive port and pairs each accepted public client with the oldest pending
//! host session for that port. A client that no session claims within the match window is
//! closed.

use crate::error::RendezvousError;
use crate::listener::bind_with_retry;
use crate::queue::{Admission, Offer, RendezvousQueue};
use crate::session::HostSession;
use async_trait::async_trait;
use deskrelay_connection::{CancellationToken, Lifecycle, TaskTracker, Worker, WorkerState};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default time a public client may wait for a host session
pub const DEFAULT_MATCH_WINDOW: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct RendezvousConfig {
    pub bind_host: IpAddr,
    pub match_window: Duration,
    pub bind_attempts: u32,
    pub bind_retry_delay: Duration,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            match_window: DEFAULT_MATCH_WINDOW,
            bind_attempts: 3,
            bind_retry_delay: Duration::from_secs(1),
        }
    }
}

/// Rendezvous listener for one receive port
pub struct PortRendezvousServer {
    port: u16,
    config: RendezvousConfig,
    queue: Arc<RendezvousQueue<TcpStream>>,
    lifecycle: Lifecycle,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl PortRendezvousServer {
    pub fn new(port: u16, config: RendezvousConfig) -> Self {
        let queue = Arc::new(RendezvousQueue::new(port, config.match_window));
        Self {
            port,
            config,
            queue,
            lifecycle: Lifecycle::new(format!("rendezvous:{}", port)),
            local_addr: Mutex::new(None),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> WorkerState {
        self.lifecycle.state()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn queue(&self) -> &Arc<RendezvousQueue<TcpStream>> {
        &self.queue
    }

    /// Bind the port and start accepting public clients
    ///
    /// Tasks observe a child of `parent` when one is given. Returns once listening.
    pub async fn start_with_parent(
        &self,
        parent: Option<&CancellationToken>,
    ) -> Result<SocketAddr, RendezvousError> {
        let token = self.lifecycle.begin(parent)?;
        let bind_addr = SocketAddr::new(self.config.bind_host, self.port);

        let bound = tokio::select! {
            biased;
            _ = token.cancelled() => {
                self.lifecycle.shutdown().await;
                return Err(RendezvousError::Cancelled { port: self.port });
            }
            bound = bind_with_retry(
                bind_addr,
                self.config.bind_attempts,
                self.config.bind_retry_delay,
            ) => bound,
        };

        let listener = match bound {
            Ok(listener) => listener,
            Err(e) => {
                self.lifecycle.fault();
                return Err(RendezvousError::BindError {
                    address: bind_addr.ip().to_string(),
                    port: self.port,
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

        self.queue.reopen();
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(addr);
        self.lifecycle.started()?;

        info!(port = self.port, "Rendezvous server listening on {}", addr);

        let tracker = self.lifecycle.tracker();
        self.lifecycle.spawn(accept_loop(
            listener,
            self.queue.clone(),
            self.config.match_window,
            token,
            tracker,
        ));

        Ok(addr)
    }

    /// Queue a host session for this port
    pub fn add_connection(
        &self,
        session: Arc<HostSession>,
    ) -> Result<Admission<TcpStream>, RendezvousError> {
        self.queue.add_connection(session)
    }

    pub fn remove_connection(&self, session_id: Uuid) -> bool {
        self.queue.remove_connection(session_id)
    }

    pub fn pending_len(&self) -> usize {
        self.queue.pending_len()
    }

    /// Idle retirement check, see [`RendezvousQueue::try_retire`]
    pub fn try_retire(&self, idle: Duration) -> bool {
        self.queue.try_retire(idle)
    }

    /// Close the listener and every parked client, waiting for all tasks to exit
    pub async fn shutdown(&self) {
        self.queue.close();
        self.lifecycle.shutdown().await;
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = None;
        debug!(port = self.port, "Rendezvous server stopped");
    }
}

#[async_trait]
impl Worker for PortRendezvousServer {
    type Error = RendezvousError;

    fn state(&self) -> WorkerState {
        self.lifecycle.state()
    }

    async fn start(&self) -> Result<(), RendezvousError> {
        self.start_with_parent(None).await.map(|_| ())
    }

    async fn stop(&self) {
        self.shutdown().await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    queue: Arc<RendezvousQueue<TcpStream>>,
    match_window: Duration,
    token: CancellationToken,
    tracker: TaskTracker,
) {
    let port = queue.port();

    loop {
        let accepted = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                debug!(port, "Public client connected from {}", peer_addr);
                tracker.spawn(serve_client(
                    stream,
                    peer_addr,
                    queue.clone(),
                    match_window,
                    token.clone(),
                ));
            }
            Err(e) => {
                error!(port, "Failed to accept public connection: {}", e);
            }
        }
    }

    debug!(port, "Rendezvous accept loop exited");
}

async fn serve_client(
    stream: TcpStream,
    peer_addr: SocketAddr,
    queue: Arc<RendezvousQueue<TcpStream>>,
    match_window: Duration,
    token: CancellationToken,
) {
    let port = queue.port();

    match queue.offer_client(stream) {
        Offer::Matched(session_id) => {
            info!(port, %session_id, "Public client {} matched", peer_addr);
        }
        Offer::Closed => {
            debug!(port, "Rejected public client {}: port is closing", peer_addr);
        }
        Offer::Queued { client_id, claimed } => {
            debug!(port, client_id, "No host session available yet, parking {}", peer_addr);

            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    queue.withdraw_client(client_id);
                }
                result = tokio::time::timeout(match_window, claimed) => match result {
                    Ok(Ok(())) => {
                        info!(port, client_id, "Parked public client {} matched", peer_addr);
                    }
                    Ok(Err(_)) => {
                        debug!(port, client_id, "Queue closed while client {} waited", peer_addr);
                    }
                    Err(_) => {
                        if queue.withdraw_client(client_id).is_some() {
                            warn!(
                                port,
                                "No host session within {:?}, closing public client {}",
                                match_window,
                                peer_addr
                            );
                        }
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn local_config() -> RendezvousConfig {
        RendezvousConfig {
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            match_window: Duration::from_millis(200),
            bind_attempts: 1,
            bind_retry_delay: Duration::from_millis(10),
        }
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unmatched_client_closed_after_window() {
        let port = free_port().await;
        let server = PortRendezvousServer::new(port, local_config());
        let addr = server.start_with_parent(None).await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("client should be closed within the window");
        assert!(matches!(read, Ok(0) | Err(_)));

        server.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bind_conflict_faults() {
        let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = held.local_addr().unwrap().port();

        let server = PortRendezvousServer::new(port, local_config());
        let result = server.start_with_parent(None).await;

        assert!(matches!(result, Err(RendezvousError::BindError { .. })));
        assert_eq!(server.state(), WorkerState::Faulted);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bind_retry_stops_on_cancel() {
        let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = held.local_addr().unwrap().port();
        let server = PortRendezvousServer::new(
            port,
            RendezvousConfig {
                bind_attempts: 10,
                bind_retry_delay: Duration::from_secs(1),
                ..local_config()
            },
        );

        let parent = CancellationToken::new();
        let cancel = parent.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_millis(500),
            server.start_with_parent(Some(&parent)),
        )
        .await
        .expect("start should return promptly once cancelled");

        assert!(matches!(result, Err(RendezvousError::Cancelled { .. })));
        assert_eq!(server.state(), WorkerState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_restart_on_same_port() {
        let port = free_port().await;
        let server = PortRendezvousServer::new(port, local_config());

        server.start_with_parent(None).await.unwrap();
        server.shutdown().await;
        assert_eq!(server.state(), WorkerState::Stopped);
        assert!(server.local_addr().is_none());

        server.start_with_parent(None).await.unwrap();
        assert!(server.is_running());
        server.shutdown().await;
    }
}
