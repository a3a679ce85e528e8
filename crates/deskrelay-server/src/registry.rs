//! Receive port registry
//!
//! Maps each claimed receive port to its [`PortRendezvousServer`]. Servers are created lazily on
//! the first claim; concurrent claims of one port wait on the same initialization and converge
//! on one instance.

use crate::error::RendezvousError;
use crate::rendezvous::{PortRendezvousServer, RendezvousConfig};
use deskrelay_connection::CancellationToken;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

type ServerCell = Arc<OnceCell<Arc<PortRendezvousServer>>>;

pub struct PortRegistry {
    config: RendezvousConfig,
    servers: Mutex<HashMap<u16, ServerCell>>,
}

impl PortRegistry {
    pub fn new(config: RendezvousConfig) -> Self {
        Self {
            config,
            servers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u16, ServerCell>> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the running server for `port`, starting one if needed
    ///
    /// A failed start leaves no entry behind, so a later claim tries again.
    pub async fn claim(
        &self,
        port: u16,
        parent: &CancellationToken,
    ) -> Result<Arc<PortRendezvousServer>, RendezvousError> {
        let cell = self.lock().entry(port).or_default().clone();

        let result = cell
            .get_or_try_init(|| async {
                let server = Arc::new(PortRendezvousServer::new(port, self.config.clone()));
                server.start_with_parent(Some(parent)).await?;
                Ok::<_, RendezvousError>(server)
            })
            .await;

        match result {
            Ok(server) => Ok(self.link(port, &cell, server.clone()).await),
            Err(e) => {
                self.remove_cell(port, &cell);
                Err(e)
            }
        }
    }

    /// Make sure the slot for `port` points at `cell` once it holds a started server
    ///
    /// A waiter may initialize a cell that a failed attempt already unlinked, while a later
    /// claim put a fresh cell in its place. A fresh cell still starting is replaced, since its
    /// bind cannot succeed while `server` holds the port. If the slot already holds another
    /// started server, `server` is stopped and the registered one returned.
    async fn link(
        &self,
        port: u16,
        cell: &ServerCell,
        server: Arc<PortRendezvousServer>,
    ) -> Arc<PortRendezvousServer> {
        let registered = {
            let mut servers = self.lock();
            match servers.get(&port).and_then(|current| current.get().cloned()) {
                Some(current) if !Arc::ptr_eq(&current, &server) => Some(current),
                Some(_) => None,
                None => {
                    servers.insert(port, cell.clone());
                    None
                }
            }
        };

        match registered {
            Some(current) => {
                warn!(port, "Port claimed twice, stopping the duplicate rendezvous server");
                server.shutdown().await;
                current
            }
            None => server,
        }
    }

    fn remove_cell(&self, port: u16, cell: &ServerCell) {
        let mut servers = self.lock();
        if servers
            .get(&port)
            .is_some_and(|current| Arc::ptr_eq(current, cell))
        {
            servers.remove(&port);
        }
    }

    /// Forget `server` if it is still the one registered for its port
    pub fn release(&self, server: &Arc<PortRendezvousServer>) -> bool {
        let mut servers = self.lock();
        let registered = servers
            .get(&server.port())
            .and_then(|cell| cell.get())
            .is_some_and(|current| Arc::ptr_eq(current, server));
        if registered {
            servers.remove(&server.port());
        }
        registered
    }

    pub fn get(&self, port: u16) -> Option<Arc<PortRendezvousServer>> {
        self.lock().get(&port).and_then(|cell| cell.get().cloned())
    }

    /// Ports with a started server, ascending
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .lock()
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(port, _)| *port)
            .collect();
        ports.sort_unstable();
        ports
    }

    fn started(&self) -> Vec<Arc<PortRendezvousServer>> {
        self.lock()
            .values()
            .filter_map(|cell| cell.get().cloned())
            .collect()
    }

    /// Retire and stop every server idle for at least `idle`
    pub async fn evict_idle(&self, idle: Duration) -> usize {
        let retired: Vec<_> = self
            .started()
            .into_iter()
            .filter(|server| server.try_retire(idle))
            .collect();

        for server in &retired {
            self.release(server);
        }

        join_all(retired.iter().map(|server| server.shutdown())).await;

        for server in &retired {
            info!(port = server.port(), "Retired idle rendezvous server");
        }
        retired.len()
    }

    /// Stop every server and clear the registry
    pub async fn shutdown(&self) {
        let servers: Vec<_> = self
            .lock()
            .drain()
            .filter_map(|(_, cell)| cell.get().cloned())
            .collect();

        debug!("Stopping {} rendezvous servers", servers.len());
        join_all(servers.iter().map(|server| server.shutdown())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskrelay_connection::WorkerState;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::TcpListener;

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
    async fn test_concurrent_claims_converge() {
        let registry = Arc::new(PortRegistry::new(local_config()));
        let token = CancellationToken::new();
        let port = free_port().await;

        let claims = (0..8).map(|_| {
            let registry = registry.clone();
            let token = token.clone();
            tokio::spawn(async move { registry.claim(port, &token).await.unwrap() })
        });
        let servers: Vec<_> = join_all(claims)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        assert!(servers.iter().all(|s| Arc::ptr_eq(s, &servers[0])));
        assert_eq!(registry.ports(), vec![port]);

        registry.shutdown().await;
        assert!(registry.ports().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_claim_leaves_no_entry() {
        let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = held.local_addr().unwrap().port();
        let registry = PortRegistry::new(local_config());
        let token = CancellationToken::new();

        assert!(registry.claim(port, &token).await.is_err());
        assert!(registry.get(port).is_none());

        drop(held);
        assert!(registry.claim(port, &token).await.is_ok());
        registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_started_cell_replaces_stale_slot() {
        let registry = PortRegistry::new(local_config());
        let port = free_port().await;

        let server = Arc::new(PortRendezvousServer::new(port, local_config()));
        server.start_with_parent(None).await.unwrap();
        let cell: ServerCell = Arc::new(OnceCell::new_with(Some(server.clone())));

        // A later claim left an empty cell in the slot while this one was starting
        registry.lock().insert(port, ServerCell::default());

        let linked = registry.link(port, &cell, server.clone()).await;
        assert!(Arc::ptr_eq(&linked, &server));
        assert!(registry
            .get(port)
            .is_some_and(|current| Arc::ptr_eq(&current, &server)));
        assert_eq!(registry.ports(), vec![port]);

        registry.shutdown().await;
        assert!(registry.ports().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_duplicate_server_is_stopped() {
        let registry = PortRegistry::new(local_config());
        let token = CancellationToken::new();
        let port = free_port().await;
        let registered = registry.claim(port, &token).await.unwrap();

        let duplicate = Arc::new(PortRendezvousServer::new(free_port().await, local_config()));
        duplicate.start_with_parent(None).await.unwrap();
        let cell: ServerCell = Arc::new(OnceCell::new_with(Some(duplicate.clone())));

        let linked = registry.link(port, &cell, duplicate.clone()).await;
        assert!(Arc::ptr_eq(&linked, &registered));
        assert_eq!(duplicate.state(), WorkerState::Stopped);

        registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_evict_idle_releases_port() {
        let registry = PortRegistry::new(local_config());
        let token = CancellationToken::new();
        let port = free_port().await;

        let first = registry.claim(port, &token).await.unwrap();
        assert_eq!(registry.evict_idle(Duration::from_secs(3600)).await, 0);
        assert_eq!(registry.evict_idle(Duration::ZERO).await, 1);
        assert!(registry.ports().is_empty());

        // The port is free again and a new claim gets a fresh server
        let second = registry.claim(port, &token).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        registry.shutdown().await;
    }
}
