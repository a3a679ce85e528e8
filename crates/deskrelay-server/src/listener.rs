//! Listener binding with retry on `AddrInUse`

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Bind `addr`, retrying while the port is still in use (e.g. lingering in TIME_WAIT)
pub async fn bind_with_retry(
    addr: SocketAddr,
    attempts: u32,
    delay: Duration,
) -> std::io::Result<TcpListener> {
    let attempts = attempts.max(1);
    let mut attempt = 1;

    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                if attempt > 1 {
                    info!(
                        "Successfully bound to {} on attempt {}/{}",
                        addr, attempt, attempts
                    );
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < attempts => {
                warn!(
                    "Port {} is in use (attempt {}/{}, may be in TIME_WAIT state), retrying in {:?}...",
                    addr.port(),
                    attempt,
                    attempts,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
