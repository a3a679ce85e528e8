//! Relay errors

use deskrelay_connection::{LifecycleError, PumpError};
use deskrelay_proto::{PortRange, ProtocolError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RendezvousError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Rendezvous server for port {port} is shutting down")]
    Retired { port: u16 },

    #[error("Rendezvous server for port {port} was stopped while starting")]
    Cancelled { port: u16 },

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Invalid receive port range {0}")]
    InvalidPortRange(PortRange),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),

    #[error("Relay error: {0}")]
    Pump(#[from] PumpError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("Host disconnected while waiting for a client")]
    HostDisconnected,
}

impl BrokerError {
    /// Reason sent to the host in an `ERROR` frame, if this error warrants one
    pub fn rejection(&self) -> Option<String> {
        match self {
            BrokerError::Protocol(e) if e.is_violation() => Some(e.to_string()),
            BrokerError::Rendezvous(RendezvousError::BindError { port, reason, .. }) => {
                Some(format!("Port {} is unavailable: {}", port, reason))
            }
            BrokerError::Rendezvous(RendezvousError::Cancelled { .. }) => None,
            BrokerError::Rendezvous(e) => Some(e.to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_for_violations_only() {
        let mismatch = BrokerError::from(ProtocolError::VersionMismatch {
            received: 2,
            expected: 1,
        });
        assert_eq!(
            mismatch.rejection().as_deref(),
            Some("Version mismatch (got 2, expected 1)")
        );

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(BrokerError::from(ProtocolError::Io(io)).rejection().is_none());
        assert!(BrokerError::HostDisconnected.rejection().is_none());
        assert!(BrokerError::from(RendezvousError::Cancelled { port: 21001 })
            .rejection()
            .is_none());
    }

    #[test]
    fn test_bind_rejection_is_single_line() {
        let err = BrokerError::from(RendezvousError::BindError {
            address: "0.0.0.0".to_string(),
            port: 21001,
            reason: "Address in use".to_string(),
        });
        let reason = err.rejection().unwrap();
        assert_eq!(reason, "Port 21001 is unavailable: Address in use");
    }
}
