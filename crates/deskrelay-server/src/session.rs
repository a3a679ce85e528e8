//! Host sessions tracked by the broker

use chrono::{DateTime, Utc};
use deskrelay_connection::{SessionState, SessionStateCell};
use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

/// One registered host connection
#[derive(Debug)]
pub struct HostSession {
    id: Uuid,
    name: String,
    receive_port: u16,
    peer_addr: SocketAddr,
    registered_at: DateTime<Utc>,
    state: SessionStateCell,
}

impl HostSession {
    pub fn new(name: impl Into<String>, receive_port: u16, peer_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            receive_port,
            peer_addr,
            registered_at: Utc::now(),
            state: SessionStateCell::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn receive_port(&self) -> u16 {
        self.receive_port
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn advance(&self, next: SessionState) -> bool {
        self.state.advance(next)
    }

    pub fn close(&self) {
        self.state.close();
    }
}

impl fmt::Display for HostSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) on port {}", self.name, self.peer_addr, self.receive_port)
    }
}
