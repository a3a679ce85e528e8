//! Relay side of the desktop relay
//!
//! The [`Broker`] accepts host registrations, the [`PortRegistry`] owns one
//! [`PortRendezvousServer`] per claimed receive port, and each server pairs public clients with
//! waiting host sessions in FIFO order through its [`RendezvousQueue`].

pub mod broker;
pub mod error;
pub mod listener;
pub mod queue;
pub mod registry;
pub mod rendezvous;
pub mod session;

pub use broker::{Broker, BrokerConfig};
pub use error::{BrokerError, RendezvousError};
pub use queue::{Admission, MatchedTarget, Offer, RelayGuard, RendezvousQueue};
pub use registry::PortRegistry;
pub use rendezvous::{PortRendezvousServer, RendezvousConfig};
pub use session::HostSession;
