//! Host agent
//!
//! Runs next to the desktop service. Registers with the relay broker, waits for a public client
//! and then pumps bytes between the relay connection and the local desktop port.

pub mod agent;
pub mod reconnect;

pub use agent::{default_agent_name, AgentConfig, AgentError, HostAgent};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
