//! Relay Wire Protocol Definitions
//!
//! This crate defines the registration header, the single-byte control opcodes and the
//! framing rules shared by the relay broker and the host agent.
//!
//! Every registration frame starts with a little-endian `i32` holding the total frame length
//! (prefix included). After a successful handshake the relay only sends single-byte opcodes,
//! with `ERROR` carrying a length-prefixed UTF-8 message.

pub mod codec;
pub mod error;
pub mod messages;

pub use codec::{read_control, read_registration, write_control, write_registration};
pub use error::ProtocolError;
pub use messages::{ControlMessage, Opcode, PortRange, RegistrationHeader};

/// Protocol version
pub const PROTOCOL_VERSION: i32 = 1;

/// Maximum registration frame size, length prefix included
pub const MAX_REGISTRATION_FRAME: usize = 1024;

/// Maximum size of the message carried by an `ERROR` opcode (64KB)
pub const MAX_ERROR_MESSAGE: usize = 64 * 1024;

/// Maximum agent name length, in characters
pub const MAX_NAME_LEN: usize = 32;

/// Default registration port of the broker
pub const DEFAULT_HOST_PORT: u16 = 21000;

/// Default first claimable receive port
pub const DEFAULT_REMOTE_PORT_START: u16 = 21001;

/// Default last claimable receive port
pub const DEFAULT_REMOTE_PORT_END: u16 = 21999;
