//! Protocol errors

use thiserror::Error;

/// Errors raised while framing, parsing or validating protocol messages
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Version mismatch (got {received}, expected {expected})")]
    VersionMismatch { received: i32, expected: i32 },

    #[error("{port} is not an available port, use a port between {start} and {end}")]
    PortOutOfRange { port: i32, start: u16, end: u16 },

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Unknown opcode: {0}")]
    UnknownOpcode(u8),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether the peer violated the protocol, as opposed to the transport failing.
    ///
    /// Violations are answered with an `ERROR` frame before the connection is closed.
    pub fn is_violation(&self) -> bool {
        !matches!(self, ProtocolError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_classification() {
        assert!(ProtocolError::UnknownOpcode(9).is_violation());
        assert!(ProtocolError::FrameTooLarge(4096).is_violation());
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(!ProtocolError::Io(io).is_violation());
    }

    #[test]
    fn test_port_out_of_range_message() {
        let err = ProtocolError::PortOutOfRange {
            port: 80,
            start: 21001,
            end: 21999,
        };
        let msg = err.to_string();
        assert!(msg.contains("80"));
        assert!(msg.contains("21001"));
        assert!(msg.contains("21999"));
    }
}
