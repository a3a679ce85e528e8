//! Protocol message types

use crate::codec::{get_prefixed_str, put_prefixed_str};
use crate::error::ProtocolError;
use crate::{MAX_ERROR_MESSAGE, MAX_NAME_LEN, MAX_REGISTRATION_FRAME, PROTOCOL_VERSION};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Single-byte control opcodes sent after the registration handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Liveness probe, no payload
    Ping = 0,
    /// A public client has been matched, no payload
    Connect = 1,
    /// Fatal error, followed by `len:i32` and a UTF-8 message
    Error = 2,
}

impl TryFrom<u8> for Opcode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Opcode::Ping),
            1 => Ok(Opcode::Connect),
            2 => Ok(Opcode::Error),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

/// Control signal exchanged on an established registration connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Ping,
    Connect,
    Error(String),
}

impl ControlMessage {
    pub fn opcode(&self) -> Opcode {
        match self {
            ControlMessage::Ping => Opcode::Ping,
            ControlMessage::Connect => Opcode::Connect,
            ControlMessage::Error(_) => Opcode::Error,
        }
    }

    /// Encode to wire bytes
    ///
    /// Format: `[opcode: u8]` or, for errors, `[2][len: i32 LE][utf8 message]`
    pub fn encode(&self) -> Bytes {
        match self {
            ControlMessage::Error(message) => {
                let bytes = message.as_bytes();
                let mut buf = BytesMut::with_capacity(5 + bytes.len());
                buf.put_u8(Opcode::Error as u8);
                buf.put_i32_le(bytes.len() as i32);
                buf.extend_from_slice(bytes);
                buf.freeze()
            }
            other => Bytes::copy_from_slice(&[other.opcode() as u8]),
        }
    }

    /// Decode one control message from the front of `buf`
    ///
    /// Returns Ok(Some(message)) if a complete message was decoded,
    /// Ok(None) if more data is needed,
    /// Err on error
    pub fn decode(buf: &mut BytesMut) -> Result<Option<ControlMessage>, ProtocolError> {
        match Self::missing_bytes(buf)? {
            Some(0) => {}
            _ => return Ok(None),
        }

        match Opcode::try_from(buf[0])? {
            Opcode::Ping => {
                buf.advance(1);
                Ok(Some(ControlMessage::Ping))
            }
            Opcode::Connect => {
                buf.advance(1);
                Ok(Some(ControlMessage::Connect))
            }
            Opcode::Error => {
                let mut length_bytes = [0u8; 4];
                length_bytes.copy_from_slice(&buf[1..5]);
                let length = error_message_len(i32::from_le_bytes(length_bytes))?;
                buf.advance(5);
                let message = buf.split_to(length);
                let message = String::from_utf8(message.to_vec()).map_err(|_| {
                    ProtocolError::MalformedFrame("error message is not valid UTF-8".to_string())
                })?;
                Ok(Some(ControlMessage::Error(message)))
            }
        }
    }

    /// Bytes still needed before the message at the front of `buf` is complete
    ///
    /// None while the opcode itself has not arrived. Trailing bytes beyond the first message are
    /// not counted.
    pub(crate) fn missing_bytes(buf: &[u8]) -> Result<Option<usize>, ProtocolError> {
        let Some(&opcode) = buf.first() else {
            return Ok(None);
        };

        let total = match Opcode::try_from(opcode)? {
            Opcode::Ping | Opcode::Connect => 1,
            Opcode::Error if buf.len() < 5 => 5,
            Opcode::Error => {
                let mut length_bytes = [0u8; 4];
                length_bytes.copy_from_slice(&buf[1..5]);
                5 + error_message_len(i32::from_le_bytes(length_bytes))?
            }
        };
        Ok(Some(total.saturating_sub(buf.len())))
    }
}

/// Checks the declared length of an `ERROR` message
pub(crate) fn error_message_len(declared: i32) -> Result<usize, ProtocolError> {
    if declared < 0 {
        return Err(ProtocolError::MalformedFrame(format!(
            "negative error message length {}",
            declared
        )));
    }
    let length = declared as usize;
    if length > MAX_ERROR_MESSAGE {
        return Err(ProtocolError::FrameTooLarge(length));
    }
    Ok(length)
}

/// Inclusive range of receive ports a host may claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, port: i32) -> bool {
        port >= i32::from(self.start) && port <= i32::from(self.end)
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: crate::DEFAULT_REMOTE_PORT_START,
            end: crate::DEFAULT_REMOTE_PORT_END,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// First frame a host agent sends after connecting to the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationHeader {
    pub version: i32,
    pub name: String,
    pub receive_port: i32,
}

impl RegistrationHeader {
    /// Build a header for the current protocol version, validating the name
    pub fn new(name: impl Into<String>, receive_port: u16) -> Result<Self, ProtocolError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            version: PROTOCOL_VERSION,
            name,
            receive_port: i32::from(receive_port),
        })
    }

    /// Encode the full frame
    ///
    /// Format: `[total_len: i32 LE][version: i32 LE][name: 7-bit len + utf8][receive_port: i32 LE]`
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + 4 + 5 + self.name.len() + 4);
        buf.put_i32_le(0);
        buf.put_i32_le(self.version);
        put_prefixed_str(&mut buf, &self.name);
        buf.put_i32_le(self.receive_port);

        let total = buf.len() as i32;
        buf[..4].copy_from_slice(&total.to_le_bytes());
        buf.freeze()
    }

    /// Decode a full frame, length prefix included
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        if frame.len() < 4 {
            return Err(ProtocolError::MalformedFrame(
                "missing length prefix".to_string(),
            ));
        }
        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&frame[..4]);
        let total = frame_len(i32::from_le_bytes(length_bytes))?;
        if total != frame.len() {
            return Err(ProtocolError::MalformedFrame(format!(
                "declared {} bytes but frame has {}",
                total,
                frame.len()
            )));
        }
        Self::decode_payload(&frame[4..])
    }

    /// Decode the payload that follows the length prefix
    pub fn decode_payload(mut payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.remaining() < 4 {
            return Err(ProtocolError::MalformedFrame("missing version".to_string()));
        }
        let version = payload.get_i32_le();
        let name = get_prefixed_str(&mut payload)?;

        if payload.remaining() < 4 {
            return Err(ProtocolError::MalformedFrame(
                "missing receive port".to_string(),
            ));
        }
        let receive_port = payload.get_i32_le();

        if payload.has_remaining() {
            return Err(ProtocolError::MalformedFrame(format!(
                "{} unexpected trailing bytes",
                payload.remaining()
            )));
        }

        Ok(Self {
            version,
            name,
            receive_port,
        })
    }

    /// Validate every field against the protocol and the claimable range
    pub fn validate(&self, range: &PortRange) -> Result<(), ProtocolError> {
        if self.version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                received: self.version,
                expected: PROTOCOL_VERSION,
            });
        }

        validate_name(&self.name)?;

        if !range.contains(self.receive_port) {
            return Err(ProtocolError::PortOutOfRange {
                port: self.receive_port,
                start: range.start,
                end: range.end,
            });
        }

        Ok(())
    }

    /// The receive port, once `validate` has accepted it
    pub fn port(&self) -> u16 {
        self.receive_port.clamp(0, i32::from(u16::MAX)) as u16
    }
}

/// Checks the total length declared by a registration frame's prefix
pub(crate) fn frame_len(declared: i32) -> Result<usize, ProtocolError> {
    // version + at least one name length byte + receive port
    const MIN_FRAME: i32 = 4 + 4 + 1 + 4;

    if declared < MIN_FRAME {
        return Err(ProtocolError::MalformedFrame(format!(
            "frame length {} is shorter than the minimum {}",
            declared, MIN_FRAME
        )));
    }
    let total = declared as usize;
    if total > MAX_REGISTRATION_FRAME {
        return Err(ProtocolError::FrameTooLarge(total));
    }
    Ok(total)
}

/// Agent names are 1-32 characters and not blank
pub fn validate_name(name: &str) -> Result<(), ProtocolError> {
    if name.trim().is_empty() {
        return Err(ProtocolError::InvalidName(
            "name must not be blank".to_string(),
        ));
    }
    let chars = name.chars().count();
    if chars > MAX_NAME_LEN {
        return Err(ProtocolError::InvalidName(format!(
            "name must be at most {} characters (got {})",
            MAX_NAME_LEN, chars
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_wire_layout() {
        let header = RegistrationHeader::new("A", 21001).unwrap();
        let frame = header.encode();

        // 4 (len) + 4 (version) + 1 (name len) + 1 (name) + 4 (port)
        assert_eq!(frame.len(), 14);
        assert_eq!(&frame[..4], &14i32.to_le_bytes());
        assert_eq!(&frame[4..8], &1i32.to_le_bytes());
        assert_eq!(frame[8], 1);
        assert_eq!(frame[9], b'A');
        assert_eq!(&frame[10..14], &21001i32.to_le_bytes());

        assert_eq!(RegistrationHeader::decode(&frame).unwrap(), header);
    }

    #[test]
    fn test_header_utf8_name() {
        let header = RegistrationHeader::new("데스크톱-01", 21005).unwrap();
        let decoded = RegistrationHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded.name, "데스크톱-01");
        assert_eq!(decoded.port(), 21005);
    }

    #[test]
    fn test_header_rejects_trailing_bytes() {
        let header = RegistrationHeader::new("host", 21001).unwrap();
        let mut payload = header.encode()[4..].to_vec();
        payload.extend_from_slice(&[0, 0, 0, 0]);
        assert!(matches!(
            RegistrationHeader::decode_payload(&payload),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_frame_length_limits() {
        assert_eq!(frame_len(14).unwrap(), 14);
        assert!(matches!(frame_len(-5), Err(ProtocolError::MalformedFrame(_))));
        assert!(matches!(frame_len(12), Err(ProtocolError::MalformedFrame(_))));
        assert!(matches!(
            frame_len(4096),
            Err(ProtocolError::FrameTooLarge(4096))
        ));
    }

    #[test]
    fn test_validate() {
        let range = PortRange::new(21001, 21999);

        let ok = RegistrationHeader::new("office-pc", 21001).unwrap();
        assert!(ok.validate(&range).is_ok());

        let mut wrong_version = ok.clone();
        wrong_version.version = 2;
        assert!(matches!(
            wrong_version.validate(&range),
            Err(ProtocolError::VersionMismatch {
                received: 2,
                expected: 1
            })
        ));

        let low = RegistrationHeader::new("office-pc", 21000).unwrap();
        assert!(matches!(
            low.validate(&range),
            Err(ProtocolError::PortOutOfRange { port: 21000, .. })
        ));

        let mut negative = ok.clone();
        negative.receive_port = -1;
        assert!(negative.validate(&range).is_err());

        let mut blank = ok;
        blank.name = "   ".to_string();
        assert!(matches!(
            blank.validate(&range),
            Err(ProtocolError::InvalidName(_))
        ));
    }

    #[test]
    fn test_name_length_limits() {
        assert!(validate_name("a").is_ok());
        assert!(validate_name(&"x".repeat(32)).is_ok());
        assert!(validate_name(&"x".repeat(33)).is_err());
        assert!(validate_name("").is_err());
        // 32 multi-byte characters are still 32 characters
        assert!(validate_name(&"가".repeat(32)).is_ok());
    }

    #[test]
    fn test_control_message_encoding() {
        assert_eq!(ControlMessage::Ping.encode().as_ref(), &[0]);
        assert_eq!(ControlMessage::Connect.encode().as_ref(), &[1]);

        let encoded = ControlMessage::Error("bad".to_string()).encode();
        assert_eq!(encoded[0], 2);
        assert_eq!(&encoded[1..5], &3i32.to_le_bytes());
        assert_eq!(&encoded[5..], b"bad");
    }

    #[test]
    fn test_header_rejects_length_disagreement() {
        let mut frame = RegistrationHeader::new("host", 21001)
            .unwrap()
            .encode()
            .to_vec();
        frame.push(0);
        assert!(matches!(
            RegistrationHeader::decode(&frame),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_control_decode_incremental() {
        let encoded = ControlMessage::Error("port taken".to_string()).encode();

        let mut buf = BytesMut::from(&encoded[..3]);
        assert_eq!(ControlMessage::missing_bytes(&buf).unwrap(), Some(2));
        assert_eq!(ControlMessage::decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&encoded[3..5]);
        assert_eq!(ControlMessage::missing_bytes(&buf).unwrap(), Some(10));

        buf.extend_from_slice(&encoded[5..]);
        buf.extend_from_slice(&ControlMessage::Ping.encode());
        assert_eq!(
            ControlMessage::decode(&mut buf).unwrap(),
            Some(ControlMessage::Error("port taken".to_string()))
        );
        assert_eq!(
            ControlMessage::decode(&mut buf).unwrap(),
            Some(ControlMessage::Ping)
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unknown_opcode() {
        assert_eq!(Opcode::try_from(1).unwrap(), Opcode::Connect);
        assert!(matches!(
            Opcode::try_from(7),
            Err(ProtocolError::UnknownOpcode(7))
        ));

        let mut buf = BytesMut::from(&[7u8][..]);
        assert!(matches!(
            ControlMessage::decode(&mut buf),
            Err(ProtocolError::UnknownOpcode(7))
        ));
    }

    #[test]
    fn test_port_range() {
        let range = PortRange::default();
        assert!(range.contains(21001));
        assert!(range.contains(21999));
        assert!(!range.contains(22000));
        assert_eq!(range.to_string(), "21001-21999");

        let json = serde_json::to_string(&range).unwrap();
        let parsed: PortRange = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, range);
    }
}
