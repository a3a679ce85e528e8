//! Framing helpers for reading and writing protocol messages on async streams

use crate::error::ProtocolError;
use crate::messages::{frame_len, ControlMessage, RegistrationHeader};
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A 7-bit encoded `u32` never needs more than 5 bytes
const MAX_VARINT_BYTES: usize = 5;

/// Write a string as a 7-bit variable-length byte count followed by UTF-8 bytes
pub(crate) fn put_prefixed_str(buf: &mut BytesMut, value: &str) {
    let mut len = value.len() as u32;
    while len >= 0x80 {
        buf.put_u8((len as u8) | 0x80);
        len >>= 7;
    }
    buf.put_u8(len as u8);
    buf.extend_from_slice(value.as_bytes());
}

/// Read a string written by [`put_prefixed_str`]
pub(crate) fn get_prefixed_str(buf: &mut &[u8]) -> Result<String, ProtocolError> {
    let mut len: u32 = 0;
    let mut shift = 0;
    let mut terminated = false;

    for _ in 0..MAX_VARINT_BYTES {
        if !buf.has_remaining() {
            return Err(ProtocolError::MalformedFrame(
                "truncated string length".to_string(),
            ));
        }
        let byte = buf.get_u8();
        len |= u32::from(byte & 0x7f) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            terminated = true;
            break;
        }
    }

    if !terminated {
        return Err(ProtocolError::MalformedFrame(
            "string length prefix is too long".to_string(),
        ));
    }

    let len = len as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::MalformedFrame(format!(
            "string needs {} bytes but only {} remain",
            len,
            buf.remaining()
        )));
    }

    let bytes = buf[..len].to_vec();
    buf.advance(len);
    String::from_utf8(bytes)
        .map_err(|_| ProtocolError::MalformedFrame("string is not valid UTF-8".to_string()))
}

/// Read one length-prefixed registration frame
pub async fn read_registration<R>(reader: &mut R) -> Result<RegistrationHeader, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let declared = reader.read_i32_le().await?;
    let total = frame_len(declared)?;

    let mut frame = vec![0u8; total];
    frame[..4].copy_from_slice(&declared.to_le_bytes());
    reader.read_exact(&mut frame[4..]).await?;

    RegistrationHeader::decode(&frame)
}

/// Write a registration frame and flush it
pub async fn write_registration<W>(
    writer: &mut W,
    header: &RegistrationHeader,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&header.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one control message
///
/// Returns Ok(None) when the peer closed the connection cleanly before sending an opcode.
pub async fn read_control<R>(reader: &mut R) -> Result<Option<ControlMessage>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut opcode = [0u8; 1];
    if reader.read(&mut opcode).await? == 0 {
        return Ok(None);
    }

    let mut buf = BytesMut::from(&opcode[..]);
    loop {
        if let Some(message) = ControlMessage::decode(&mut buf)? {
            return Ok(Some(message));
        }
        // Read exactly what the message still needs, never past its end
        let missing = ControlMessage::missing_bytes(&buf)?.unwrap_or(1);
        let filled = buf.len();
        buf.resize(filled + missing, 0);
        reader.read_exact(&mut buf[filled..]).await?;
    }
}

/// Write one control message and flush it
pub async fn write_control<W>(writer: &mut W, message: &ControlMessage) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&message.encode()).await?;
    writer.flush().await?;
    Ok(())
}
