//! pkt-line framing used by the socket backend.
//!
//! Each packet is sent as:
//! - 4 bytes: total length in lowercase hex, header included
//! - N bytes: payload
//!
//! The special header `0000` is a flush packet and carries no payload.
//! Readers are gentle: a clean end-of-stream before a header is reported as
//! [`Packet::Eof`] and malformed input becomes a [`PacketError`], never a
//! panic.

use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length header.
pub const HEADER_LEN: usize = 4;

/// Largest packet, header included.
pub const LARGE_PACKET_MAX: usize = 65520;

/// Largest payload a single packet can carry.
pub const MAX_PAYLOAD: usize = LARGE_PACKET_MAX - HEADER_LEN;

const FLUSH: &[u8; HEADER_LEN] = b"0000";

/// One packet read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// A data packet with its trailing newline (if any) removed.
    Data(Vec<u8>),
    /// A `0000` flush packet.
    Flush,
    /// The peer closed the stream before another header.
    Eof,
}

/// Error type for pkt-line operations.
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid packet header {0:?}")]
    BadHeader(String),

    #[error("packet of {len} bytes exceeds limit of {max}")]
    TooLong { len: usize, max: usize },

    #[error("stream ended inside a packet")]
    Truncated,
}

/// Frame a payload as a single data packet.
pub fn frame(payload: &[u8]) -> Result<Vec<u8>, PacketError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(PacketError::TooLong {
            len: payload.len(),
            max: MAX_PAYLOAD,
        });
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(format!("{:04x}", payload.len() + HEADER_LEN).as_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decode a length header.
///
/// Returns the payload length; `None` for a flush packet.
pub fn parse_header(header: &[u8; HEADER_LEN]) -> Result<Option<usize>, PacketError> {
    if header == FLUSH {
        return Ok(None);
    }

    let bad = || PacketError::BadHeader(String::from_utf8_lossy(header).into_owned());
    let text = std::str::from_utf8(header).map_err(|_| bad())?;
    if !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(bad());
    }
    let total = usize::from_str_radix(text, 16).map_err(|_| bad())?;

    if total < HEADER_LEN {
        return Err(bad());
    }
    if total > LARGE_PACKET_MAX {
        return Err(PacketError::TooLong {
            len: total,
            max: LARGE_PACKET_MAX,
        });
    }
    Ok(Some(total - HEADER_LEN))
}

/// Write one data packet.
pub async fn write_packet<W>(writer: &mut W, payload: &[u8]) -> Result<(), PacketError>
where
    W: AsyncWrite + Unpin,
{
    let framed = frame(payload)?;
    writer.write_all(&framed).await?;
    Ok(())
}

/// Write a flush packet.
pub async fn write_flush<W>(writer: &mut W) -> Result<(), PacketError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(FLUSH).await?;
    Ok(())
}

/// Read one packet whose payload may not exceed `max_payload` bytes.
pub async fn read_packet<R>(reader: &mut R, max_payload: usize) -> Result<Packet, PacketError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match read_full(reader, &mut header).await? {
        0 => return Ok(Packet::Eof),
        HEADER_LEN => {}
        _ => return Err(PacketError::Truncated),
    }

    let Some(len) = parse_header(&header)? else {
        return Ok(Packet::Flush);
    };
    if len > max_payload {
        return Err(PacketError::TooLong {
            len,
            max: max_payload,
        });
    }

    let mut payload = vec![0u8; len];
    if read_full(reader, &mut payload).await? != len {
        return Err(PacketError::Truncated);
    }

    if payload.last() == Some(&b'\n') {
        payload.pop();
    }
    Ok(Packet::Data(payload))
}

/// Fill `buf` unless the stream ends first; returns the bytes read.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
