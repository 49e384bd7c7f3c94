//! NUL-terminated framing used by the pipe backend.
//!
//! A request is the message bytes followed by one NUL. A reply is a plain
//! byte stream that ends when the server disconnects; every reply chunk is
//! followed by a NUL so that chunks stay separable.

use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Server-side request buffer size.
pub const REQUEST_BUFFER_SIZE: usize = 1024;

/// Growth step of the client-side reply buffer.
const REPLY_CHUNK: usize = 16 * 1024;

/// Error type for NUL framing.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("message too long: '{}'", String::from_utf8_lossy(.0))]
    TooLong(Vec<u8>),
}

/// Read one NUL-terminated request into a buffer of `capacity` bytes.
///
/// A read is complete when the last byte received is NUL, or when the peer
/// closes the stream after sending data. Returns `None` if the peer closed
/// without sending anything. Filling the buffer without seeing a terminator
/// is [`FrameError::TooLong`].
pub async fn read_request<R>(reader: &mut R, capacity: usize) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; capacity];
    let mut offset = 0;

    loop {
        if offset >= capacity {
            return Err(FrameError::TooLong(buffer));
        }

        let length = reader.read(&mut buffer[offset..]).await?;
        if length == 0 {
            if offset == 0 {
                return Ok(None);
            }
            buffer.truncate(offset);
            return Ok(Some(buffer));
        }

        offset += length;
        if buffer[offset - 1] == 0 {
            buffer.truncate(offset - 1);
            return Ok(Some(buffer));
        }
    }
}

/// Write `message` followed by its NUL terminator.
pub async fn write_terminated<W>(writer: &mut W, message: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut framed = Vec::with_capacity(message.len() + 1);
    framed.extend_from_slice(message);
    framed.push(0);
    writer.write_all(&framed).await
}

/// Read a reply until a zero-length read.
///
/// Errors for which `is_disconnect` returns true end the reply quietly; the
/// bytes received so far are the answer.
pub async fn read_reply<R, F>(reader: &mut R, is_disconnect: F) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
    F: Fn(&io::Error) -> bool,
{
    let mut answer = Vec::new();
    let mut chunk = vec![0u8; REPLY_CHUNK];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => answer.extend_from_slice(&chunk[..n]),
            Err(e) if is_disconnect(&e) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(answer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn never(_: &io::Error) -> bool {
        false
    }

    #[tokio::test]
    async fn test_read_request_stops_at_terminator() {
        let mut reader: &[u8] = b"1 1700000000\0";
        let request = read_request(&mut reader, REQUEST_BUFFER_SIZE).await.unwrap();
        assert_eq!(request.as_deref(), Some(&b"1 1700000000"[..]));
    }

    #[tokio::test]
    async fn test_read_request_across_small_reads() {
        let (mut client, mut server) = tokio::io::duplex(2);
        let writer = tokio::spawn(async move {
            write_terminated(&mut client, b"1 42").await.unwrap();
            client
        });
        let request = read_request(&mut server, REQUEST_BUFFER_SIZE).await.unwrap();
        let _client = writer.await.unwrap();
        assert_eq!(request.as_deref(), Some(&b"1 42"[..]));
    }

    #[tokio::test]
    async fn test_read_request_empty_stream() {
        let mut reader: &[u8] = b"";
        assert!(read_request(&mut reader, REQUEST_BUFFER_SIZE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_request_unterminated_then_closed() {
        let mut reader: &[u8] = b"quit";
        let request = read_request(&mut reader, REQUEST_BUFFER_SIZE).await.unwrap();
        assert_eq!(request.as_deref(), Some(&b"quit"[..]));
    }

    #[tokio::test]
    async fn test_read_request_too_long() {
        let long = vec![b'7'; 64];
        let mut reader = long.as_slice();
        assert!(matches!(
            read_request(&mut reader, 16).await,
            Err(FrameError::TooLong(partial)) if partial.len() == 16
        ));
    }

    #[tokio::test]
    async fn test_read_reply_until_close() {
        let mut reader: &[u8] = b"b.txt\0a.txt\0";
        let reply = read_reply(&mut reader, never).await.unwrap();
        assert_eq!(reply, b"b.txt\0a.txt\0");
    }

    struct BrokenAfter<'a> {
        data: &'a [u8],
    }

    impl AsyncRead for BrokenAfter<'_> {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            if self.data.is_empty() {
                return std::task::Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
            }
            let n = self.data.len().min(buf.remaining());
            buf.put_slice(&self.data[..n]);
            self.data = &self.data[n..];
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_read_reply_disconnect_is_end_of_reply() {
        let mut reader = BrokenAfter { data: b"/\0" };
        let reply = read_reply(&mut reader, |e| e.kind() == io::ErrorKind::BrokenPipe)
            .await
            .unwrap();
        assert_eq!(reply, b"/\0");
    }

    #[tokio::test]
    async fn test_read_reply_other_errors_surface() {
        let mut reader = BrokenAfter { data: b"x" };
        assert!(read_reply(&mut reader, never).await.is_err());
    }
}
