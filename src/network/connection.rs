//! Per-connection I/O framing: a growable read buffer plus a streaming-decode retry loop.
//! [`Connection`] covers the ordinary full-duplex case (client connections, and the
//! follower's single connection to its leader). The free functions below it operate on any
//! `AsyncRead` half so the leader's replica connections — which need to read inbound ACKs
//! and write propagated commands concurrently — can split the socket and still reuse the
//! same decode loop.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::parser::rdb::decode_raw_frame;
use crate::parser::resp::{decode, ParseError, Value};

const INITIAL_BUFFER_CAPACITY: usize = 4 * 1024;
const READ_CHUNK: usize = 4 * 1024;

pub type Result<T> = std::result::Result<T, ConnectionError>;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ParseError),
}

/// Read and decode the next value from `reader`, appending to `buffer` and retrying until a
/// full message is available. `Ok(None)` means clean EOF with no partial message pending.
pub async fn read_value_from<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut BytesMut,
) -> Result<Option<(Value, usize)>> {
    loop {
        match decode(buffer) {
            Ok((value, len)) => {
                buffer.advance(len);
                return Ok(Some((value, len)));
            }
            Err(ParseError::Incomplete) => {
                if fill_buffer(reader, buffer).await? == 0 {
                    if buffer.is_empty() {
                        return Ok(None);
                    }
                    return Err(ConnectionError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed mid-message",
                    )));
                }
            }
            Err(e) => return Err(ConnectionError::Protocol(e)),
        }
    }
}

/// Read the raw (CRLF-less) snapshot frame emitted right after `FULLRESYNC`.
pub async fn read_raw_frame_from<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut BytesMut,
) -> Result<Vec<u8>> {
    loop {
        match decode_raw_frame(buffer) {
            Ok(frame) => {
                buffer.advance(frame.len);
                return Ok(frame.payload);
            }
            Err(ParseError::Incomplete) => {
                if fill_buffer(reader, buffer).await? == 0 {
                    return Err(ConnectionError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed during snapshot transfer",
                    )));
                }
            }
            Err(e) => return Err(ConnectionError::Protocol(e)),
        }
    }
}

async fn fill_buffer<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut BytesMut,
) -> std::io::Result<usize> {
    let mut chunk = [0u8; READ_CHUNK];
    let n = reader.read(&mut chunk).await?;
    if n > 0 {
        buffer.extend_from_slice(&chunk[..n]);
    }
    Ok(n)
}

pub struct Connection {
    stream: TcpStream,
    buffer: BytesMut,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    pub fn peer_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.stream.peer_addr()
    }

    pub async fn read_value(&mut self) -> Result<Option<(Value, usize)>> {
        read_value_from(&mut self.stream, &mut self.buffer).await
    }

    pub async fn read_raw_frame(&mut self) -> Result<Vec<u8>> {
        read_raw_frame_from(&mut self.stream, &mut self.buffer).await
    }

    pub async fn write_value(&mut self, value: &Value) -> Result<()> {
        self.stream.write_all(&value.encode()).await?;
        Ok(())
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    /// Split into independent read/write halves, carrying over any bytes already buffered
    /// but not yet decoded. Used when a client connection is promoted to a replica
    /// connection and needs to read inbound ACKs while writing propagated commands.
    pub fn into_split(self) -> (OwnedReadHalf, BytesMut, OwnedWriteHalf) {
        let (read_half, write_half) = self.stream.into_split();
        (read_half, self.buffer, write_half)
    }
}

/// Thin wrapper so call sites that only ever write (the replica's propagation sender) don't
/// need to import `AsyncWriteExt` themselves.
pub async fn write_raw_to<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    writer.write_all(bytes).await?;
    Ok(())
}
