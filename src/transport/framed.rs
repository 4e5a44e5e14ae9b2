//! Length-prefixed framing over a raw byte pipe.
//!
//! Each message is `[2-byte big-endian length][payload]`. Incoming frames
//! are reassembled into an arena that is reset per message; a frame larger
//! than the arena is rejected rather than grown. EOF in the middle of a
//! frame means the peer went away.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::Transport;
use crate::arena::{Arena, ARENA_128K};
use crate::error::TransportError;

pub struct FramedTransport<S> {
    stream: S,
    recv: Arena,
    closed: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> FramedTransport<S> {
    pub fn new(stream: S) -> Self {
        Self::with_capacity(stream, ARENA_128K)
    }

    pub fn with_capacity(stream: S, capacity: usize) -> Self {
        Self {
            stream,
            recv: Arena::with_capacity(capacity),
            closed: false,
        }
    }

    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let len = u16::try_from(payload.len())
            .map_err(|_| TransportError::MessageTooLarge { len: payload.len() })?;
        self.stream.write_all(&len.to_be_bytes()).await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn read_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut header = [0u8; 2];
        read_exact(&mut self.stream, &mut header).await?;
        let len = u16::from_be_bytes(header) as usize;
        if len > self.recv.capacity() {
            return Err(TransportError::MessageTooLarge { len });
        }
        self.recv.reset();
        let offset = self
            .recv
            .alloc(len, 1)
            .map_err(|_| TransportError::MessageTooLarge { len })?;
        read_exact(&mut self.stream, self.recv.bytes_mut(offset, len)).await?;
        Ok(self.recv.bytes(offset, len).to_vec())
    }
}

pub(super) async fn read_exact<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut [u8],
) -> Result<(), TransportError> {
    stream.read_exact(buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            TransportError::ConnectionClosed
        } else {
            TransportError::Io(e)
        }
    })?;
    Ok(())
}

#[async_trait::async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> Transport for FramedTransport<S> {
    async fn send(&mut self, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.write_frame(payload).await?;
        self.read_frame().await
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(buf).await?;
        Ok(())
    }

    async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let n = self.stream.read(buf).await?;
        if n == 0 {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(n)
    }

    async fn close(&mut self) {
        if !self.closed {
            let _ = self.stream.shutdown().await;
            self.closed = true;
        }
    }
}

/// Open a serial carrier on a port device file.
///
/// The port is put into raw mode at the requested baud rate by spawning
/// `stty` before the device file is opened for read/write. A failing
/// `stty` is logged and tolerated: the port may already be configured, and
/// some fixtures are plain FIFOs.
pub async fn open_serial(
    port: &str,
    baud: u32,
) -> Result<FramedTransport<tokio::fs::File>, TransportError> {
    let status = tokio::process::Command::new("stty")
        .args(["-F", port, &baud.to_string(), "raw", "-echo"])
        .status()
        .await;
    match status {
        Ok(s) if s.success() => {}
        Ok(s) => log::warn!("stty on {port} exited with {s}"),
        Err(e) => log::warn!("could not run stty on {port}: {e}"),
    }

    let file = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(port)
        .await
        .map_err(|e| TransportError::ConnectionRefused(format!("{port}: {e}")))?;
    Ok(FramedTransport::new(file))
}
