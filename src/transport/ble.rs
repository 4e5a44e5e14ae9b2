//! BLE carrier: MTU chunking layered over length framing.
//!
//! A framed message (`[2-byte length][payload]`) is split into GATT-sized
//! chunks, each carrying a 2-byte `[chunk_index, total_chunks]` header so
//! the peer can reassemble writes that arrive out of a single notification.
//! Responses are single-frame only: a response advertising more than one
//! chunk is rejected, since multi-chunk reassembly on the receive side is
//! not part of the contract.
//!
//! Hosted builds have no BLE stack; the chunk stream is carried to the
//! bridge sidecar over a local socket and the bridge replays it over GATT.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::framed::read_exact;
use super::Transport;
use crate::arena::{Arena, ARENA_4K};
use crate::error::TransportError;

/// Assumed BLE 5.x payload MTU.
pub const BLE_MTU: usize = 244;
/// Chunk header is `[chunk_index, total_chunks]`.
const CHUNK_HEADER: usize = 2;
const CHUNK_DATA: usize = BLE_MTU - CHUNK_HEADER;

pub struct BleTransport<S> {
    stream: S,
    recv: Arena,
    closed: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> BleTransport<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            recv: Arena::with_capacity(ARENA_4K),
            closed: false,
        }
    }

    async fn write_chunked(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let len = u16::try_from(payload.len())
            .map_err(|_| TransportError::MessageTooLarge { len: payload.len() })?;

        let mut message = Vec::with_capacity(2 + payload.len());
        message.extend_from_slice(&len.to_be_bytes());
        message.extend_from_slice(payload);

        let total = message.len().div_ceil(CHUNK_DATA);
        if total > u8::MAX as usize {
            return Err(TransportError::MessageTooLarge { len: payload.len() });
        }
        for (index, data) in message.chunks(CHUNK_DATA).enumerate() {
            self.stream.write_all(&[index as u8, total as u8]).await?;
            self.stream.write_all(data).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_single_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut chunk_header = [0u8; 2];
        read_exact(&mut self.stream, &mut chunk_header).await?;
        let total = chunk_header[1] as usize;
        if total != 1 {
            // Multi-chunk responses are outside the contract.
            return Err(TransportError::MessageTooLarge {
                len: total * CHUNK_DATA,
            });
        }

        let mut frame_header = [0u8; 2];
        read_exact(&mut self.stream, &mut frame_header).await?;
        let len = u16::from_be_bytes(frame_header) as usize;
        if 2 + len > CHUNK_DATA || len > self.recv.capacity() {
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

#[async_trait::async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> Transport for BleTransport<S> {
    async fn send(&mut self, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.write_chunked(payload).await?;
        self.read_single_frame().await
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(buf).await?;
        Ok(())
    }

    async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        use tokio::io::AsyncReadExt;
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
