//! Byte-pipe carriers for model and bridge traffic.
//!
//! A request is one payload out, one payload back. HTTP carries it as a
//! POST; serial and BLE carry it as a length-prefixed frame holding an RPC
//! envelope that the bridge sidecar interprets. The transport is owned by
//! its client for the duration of a request and released with `close`.

mod ble;
mod framed;
mod http;

pub use ble::BleTransport;
pub use framed::{open_serial, FramedTransport};
pub use http::HttpTransport;

use crate::error::TransportError;

/// Which carrier a build or invocation talks through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Http,
    Ble,
    Serial,
}

impl TransportKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "http" => Some(TransportKind::Http),
            "ble" => Some(TransportKind::Ble),
            "serial" => Some(TransportKind::Serial),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Http => "http",
            TransportKind::Ble => "ble",
            TransportKind::Serial => "serial",
        }
    }
}

/// Capability set shared by all carriers.
///
/// `send` is the one-shot request/response primitive; `write_all` /
/// `read_some` are the raw streaming primitives. `close` is idempotent.
#[async_trait::async_trait]
pub trait Transport: Send {
    async fn send(&mut self, payload: &[u8]) -> Result<Vec<u8>, TransportError>;

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError>;

    async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    async fn close(&mut self);
}

/// Endpoint of a non-HTTP carrier.
#[derive(Debug, Clone)]
pub enum RemoteEndpoint {
    Serial { port: String, baud: u32 },
    Ble { socket_path: std::path::PathBuf },
}

/// Open a framed carrier to the bridge / device endpoint.
pub async fn open_remote(endpoint: &RemoteEndpoint) -> Result<Box<dyn Transport>, TransportError> {
    match endpoint {
        RemoteEndpoint::Serial { port, baud } => {
            Ok(Box::new(open_serial(port, *baud).await?))
        }
        RemoteEndpoint::Ble { socket_path } => {
            let stream = tokio::net::UnixStream::connect(socket_path)
                .await
                .map_err(|e| {
                    TransportError::ConnectionRefused(format!(
                        "bridge socket {}: {e}",
                        socket_path.display()
                    ))
                })?;
            Ok(Box::new(BleTransport::new(stream)))
        }
    }
}
