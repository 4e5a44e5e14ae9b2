//! HTTP carrier over reqwest.
//!
//! The URL and headers are fixed when the transport is built; `send` posts
//! one JSON body and returns the response bytes. Streaming responses do not
//! go through this type: the SSE path drives reqwest's byte stream directly
//! through the event-source decoder.

use crate::error::TransportError;
use super::Transport;

pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    headers: Vec<(String, String)>,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, url: String, headers: Vec<(String, String)>) -> Self {
        Self {
            client,
            url,
            headers,
        }
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn send(&mut self, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut request = self
            .client
            .post(&self.url)
            .header("content-type", "application/json");
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.body(payload.to_vec()).send().await.map_err(|e| {
            if e.is_connect() {
                TransportError::ConnectionRefused(e.to_string())
            } else {
                TransportError::Io(std::io::Error::other(e))
            }
        })?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))?;
        if !status.is_success() {
            return Err(TransportError::Http {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body.to_vec())
    }

    async fn write_all(&mut self, _buf: &[u8]) -> Result<(), TransportError> {
        Err(TransportError::StreamingUnsupported)
    }

    async fn read_some(&mut self, _buf: &mut [u8]) -> Result<usize, TransportError> {
        Err(TransportError::StreamingUnsupported)
    }

    async fn close(&mut self) {}
}
