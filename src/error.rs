//! Error taxonomy for the agent runtime.
//!
//! Only model/transport failures abort the ReAct loop. Tool failures are
//! observations: they are wrapped into error tool-results by the dispatcher
//! and fed back to the model, never surfaced as `Err` from the loop.

/// Errors surfaced by the LLM client and the ReAct loop.
///
/// The client never retries internally; the driver decides what to do with
/// each of these.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("authentication failed (401)")]
    AuthError,

    #[error("rate limited (429)")]
    RateLimited,

    #[error("server error ({status})")]
    ServerError { status: u16 },

    #[error("HTTP error ({status}): {body}")]
    HttpError { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("out of memory: {0}")]
    OutOfMemory(#[from] crate::arena::ArenaError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

/// Errors raised by the byte-pipe carriers.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("message of {len} bytes exceeds reassembly buffer")]
    MessageTooLarge { len: usize },

    #[error("HTTP status {status}")]
    Http { status: u16, body: String },

    #[error("streaming is not supported on this carrier")]
    StreamingUnsupported,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Map a transport-level HTTP failure into the client taxonomy.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 => ClientError::AuthError,
            429 => ClientError::RateLimited,
            s if (500..600).contains(&s) => ClientError::ServerError { status: s },
            s => ClientError::HttpError { status: s, body },
        }
    }

    /// One-line hint for recognised failures, shown by the driver.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            ClientError::ConnectionRefused(_) => {
                Some("is the endpoint reachable? check --base-url / --transport")
            }
            ClientError::AuthError => Some("check your API key (ANTHROPIC_API_KEY / OPENAI_API_KEY)"),
            ClientError::RateLimited => Some("rate limited; wait a moment and retry"),
            ClientError::ServerError { .. } => Some("provider-side failure; retry later"),
            _ => None,
        }
    }
}
