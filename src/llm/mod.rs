// LLM client module: the common content-block model, the three wire
// dialects, and streamed-response decoding.

pub mod client;
pub mod sse;
pub mod types;


// Re-export main types
pub use client::LlmClient;
pub use sse::{ChatChunkDecoder, SseDecoder};
pub use types::*;
