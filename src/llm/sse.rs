//! Incremental decoding of streamed responses into content blocks.
//!
//! [`SseDecoder`] consumes the Anthropic event set (`message_start`,
//! `content_block_start`, `content_block_delta`, `content_block_stop`,
//! `message_delta`, `message_stop`, plus `ping` and `error`).
//! [`ChatChunkDecoder`] consumes OpenAI-style `chat.completion.chunk`
//! payloads. Both are fed one `data:` payload at a time and accumulate
//! state until the stream ends.
//!
//! Every string taken from a `data:` payload that outlives the call is
//! copied into an owned accumulator immediately; the event buffer is reused
//! by the transport layer and must never be aliased.

use crate::error::ClientError;
use crate::json;
use crate::llm::types::{ApiResponse, ContentBlock, StopReason};

/// Assembles Anthropic SSE events into an [`ApiResponse`].
#[derive(Default)]
pub struct SseDecoder {
    id: String,
    blocks: Vec<ContentBlock>,
    text_acc: String,
    in_tool_use: bool,
    tool_id: String,
    tool_name: String,
    tool_input_acc: String,
    stop_reason: Option<StopReason>,
    input_tokens: u64,
    output_tokens: u64,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `message_stop` has been observed.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed one event. Text deltas are forwarded to `on_delta` as they
    /// arrive.
    pub fn handle_event(
        &mut self,
        event: &str,
        data: &str,
        on_delta: &mut dyn FnMut(&str),
    ) -> Result<(), ClientError> {
        match event {
            "message_start" => {
                if let Some(id) = json::extract_string(data, "id") {
                    self.id = json::unescape(id);
                }
                if let Some(n) = json::extract_u64(data, "input_tokens") {
                    self.input_tokens = n;
                }
            }
            "content_block_start" => {
                let block = json::extract_object(data, "content_block").unwrap_or("{}");
                if json::extract_string(block, "type") == Some("tool_use") {
                    self.flush_text();
                    self.in_tool_use = true;
                    self.tool_id =
                        json::unescape(json::extract_string(block, "id").unwrap_or(""));
                    self.tool_name =
                        json::unescape(json::extract_string(block, "name").unwrap_or(""));
                    self.tool_input_acc.clear();
                }
            }
            "content_block_delta" => {
                let delta = json::extract_object(data, "delta").unwrap_or("{}");
                match json::extract_string(delta, "type") {
                    Some("text_delta") => {
                        if let Some(raw) = json::extract_string(delta, "text") {
                            let text = json::unescape(raw);
                            on_delta(&text);
                            self.text_acc.push_str(&text);
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(raw) = json::extract_string(delta, "partial_json") {
                            self.tool_input_acc.push_str(&json::unescape(raw));
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                if self.in_tool_use {
                    let input_raw = if self.tool_input_acc.is_empty() {
                        "{}".to_string()
                    } else {
                        std::mem::take(&mut self.tool_input_acc)
                    };
                    self.blocks.push(ContentBlock::ToolUse {
                        id: std::mem::take(&mut self.tool_id),
                        name: std::mem::take(&mut self.tool_name),
                        input_raw,
                    });
                    self.in_tool_use = false;
                } else {
                    self.flush_text();
                }
            }
            "message_delta" => {
                if let Some(reason) = json::extract_string(data, "stop_reason") {
                    self.stop_reason = Some(StopReason::parse(reason));
                }
                if let Some(n) = json::extract_u64(data, "output_tokens") {
                    self.output_tokens = n;
                }
            }
            "message_stop" => {
                self.done = true;
            }
            "ping" => {}
            "error" => {
                let msg = json::extract_string(data, "message")
                    .map(json::unescape)
                    .unwrap_or_else(|| data.to_string());
                return Err(ClientError::InvalidResponse(msg));
            }
            other => {
                log::debug!("ignoring unknown SSE event {other:?}");
            }
        }
        Ok(())
    }

    fn flush_text(&mut self) {
        if !self.text_acc.is_empty() {
            self.blocks.push(ContentBlock::Text {
                text: std::mem::take(&mut self.text_acc),
            });
        }
    }

    pub fn finish(mut self) -> ApiResponse {
        // A stream cut off mid-block still yields what was accumulated.
        if self.in_tool_use {
            let input_raw = if self.tool_input_acc.is_empty() {
                "{}".to_string()
            } else {
                std::mem::take(&mut self.tool_input_acc)
            };
            self.blocks.push(ContentBlock::ToolUse {
                id: std::mem::take(&mut self.tool_id),
                name: std::mem::take(&mut self.tool_name),
                input_raw,
            });
        }
        self.flush_text();
        ApiResponse {
            id: self.id,
            stop_reason: self.stop_reason.unwrap_or(StopReason::Unknown),
            blocks: self.blocks,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
        }
    }
}

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Assembles OpenAI-style streaming chunks into an [`ApiResponse`].
///
/// Chunks arrive as unnamed SSE events whose data is a
/// `chat.completion.chunk` document; the terminal `[DONE]` sentinel is
/// handled by the caller.
#[derive(Default)]
pub struct ChatChunkDecoder {
    id: String,
    text_acc: String,
    calls: Vec<PartialCall>,
    finish_reason: Option<StopReason>,
    input_tokens: u64,
    output_tokens: u64,
}

impl ChatChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_chunk(&mut self, data: &str, on_delta: &mut dyn FnMut(&str)) {
        if self.id.is_empty() {
            if let Some(id) = json::extract_string(data, "id") {
                self.id = json::unescape(id);
            }
        }
        if let Some(delta) = json::extract_object(data, "delta") {
            if let Some(raw) = json::extract_string(delta, "content") {
                let text = json::unescape(raw);
                on_delta(&text);
                self.text_acc.push_str(&text);
            }
            if let Some(tool_calls) = json::extract_array(delta, "tool_calls") {
                for item in json::array_items(tool_calls) {
                    let index =
                        json::extract_u64(item, "index").unwrap_or(self.calls.len() as u64)
                            as usize;
                    while self.calls.len() <= index {
                        self.calls.push(PartialCall::default());
                    }
                    let call = &mut self.calls[index];
                    if let Some(id) = json::extract_string(item, "id") {
                        call.id = json::unescape(id);
                    }
                    if let Some(func) = json::extract_object(item, "function") {
                        if let Some(name) = json::extract_string(func, "name") {
                            call.name = json::unescape(name);
                        }
                        if let Some(args) = json::extract_string(func, "arguments") {
                            call.arguments.push_str(&json::unescape(args));
                        }
                    }
                }
            }
        }
        if let Some(reason) = json::extract_string(data, "finish_reason") {
            self.finish_reason = Some(StopReason::parse(reason));
        }
        if let Some(usage) = json::extract_object(data, "usage") {
            if let Some(n) = json::extract_u64(usage, "prompt_tokens") {
                self.input_tokens = n;
            }
            if let Some(n) = json::extract_u64(usage, "completion_tokens") {
                self.output_tokens = n;
            }
        }
    }

    pub fn finish(self) -> ApiResponse {
        let mut blocks = Vec::new();
        if !self.text_acc.is_empty() {
            blocks.push(ContentBlock::Text {
                text: self.text_acc,
            });
        }
        let had_calls = !self.calls.is_empty();
        for call in self.calls {
            blocks.push(ContentBlock::ToolUse {
                id: call.id,
                name: call.name,
                input_raw: if call.arguments.is_empty() {
                    "{}".to_string()
                } else {
                    call.arguments
                },
            });
        }
        let stop_reason = match self.finish_reason {
            Some(reason) => reason,
            None if had_calls => StopReason::ToolUse,
            None => StopReason::Unknown,
        };
        ApiResponse {
            id: self.id,
            stop_reason,
            blocks,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(decoder: &mut SseDecoder, events: &[(&str, &str)]) -> String {
        let mut streamed = String::new();
        for (event, data) in events {
            decoder
                .handle_event(event, data, &mut |t| streamed.push_str(t))
                .expect("event accepted");
        }
        streamed
    }

    #[test]
    fn text_only_stream_round_trips() {
        let mut decoder = SseDecoder::new();
        let streamed = drive(
            &mut decoder,
            &[
                (
                    "message_start",
                    r#"{"type":"message_start","message":{"id":"m","usage":{"input_tokens":5}}}"#,
                ),
                (
                    "content_block_start",
                    r#"{"type":"content_block_start","index":0,"content_block":{"type":"text"}}"#,
                ),
                (
                    "content_block_delta",
                    r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#,
                ),
                (
                    "content_block_stop",
                    r#"{"type":"content_block_stop","index":0}"#,
                ),
                (
                    "message_delta",
                    r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":1}}"#,
                ),
                ("message_stop", r#"{"type":"message_stop"}"#),
            ],
        );
        assert_eq!(streamed, "hi");
        assert!(decoder.is_done());
        let response = decoder.finish();
        assert_eq!(response.id, "m");
        assert_eq!(response.blocks, vec![ContentBlock::Text { text: "hi".into() }]);
        assert_eq!(response.stop_reason, StopReason::EndTurn);
        assert_eq!(response.input_tokens, 5);
        assert_eq!(response.output_tokens, 1);
    }

    #[test]
    fn tool_use_input_concatenates_partial_json() {
        let mut decoder = SseDecoder::new();
        drive(
            &mut decoder,
            &[
                (
                    "content_block_start",
                    r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_x","name":"bash","input":{}}}"#,
                ),
                (
                    "content_block_delta",
                    r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"command"}}"#,
                ),
                (
                    "content_block_delta",
                    r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"\":\"ls\""}}"#,
                ),
                (
                    "content_block_delta",
                    r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"}"}}"#,
                ),
                (
                    "content_block_stop",
                    r#"{"type":"content_block_stop","index":0}"#,
                ),
                (
                    "message_delta",
                    r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":9}}"#,
                ),
                ("message_stop", r#"{"type":"message_stop"}"#),
            ],
        );
        let response = decoder.finish();
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(
            response.blocks,
            vec![ContentBlock::ToolUse {
                id: "toolu_x".into(),
                name: "bash".into(),
                input_raw: r#"{"command":"ls"}"#.into(),
            }]
        );
    }

    #[test]
    fn tool_use_flushes_preceding_text() {
        let mut decoder = SseDecoder::new();
        drive(
            &mut decoder,
            &[
                (
                    "content_block_delta",
                    r#"{"delta":{"type":"text_delta","text":"Let me check."}}"#,
                ),
                (
                    "content_block_start",
                    r#"{"content_block":{"type":"tool_use","id":"t1","name":"time"}}"#,
                ),
                ("content_block_stop", r#"{"index":1}"#),
                ("message_stop", "{}"),
            ],
        );
        let response = decoder.finish();
        assert_eq!(response.blocks.len(), 2);
        assert_eq!(
            response.blocks[0],
            ContentBlock::Text {
                text: "Let me check.".into()
            }
        );
        // Empty input accumulator yields the empty-object placeholder.
        assert_eq!(
            response.blocks[1],
            ContentBlock::ToolUse {
                id: "t1".into(),
                name: "time".into(),
                input_raw: "{}".into(),
            }
        );
    }

    #[test]
    fn ping_ignored_error_surfaces() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.handle_event("ping", "{}", &mut |_| {}).is_ok());
        let err = decoder
            .handle_event(
                "error",
                r#"{"type":"error","error":{"type":"overloaded_error","message":"busy"}}"#,
                &mut |_| {},
            )
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidResponse(m) if m == "busy"));
    }

    #[test]
    fn chat_chunks_accumulate_text_and_calls() {
        let mut decoder = ChatChunkDecoder::new();
        let mut streamed = String::new();
        let chunks = [
            r#"{"id":"cmpl-1","choices":[{"delta":{"role":"assistant","content":"par"},"finish_reason":null}]}"#,
            r#"{"id":"cmpl-1","choices":[{"delta":{"content":"tial"},"finish_reason":null}]}"#,
            r#"{"id":"cmpl-1","choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_9","function":{"name":"bash","arguments":"{\"comm"}}]},"finish_reason":null}]}"#,
            r#"{"id":"cmpl-1","choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"and\":\"pwd\"}"}}]},"finish_reason":"tool_calls"}]}"#,
        ];
        for chunk in chunks {
            decoder.handle_chunk(chunk, &mut |t| streamed.push_str(t));
        }
        assert_eq!(streamed, "partial");
        let response = decoder.finish();
        assert_eq!(response.id, "cmpl-1");
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(response.blocks.len(), 2);
        assert_eq!(
            response.blocks[1],
            ContentBlock::ToolUse {
                id: "call_9".into(),
                name: "bash".into(),
                input_raw: r#"{"command":"pwd"}"#.into(),
            }
        );
    }
}
