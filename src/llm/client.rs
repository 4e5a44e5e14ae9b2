//! LLM client: builds provider-specific request bodies, carries them over
//! the configured transport, and parses either a full response document or
//! a streamed SSE sequence into the common content-block model.
//!
//! Request bodies are assembled with the byte-level writer so tool inputs
//! and schemas pass through verbatim; responses are read with the key
//! extractor. Failures are never retried here; the driver decides.

use eventsource_stream::Eventsource;
use futures::StreamExt;

use crate::config::{Config, APP_DIR, BRIDGE_SOCKET};
use crate::error::{ClientError, TransportError};
use crate::json::{self, JsonWriter};
use crate::llm::sse::{ChatChunkDecoder, SseDecoder};
use crate::llm::types::{ApiResponse, ContentBlock, Message, Provider, StopReason, ToolDef};
use crate::transport::{self, RemoteEndpoint, Transport, TransportKind};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct LlmClient {
    provider: Provider,
    model: String,
    api_key: String,
    base_url: String,
    max_tokens: u64,
    system_prompt: String,
    streaming: bool,
    transport: TransportKind,
    remote: Option<RemoteEndpoint>,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn from_config(config: &Config) -> Self {
        let remote = match config.transport {
            TransportKind::Http => None,
            TransportKind::Serial => Some(RemoteEndpoint::Serial {
                port: config.serial_port.clone().unwrap_or_default(),
                baud: config.serial_baud,
            }),
            TransportKind::Ble => Some(RemoteEndpoint::Ble {
                socket_path: std::path::Path::new(APP_DIR).join(BRIDGE_SOCKET),
            }),
        };
        Self {
            provider: config.provider,
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            base_url: config.base_url(),
            max_tokens: config.max_tokens,
            system_prompt: config.system_prompt.clone(),
            streaming: config.streaming,
            transport: config.transport,
            remote,
            http: reqwest::Client::new(),
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Whether `send_streaming` will actually stream rather than fall back.
    pub fn can_stream(&self) -> bool {
        self.streaming
            && self.provider.supports_streaming()
            && self.transport == TransportKind::Http
    }

    /// One-shot request/response.
    pub async fn send(
        &self,
        messages: &[Message],
        tools: &[ToolDef],
    ) -> Result<ApiResponse, ClientError> {
        let body = self.build_request_body(messages, tools, false);
        let raw = match &self.remote {
            None => {
                let mut transport = transport::HttpTransport::new(
                    self.http.clone(),
                    self.endpoint_url(),
                    self.auth_headers(),
                );
                let result = transport.send(body.as_bytes()).await;
                transport.close().await;
                String::from_utf8(map_transport(result)?)
                    .map_err(|_| ClientError::InvalidResponse("non-UTF-8 response".into()))?
            }
            Some(endpoint) => self.send_remote(endpoint, &body).await?,
        };
        self.parse_response(&raw)
    }

    /// Streaming request: `on_delta` is invoked synchronously with every
    /// text fragment as it arrives. Carriers and dialects that cannot
    /// stream fall back to a plain send and replay the text once.
    pub async fn send_streaming(
        &self,
        messages: &[Message],
        tools: &[ToolDef],
        on_delta: &mut dyn FnMut(&str),
    ) -> Result<ApiResponse, ClientError> {
        if !self.can_stream() {
            let response = self.send(messages, tools).await?;
            let text = response.text();
            if !text.is_empty() {
                on_delta(&text);
            }
            return Ok(response);
        }

        let body = self.build_request_body(messages, tools, true);
        let response = self.http_post(&body).await?;
        let events = response.bytes_stream().eventsource();
        futures::pin_mut!(events);

        match self.provider {
            Provider::Claude => {
                let mut decoder = SseDecoder::new();
                while let Some(event) = events.next().await {
                    let event =
                        event.map_err(|e| ClientError::ParseError(e.to_string()))?;
                    if event.data.trim().is_empty() {
                        continue;
                    }
                    decoder.handle_event(&event.event, &event.data, on_delta)?;
                    if decoder.is_done() {
                        break;
                    }
                }
                Ok(decoder.finish())
            }
            Provider::OpenAiStyle => {
                let mut decoder = ChatChunkDecoder::new();
                while let Some(event) = events.next().await {
                    let event =
                        event.map_err(|e| ClientError::ParseError(e.to_string()))?;
                    let data = event.data.trim();
                    if data.is_empty() {
                        continue;
                    }
                    if data == "[DONE]" {
                        break;
                    }
                    decoder.handle_chunk(data, on_delta);
                }
                Ok(decoder.finish())
            }
            Provider::Ollama => unreachable!("ollama never streams"),
        }
    }

    fn endpoint_url(&self) -> String {
        format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            self.provider.messages_path()
        )
    }

    fn auth_headers(&self) -> Vec<(String, String)> {
        match self.provider {
            Provider::Claude => vec![
                ("x-api-key".into(), self.api_key.clone()),
                ("anthropic-version".into(), ANTHROPIC_VERSION.into()),
            ],
            Provider::OpenAiStyle => {
                if self.api_key.is_empty() {
                    Vec::new()
                } else {
                    vec![("authorization".into(), format!("Bearer {}", self.api_key))]
                }
            }
            Provider::Ollama => Vec::new(),
        }
    }

    async fn http_post(&self, body: &str) -> Result<reqwest::Response, ClientError> {
        let mut request = self
            .http
            .post(self.endpoint_url())
            .header("content-type", "application/json");
        for (name, value) in self.auth_headers() {
            request = request.header(name, value);
        }
        let response = request.body(body.to_string()).send().await.map_err(|e| {
            if e.is_connect() {
                ClientError::ConnectionRefused(e.to_string())
            } else {
                ClientError::Network(e)
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::from_status(status.as_u16(), body));
        }
        Ok(response)
    }

    /// Send the request body through the bridge as an RPC envelope.
    async fn send_remote(
        &self,
        endpoint: &RemoteEndpoint,
        body: &str,
    ) -> Result<String, ClientError> {
        let mut writer = JsonWriter::with_capacity(body.len() + 64);
        writer
            .begin_object()
            .field_string("type", "api")
            .field_string("provider", self.provider.as_str())
            .field_raw("body", body)
            .end_object();
        let envelope = writer.finish();

        let mut transport = map_transport(transport::open_remote(endpoint).await)?;
        let result = transport.send(envelope.as_bytes()).await;
        transport.close().await;

        let reply = String::from_utf8(map_transport(result)?)
            .map_err(|_| ClientError::InvalidResponse("non-UTF-8 envelope".into()))?;
        if let Some(error) = json::extract_string(&reply, "error") {
            return Err(ClientError::InvalidResponse(json::unescape(error)));
        }
        json::extract_object(&reply, "body")
            .map(str::to_string)
            .ok_or_else(|| ClientError::InvalidResponse("envelope missing body".into()))
    }

    // ---------------------------------------------------------------
    // Request assembly
    // ---------------------------------------------------------------

    pub(crate) fn build_request_body(
        &self,
        messages: &[Message],
        tools: &[ToolDef],
        stream: bool,
    ) -> String {
        match self.provider {
            Provider::Claude => self.build_claude_body(messages, tools, stream),
            Provider::OpenAiStyle | Provider::Ollama => {
                self.build_chat_body(messages, tools, stream)
            }
        }
    }

    fn build_claude_body(
        &self,
        messages: &[Message],
        tools: &[ToolDef],
        stream: bool,
    ) -> String {
        let mut w = JsonWriter::with_capacity(1024);
        w.begin_object()
            .field_string("model", &self.model)
            .field_u64("max_tokens", self.max_tokens);
        if stream {
            w.field_bool("stream", true);
        }
        if !self.system_prompt.is_empty() {
            w.field_string("system", &self.system_prompt);
        }
        if !tools.is_empty() {
            w.key("tools").begin_array();
            for def in tools {
                w.begin_object()
                    .field_string("name", &def.name)
                    .field_string("description", &def.description)
                    .field_raw("input_schema", &def.input_schema)
                    .end_object();
            }
            w.end_array();
        }
        w.key("messages").begin_array();
        for message in messages {
            w.begin_object()
                .field_string("role", message.role.as_str())
                .key("content")
                .begin_array();
            for block in &message.blocks {
                match block {
                    ContentBlock::Text { text } => {
                        w.begin_object()
                            .field_string("type", "text")
                            .field_string("text", text)
                            .end_object();
                    }
                    ContentBlock::ToolUse {
                        id,
                        name,
                        input_raw,
                    } => {
                        w.begin_object()
                            .field_string("type", "tool_use")
                            .field_string("id", id)
                            .field_string("name", name)
                            .field_raw("input", input_raw)
                            .end_object();
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => {
                        w.begin_object()
                            .field_string("type", "tool_result")
                            .field_string("tool_use_id", tool_use_id)
                            .field_string("content", content)
                            .field_bool("is_error", *is_error)
                            .end_object();
                    }
                }
            }
            w.end_array().end_object();
        }
        w.end_array().end_object();
        w.finish()
    }

    /// OpenAI-style body, also used for Ollama (which never streams).
    fn build_chat_body(&self, messages: &[Message], tools: &[ToolDef], stream: bool) -> String {
        let mut w = JsonWriter::with_capacity(1024);
        w.begin_object().field_string("model", &self.model);
        if self.provider == Provider::OpenAiStyle {
            w.field_u64("max_tokens", self.max_tokens);
        }
        w.field_bool("stream", stream && self.provider.supports_streaming());
        if !tools.is_empty() {
            w.key("tools").begin_array();
            for def in tools {
                w.begin_object()
                    .field_string("type", "function")
                    .key("function")
                    .begin_object()
                    .field_string("name", &def.name)
                    .field_string("description", &def.description)
                    .field_raw("parameters", &def.input_schema)
                    .end_object()
                    .end_object();
            }
            w.end_array();
        }
        w.key("messages").begin_array();
        if !self.system_prompt.is_empty() {
            w.begin_object()
                .field_string("role", "system")
                .field_string("content", &self.system_prompt)
                .end_object();
        }
        for message in messages {
            match message.role {
                crate::llm::types::Role::Assistant => {
                    w.begin_object().field_string("role", "assistant");
                    let text = message.text();
                    if !text.is_empty() {
                        w.field_string("content", &text);
                    }
                    if message.has_tool_use() {
                        w.key("tool_calls").begin_array();
                        for block in &message.blocks {
                            if let ContentBlock::ToolUse {
                                id,
                                name,
                                input_raw,
                            } = block
                            {
                                w.begin_object()
                                    .field_string("id", id)
                                    .field_string("type", "function")
                                    .key("function")
                                    .begin_object()
                                    .field_string("name", name)
                                    // Arguments travel as a JSON string.
                                    .field_string("arguments", input_raw)
                                    .end_object()
                                    .end_object();
                            }
                        }
                        w.end_array();
                    }
                    w.end_object();
                }
                _ => {
                    // Tool results become their own `tool` messages, in
                    // block order, after the owning assistant message.
                    for block in &message.blocks {
                        if let ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            ..
                        } = block
                        {
                            w.begin_object()
                                .field_string("role", "tool")
                                .field_string("tool_call_id", tool_use_id)
                                .field_string("content", content)
                                .end_object();
                        }
                    }
                    let text = message.text();
                    if !text.is_empty() {
                        w.begin_object()
                            .field_string("role", message.role.as_str())
                            .field_string("content", &text)
                            .end_object();
                    }
                }
            }
        }
        w.end_array().end_object();
        w.finish()
    }

    // ---------------------------------------------------------------
    // Response parsing
    // ---------------------------------------------------------------

    pub(crate) fn parse_response(&self, body: &str) -> Result<ApiResponse, ClientError> {
        match self.provider {
            Provider::Claude => parse_claude_response(body),
            Provider::OpenAiStyle => parse_chat_response(body),
            Provider::Ollama => parse_ollama_response(body),
        }
    }
}

fn map_transport<T>(result: Result<T, TransportError>) -> Result<T, ClientError> {
    result.map_err(|e| match e {
        TransportError::Http { status, body } => ClientError::from_status(status, body),
        TransportError::ConnectionRefused(msg) => ClientError::ConnectionRefused(msg),
        other => ClientError::Transport(other),
    })
}

fn parse_claude_response(body: &str) -> Result<ApiResponse, ClientError> {
    let content = json::extract_array(body, "content")
        .ok_or_else(|| ClientError::InvalidResponse("missing content array".into()))?;
    let mut blocks = Vec::new();
    for item in json::array_items(content) {
        match json::extract_string(item, "type") {
            Some("text") => {
                let text = json::extract_string(item, "text")
                    .ok_or_else(|| ClientError::ParseError("text block without text".into()))?;
                blocks.push(ContentBlock::Text {
                    text: json::unescape(text),
                });
            }
            Some("tool_use") => {
                let id = json::extract_string(item, "id")
                    .ok_or_else(|| ClientError::ParseError("tool_use without id".into()))?;
                let name = json::extract_string(item, "name")
                    .ok_or_else(|| ClientError::ParseError("tool_use without name".into()))?;
                let input_raw = json::extract_object(item, "input").unwrap_or("{}");
                blocks.push(ContentBlock::ToolUse {
                    id: json::unescape(id),
                    name: json::unescape(name),
                    input_raw: input_raw.to_string(),
                });
            }
            _ => {}
        }
    }
    Ok(ApiResponse {
        id: json::extract_string(body, "id")
            .map(json::unescape)
            .unwrap_or_default(),
        stop_reason: json::extract_string(body, "stop_reason")
            .map(StopReason::parse)
            .unwrap_or(StopReason::Unknown),
        blocks,
        input_tokens: json::extract_u64(body, "input_tokens").unwrap_or(0),
        output_tokens: json::extract_u64(body, "output_tokens").unwrap_or(0),
    })
}

fn parse_chat_response(body: &str) -> Result<ApiResponse, ClientError> {
    let choices = json::extract_array(body, "choices")
        .ok_or_else(|| ClientError::InvalidResponse("missing choices".into()))?;
    let first = json::array_items(choices)
        .into_iter()
        .next()
        .ok_or_else(|| ClientError::InvalidResponse("empty choices".into()))?;
    let message = json::extract_object(first, "message")
        .ok_or_else(|| ClientError::InvalidResponse("choice without message".into()))?;

    let mut blocks = Vec::new();
    if let Some(text) = json::extract_string(message, "content") {
        let text = json::unescape(text);
        if !text.is_empty() {
            blocks.push(ContentBlock::Text { text });
        }
    }
    let mut saw_calls = false;
    if let Some(calls) = json::extract_array(message, "tool_calls") {
        for (i, item) in json::array_items(calls).into_iter().enumerate() {
            let function = json::extract_object(item, "function").unwrap_or("{}");
            let arguments = json::extract_string(function, "arguments")
                .map(json::unescape)
                .filter(|a| !a.is_empty())
                .unwrap_or_else(|| "{}".to_string());
            blocks.push(ContentBlock::ToolUse {
                id: json::extract_string(item, "id")
                    .map(json::unescape)
                    .unwrap_or_else(|| format!("call_{i}")),
                name: json::extract_string(function, "name")
                    .map(json::unescape)
                    .unwrap_or_default(),
                input_raw: arguments,
            });
            saw_calls = true;
        }
    }

    let stop_reason = json::extract_string(first, "finish_reason")
        .map(StopReason::parse)
        .unwrap_or(if saw_calls {
            StopReason::ToolUse
        } else {
            StopReason::Unknown
        });
    Ok(ApiResponse {
        id: json::extract_string(body, "id")
            .map(json::unescape)
            .unwrap_or_default(),
        stop_reason,
        blocks,
        input_tokens: json::extract_u64(body, "prompt_tokens").unwrap_or(0),
        output_tokens: json::extract_u64(body, "completion_tokens").unwrap_or(0),
    })
}

fn parse_ollama_response(body: &str) -> Result<ApiResponse, ClientError> {
    let message = json::extract_object(body, "message")
        .ok_or_else(|| ClientError::InvalidResponse("missing message".into()))?;
    let mut blocks = Vec::new();
    if let Some(text) = json::extract_string(message, "content") {
        let text = json::unescape(text);
        if !text.is_empty() {
            blocks.push(ContentBlock::Text { text });
        }
    }
    let mut saw_calls = false;
    if let Some(calls) = json::extract_array(message, "tool_calls") {
        for (i, item) in json::array_items(calls).into_iter().enumerate() {
            let function = json::extract_object(item, "function").unwrap_or("{}");
            // Ollama sends arguments as an object and no call ids.
            let input_raw = json::extract_object(function, "arguments")
                .unwrap_or("{}")
                .to_string();
            blocks.push(ContentBlock::ToolUse {
                id: format!("call_{i}"),
                name: json::extract_string(function, "name")
                    .map(json::unescape)
                    .unwrap_or_default(),
                input_raw,
            });
            saw_calls = true;
        }
    }
    let stop_reason = if saw_calls {
        StopReason::ToolUse
    } else {
        json::extract_string(body, "done_reason")
            .map(StopReason::parse)
            .unwrap_or(StopReason::EndTurn)
    };
    Ok(ApiResponse {
        id: String::new(),
        stop_reason,
        blocks,
        input_tokens: json::extract_u64(body, "prompt_eval_count").unwrap_or(0),
        output_tokens: json::extract_u64(body, "eval_count").unwrap_or(0),
    })
}
