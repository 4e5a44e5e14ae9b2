//! Conversation model shared by the client, the dispatcher, and the loop.

use std::fmt;

/// Message role in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One atom of a message: text, a tool call, or a tool result.
///
/// `input_raw` keeps the call arguments as the verbatim JSON object string
/// so they can be echoed back to provider APIs byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input_raw: String,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn is_tool_use(&self) -> bool {
        matches!(self, ContentBlock::ToolUse { .. })
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, ContentBlock::ToolResult { .. })
    }
}

/// A single conversation turn.
///
/// Invariants (held by the loop, relied on by request assembly): a user
/// message carries text and/or tool-result blocks; an assistant message
/// carries text and/or tool-use blocks; every assistant message with
/// tool-use blocks is immediately followed by a user message with one
/// tool-result per tool-use, in the same order.
#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub blocks: Vec<ContentBlock>,
    pub token_estimate: usize,
}

impl Message {
    pub fn new(role: Role, blocks: Vec<ContentBlock>) -> Self {
        let mut msg = Self {
            role,
            blocks,
            token_estimate: 0,
        };
        msg.token_estimate = crate::context::estimate_message(&msg);
        msg
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentBlock::Text { text: text.into() }])
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::new(
            Role::Assistant,
            vec![ContentBlock::Text { text: text.into() }],
        )
    }

    pub fn has_tool_use(&self) -> bool {
        self.blocks.iter().any(ContentBlock::is_tool_use)
    }

    pub fn has_tool_result(&self) -> bool {
        self.blocks.iter().any(ContentBlock::is_tool_result)
    }

    /// Concatenated text content, for display.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.blocks {
            if let ContentBlock::Text { text } = block {
                out.push_str(text);
            }
        }
        out
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Unknown,
}

impl StopReason {
    /// Map a provider stop/finish string into the common set.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "end_turn" | "stop_sequence" | "stop" => StopReason::EndTurn,
            "tool_use" | "tool_calls" => StopReason::ToolUse,
            "max_tokens" | "length" => StopReason::MaxTokens,
            _ => StopReason::Unknown,
        }
    }
}

/// A parsed model response in the common content-block model.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub id: String,
    pub stop_reason: StopReason,
    pub blocks: Vec<ContentBlock>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl ApiResponse {
    /// Concatenated text content of the response.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.blocks {
            if let ContentBlock::Text { text } = block {
                out.push_str(text);
            }
        }
        out
    }
}

/// Wire dialect spoken by the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Claude,
    #[serde(rename = "openai")]
    OpenAiStyle,
    Ollama,
}

impl Provider {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Provider::Claude => "https://api.anthropic.com",
            Provider::OpenAiStyle => "https://api.openai.com",
            Provider::Ollama => "http://localhost:11434",
        }
    }

    pub fn messages_path(&self) -> &'static str {
        match self {
            Provider::Claude => "/v1/messages",
            Provider::OpenAiStyle => "/v1/chat/completions",
            Provider::Ollama => "/api/chat",
        }
    }

    /// Streaming is contractually off for Ollama.
    pub fn supports_streaming(&self) -> bool {
        !matches!(self, Provider::Ollama)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Claude => "claude",
            Provider::OpenAiStyle => "openai",
            Provider::Ollama => "ollama",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "claude" | "anthropic" => Some(Provider::Claude),
            "openai" => Some(Provider::OpenAiStyle),
            "ollama" => Some(Provider::Ollama),
            _ => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tool definition advertised to the model. The schema is a raw JSON
/// Schema string embedded at build time.
#[derive(Debug, Clone)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: String,
}
