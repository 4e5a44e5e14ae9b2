//! The ReAct loop: think (model call), act (tool dispatch), observe
//! (result feedback), repeated until the model ends its turn or a bound
//! is hit.
//!
//! Tool failures are observations and never abort the loop; only model and
//! transport failures surface as errors. A fixed-size ring of call
//! fingerprints catches the model reissuing the same call and answers it
//! with a synthetic error instead of dispatching again.

use crate::config::Config;
use crate::context::ContextWindow;
use crate::error::ClientError;
use crate::llm::client::LlmClient;
use crate::llm::types::{ApiResponse, ContentBlock, Message, Role, StopReason, ToolDef};
use crate::tools::{Dispatcher, ToolResult};

/// Hard per-run bound on think/act iterations.
pub const MAX_ITERATIONS: usize = 10;

const SIGNATURE_SLOTS: usize = 8;
/// Pre-insert match count at which a call is suppressed.
const REPEAT_THRESHOLD: usize = 2;

const REPEAT_MESSAGE: &str =
    "Repeated identical tool call detected. Try a different approach.";

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Ring of 128-bit call fingerprints for stuck-loop detection.
pub struct LoopDetector {
    ring: [(u64, u64); SIGNATURE_SLOTS],
    idx: usize,
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self {
            ring: [(0, 0); SIGNATURE_SLOTS],
            idx: 0,
        }
    }
}

impl LoopDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a call and report whether it has already appeared at least
    /// twice among the remembered calls.
    pub fn check_and_record(&mut self, name: &str, input_raw: &str) -> bool {
        let signature = (fnv1a(name.as_bytes()), fnv1a(input_raw.as_bytes()));
        let matches = self.ring.iter().filter(|&&s| s == signature).count();
        self.ring[self.idx % SIGNATURE_SLOTS] = signature;
        self.idx += 1;
        matches >= REPEAT_THRESHOLD
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    /// The model finished its turn.
    Done,
    /// The response was cut off by the token cap.
    MaxTokens,
    /// The iteration bound was hit while tools were still being requested.
    IterationLimit,
}

#[derive(Debug)]
pub struct AgentOutcome {
    pub reply: String,
    pub status: LoopStatus,
}

enum Classification {
    NeedsObservation,
    MaxTokens,
    Done,
}

fn classify(response: &ApiResponse) -> Classification {
    if response.blocks.iter().any(ContentBlock::is_tool_use) {
        Classification::NeedsObservation
    } else if response.stop_reason == StopReason::MaxTokens {
        Classification::MaxTokens
    } else {
        Classification::Done
    }
}

/// Run every tool-use block in emission order, producing one tool-result
/// block per call in the same order. Repeats are answered synthetically
/// without dispatching.
async fn execute_tool_uses(
    detector: &mut LoopDetector,
    dispatcher: &Dispatcher,
    blocks: &[ContentBlock],
) -> Vec<ContentBlock> {
    let mut results = Vec::new();
    for block in blocks {
        let ContentBlock::ToolUse {
            id,
            name,
            input_raw,
        } = block
        else {
            continue;
        };
        let result = if detector.check_and_record(name, input_raw) {
            log::warn!("suppressing repeated call to {name}");
            ToolResult::error(REPEAT_MESSAGE)
        } else {
            log::debug!("dispatching {name}");
            dispatcher.execute(name, input_raw).await
        };
        results.push(ContentBlock::ToolResult {
            tool_use_id: id.clone(),
            content: result.output,
            is_error: result.is_error,
        });
    }
    results
}

/// One agent: a conversation, a client, and a tool dispatcher.
///
/// The conversation lives for the agent's lifetime and is mutated only
/// here: assistant/user messages are appended per iteration and the
/// context window truncates in place.
pub struct Agent {
    client: LlmClient,
    dispatcher: Dispatcher,
    window: ContextWindow,
    detector: LoopDetector,
    conversation: Vec<Message>,
    tool_defs: Vec<ToolDef>,
    max_turns: usize,
}

impl Agent {
    pub fn new(config: &Config, client: LlmClient, dispatcher: Dispatcher) -> Self {
        let tool_defs = dispatcher.definitions();
        let window = ContextWindow::new(config.max_context_tokens, config.max_tokens as usize)
            .with_fixed(&config.system_prompt, &tool_defs);
        Self {
            client,
            dispatcher,
            window,
            detector: LoopDetector::new(),
            conversation: Vec::new(),
            tool_defs,
            max_turns: config.max_turns,
        }
    }

    pub fn conversation(&self) -> &[Message] {
        &self.conversation
    }

    pub fn client(&self) -> &LlmClient {
        &self.client
    }

    /// Drive the loop for one user prompt. `on_delta` receives streamed
    /// text fragments (all at once when the carrier cannot stream).
    pub async fn run(
        &mut self,
        prompt: &str,
        on_delta: &mut dyn FnMut(&str),
    ) -> Result<AgentOutcome, ClientError> {
        self.conversation.push(Message::user_text(prompt));
        let limit = MAX_ITERATIONS.min(self.max_turns.max(1));
        let mut reply = String::new();

        for iteration in 0..limit {
            self.window.truncate(&mut self.conversation);
            let response = self
                .client
                .send_streaming(&self.conversation, &self.tool_defs, on_delta)
                .await?;
            log::debug!(
                "iteration {iteration}: stop={:?} blocks={} tokens={}+{}",
                response.stop_reason,
                response.blocks.len(),
                response.input_tokens,
                response.output_tokens,
            );

            let text = response.text();
            if !text.is_empty() {
                reply = text;
            }
            self.conversation
                .push(Message::new(Role::Assistant, response.blocks.clone()));

            match classify(&response) {
                Classification::Done => {
                    return Ok(AgentOutcome {
                        reply,
                        status: LoopStatus::Done,
                    })
                }
                Classification::MaxTokens => {
                    return Ok(AgentOutcome {
                        reply,
                        status: LoopStatus::MaxTokens,
                    })
                }
                Classification::NeedsObservation => {
                    let results = execute_tool_uses(
                        &mut self.detector,
                        &self.dispatcher,
                        &response.blocks,
                    )
                    .await;
                    self.conversation.push(Message::new(Role::User, results));
                }
            }
        }

        log::warn!("iteration limit reached after {limit} rounds");
        Ok(AgentOutcome {
            reply,
            status: LoopStatus::IterationLimit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolContext;

    fn tool_use(name: &str, input_raw: &str) -> ContentBlock {
        ContentBlock::ToolUse {
            id: format!("toolu_{}", name.len()),
            name: name.to_string(),
            input_raw: input_raw.to_string(),
        }
    }

    #[test]
    fn fnv1a_matches_reference_vectors() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a(b"foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn third_identical_call_is_repeat() {
        let mut detector = LoopDetector::new();
        assert!(!detector.check_and_record("bash", r#"{"command":"ls"}"#));
        assert!(!detector.check_and_record("bash", r#"{"command":"ls"}"#));
        assert!(detector.check_and_record("bash", r#"{"command":"ls"}"#));
        // Different input is a different signature.
        assert!(!detector.check_and_record("bash", r#"{"command":"pwd"}"#));
    }

    #[test]
    fn ring_forgets_old_signatures() {
        let mut detector = LoopDetector::new();
        detector.check_and_record("bash", "{}");
        detector.check_and_record("bash", "{}");
        // Eight distinct calls push both earlier entries out of the ring.
        for i in 0..8 {
            detector.check_and_record("time", &format!("{{\"n\":{i}}}"));
        }
        assert!(!detector.check_and_record("bash", "{}"));
    }

    #[test]
    fn classification_order() {
        let tool_response = ApiResponse {
            id: String::new(),
            stop_reason: StopReason::MaxTokens,
            blocks: vec![tool_use("bash", "{}")],
            input_tokens: 0,
            output_tokens: 0,
        };
        // Tool use wins even when the stop reason says max_tokens.
        assert!(matches!(
            classify(&tool_response),
            Classification::NeedsObservation
        ));

        let cut_off = ApiResponse {
            stop_reason: StopReason::MaxTokens,
            blocks: vec![ContentBlock::Text { text: "par".into() }],
            ..tool_response.clone()
        };
        assert!(matches!(classify(&cut_off), Classification::MaxTokens));

        let done = ApiResponse {
            stop_reason: StopReason::EndTurn,
            blocks: vec![ContentBlock::Text { text: "hi".into() }],
            ..cut_off.clone()
        };
        assert!(matches!(classify(&done), Classification::Done));
    }

    #[tokio::test]
    async fn repeated_calls_are_answered_without_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = Dispatcher::new(ToolContext::for_tests(dir.path().to_path_buf()));
        let mut detector = LoopDetector::new();
        // The same kv_set call three times: the third must not touch the
        // store, so write a file-backed observable effect each time.
        let call = r#"{"key":"counter","value":"x"}"#;
        let blocks = vec![ContentBlock::ToolUse {
            id: "t1".into(),
            name: "kv_set".into(),
            input_raw: call.into(),
        }];

        let first = execute_tool_uses(&mut detector, &dispatcher, &blocks).await;
        let second = execute_tool_uses(&mut detector, &dispatcher, &blocks).await;
        let third = execute_tool_uses(&mut detector, &dispatcher, &blocks).await;

        for (round, results) in [&first, &second].iter().enumerate() {
            match &results[0] {
                ContentBlock::ToolResult {
                    is_error, content, ..
                } => {
                    assert!(!is_error, "round {round}: {content}");
                }
                other => panic!("unexpected block {other:?}"),
            }
        }
        match &third[0] {
            ContentBlock::ToolResult {
                is_error,
                content,
                tool_use_id,
            } => {
                assert!(is_error);
                assert_eq!(content, REPEAT_MESSAGE);
                assert_eq!(tool_use_id, "t1");
            }
            other => panic!("unexpected block {other:?}"),
        }
    }

    #[tokio::test]
    async fn results_keep_emission_order() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = Dispatcher::new(ToolContext::for_tests(dir.path().to_path_buf()));
        let mut detector = LoopDetector::new();
        let blocks = vec![
            ContentBlock::Text {
                text: "running two tools".into(),
            },
            ContentBlock::ToolUse {
                id: "t1".into(),
                name: "time".into(),
                input_raw: "{}".into(),
            },
            ContentBlock::ToolUse {
                id: "t2".into(),
                name: "kv_get".into(),
                input_raw: r#"{"key":"absent"}"#.into(),
            },
        ];
        let results = execute_tool_uses(&mut detector, &dispatcher, &blocks).await;
        assert_eq!(results.len(), 2);
        assert!(matches!(
            &results[0],
            ContentBlock::ToolResult { tool_use_id, is_error: false, .. } if tool_use_id == "t1"
        ));
        assert!(matches!(
            &results[1],
            ContentBlock::ToolResult { tool_use_id, is_error: true, .. } if tool_use_id == "t2"
        ));
    }
}
