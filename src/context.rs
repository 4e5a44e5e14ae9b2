//! Context-window management.
//!
//! Token costs are estimated from byte counts (roughly four characters per
//! token) rather than a real tokenizer; the runtime only needs the estimate
//! to stay safely inside the provider window. When the conversation is at
//! or over budget it is pruned in-place, cheapest casualties first, always
//! preserving the first message and the most recent tail.

use crate::llm::types::{ContentBlock, Message, Role, ToolDef};

const CHARS_PER_TOKEN: usize = 4;
const MESSAGE_OVERHEAD_CHARS: usize = 10;
const TOOL_USE_OVERHEAD_CHARS: usize = 50;
const TOOL_RESULT_OVERHEAD_CHARS: usize = 30;

/// Messages at the end of the conversation that are never pruned.
const MIN_TAIL: usize = 4;

const TRUNCATION_MARKER_PREFIX: &str = "[context truncated:";

/// Estimated token cost of one content block.
pub fn estimate_block(block: &ContentBlock) -> usize {
    let chars = match block {
        ContentBlock::Text { text } => text.len(),
        ContentBlock::ToolUse {
            id,
            name,
            input_raw,
        } => id.len() + name.len() + input_raw.len() + TOOL_USE_OVERHEAD_CHARS,
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            ..
        } => tool_use_id.len() + content.len() + TOOL_RESULT_OVERHEAD_CHARS,
    };
    (chars / CHARS_PER_TOKEN).max(1)
}

/// Estimated token cost of a whole message, including per-message framing.
pub fn estimate_message(msg: &Message) -> usize {
    MESSAGE_OVERHEAD_CHARS / CHARS_PER_TOKEN
        + msg.blocks.iter().map(estimate_block).sum::<usize>()
}

/// Estimated cost of the request parts sent with every call: the system
/// prompt and the advertised tool schemas.
pub fn estimate_fixed(system_prompt: &str, tools: &[ToolDef]) -> usize {
    let mut total = (system_prompt.len() / CHARS_PER_TOKEN).max(1);
    for def in tools {
        let chars = def.name.len() + def.description.len() + def.input_schema.len();
        total += (chars / CHARS_PER_TOKEN).max(1);
    }
    total
}

/// Priority-based in-place truncation of a conversation.
pub struct ContextWindow {
    max_context_tokens: usize,
    max_tokens: usize,
    reserve: usize,
}

impl ContextWindow {
    pub fn new(max_context_tokens: usize, max_tokens: usize) -> Self {
        Self {
            max_context_tokens,
            max_tokens,
            reserve: 0,
        }
    }

    /// Record the per-request fixed overhead (system prompt + tool defs).
    pub fn with_fixed(mut self, system_prompt: &str, tools: &[ToolDef]) -> Self {
        self.reserve = estimate_fixed(system_prompt, tools);
        self
    }

    /// Conversation budget after the response cap and fixed overhead.
    pub fn budget(&self) -> usize {
        self.max_context_tokens
            .saturating_sub(self.max_tokens + self.reserve)
    }

    pub fn total(&self, conversation: &[Message]) -> usize {
        conversation.iter().map(|m| m.token_estimate).sum()
    }

    /// Prune the conversation until it fits the budget.
    ///
    /// Three ordered passes, each preserving the first message and the last
    /// four: (1) assistant messages without tool-use blocks, (2) user
    /// messages without tool-result blocks, (3) successive early messages
    /// of any kind. If the conversation still does not fit, the first
    /// message is replaced by a marker noting how many were dropped.
    /// Idempotent: a second call on an already-truncated conversation is a
    /// no-op apart from re-checking the budget.
    pub fn truncate(&self, conversation: &mut Vec<Message>) {
        let budget = self.budget();
        let mut total = self.total(conversation);
        if total < budget {
            return;
        }
        log::debug!(
            "context over budget ({total} >= {budget}), pruning {} messages",
            conversation.len()
        );

        let mut dropped = 0usize;
        prune_pass(conversation, budget, &mut total, &mut dropped, |m| {
            m.role == Role::Assistant && !m.has_tool_use()
        });
        prune_pass(conversation, budget, &mut total, &mut dropped, |m| {
            m.role == Role::User && !m.has_tool_result()
        });
        prune_pass(conversation, budget, &mut total, &mut dropped, |_| true);

        if total >= budget
            && conversation.len() > MIN_TAIL
            && !is_marker(&conversation[0])
        {
            let marker = Message::user_text(format!(
                "{TRUNCATION_MARKER_PREFIX} {} earlier messages dropped]",
                dropped + 1
            ));
            conversation[0] = marker;
        }
    }
}

fn is_marker(msg: &Message) -> bool {
    msg.text().starts_with(TRUNCATION_MARKER_PREFIX)
}

/// Remove messages matching `keep_out` between the first message and the
/// protected tail, stopping as soon as the conversation fits.
fn prune_pass(
    conversation: &mut Vec<Message>,
    budget: usize,
    total: &mut usize,
    dropped: &mut usize,
    keep_out: impl Fn(&Message) -> bool,
) {
    let mut i = 1;
    while *total >= budget && i + MIN_TAIL < conversation.len() {
        if keep_out(&conversation[i]) {
            *total -= conversation[i].token_estimate;
            conversation.remove(i);
            *dropped += 1;
        } else {
            i += 1;
        }
    }
}
