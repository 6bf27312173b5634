//! Context-window usage of a conversation.

use chat_state::Conversation;

use crate::config::ContextThresholds;

pub const CHARS_PER_TOKEN: u64 = 4;
/// Estimated tokens contributed by each tool invocation.
pub const TOKENS_PER_TOOL_USE: u64 = 100;
/// System prompt and tool schema overhead present in every request.
pub const BASELINE_TOKENS: u64 = 3_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageLevel {
    Ok,
    Warning,
    Danger,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextUsage {
    pub tokens: u64,
    pub capacity: u64,
    pub percent: f64,
    pub level: UsageLevel,
    /// False when `tokens` comes from backend-reported counters.
    pub estimated: bool,
}

/// Usage of `conversation` against `thresholds.capacity`.
///
/// Backend-reported counters win when present; otherwise the size of the
/// message history is approximated.
#[must_use]
pub fn context_usage(conversation: &Conversation, thresholds: &ContextThresholds) -> ContextUsage {
    let reported = conversation
        .usage
        .filter(|usage| !usage.is_empty())
        .map(|usage| usage.context_tokens());
    let (tokens, estimated) = match reported {
        Some(tokens) => (tokens, false),
        None => (estimate_tokens(conversation), true),
    };

    let capacity = thresholds.capacity.max(1);
    let percent = (tokens as f64 / capacity as f64 * 100.0).min(100.0);
    let level = if percent >= thresholds.danger_percent {
        UsageLevel::Danger
    } else if percent >= thresholds.warning_percent {
        UsageLevel::Warning
    } else {
        UsageLevel::Ok
    };

    ContextUsage {
        tokens,
        capacity,
        percent,
        level,
        estimated,
    }
}

fn estimate_tokens(conversation: &Conversation) -> u64 {
    let (chars, tools) = conversation
        .messages
        .iter()
        .fold((0u64, 0u64), |(chars, tools), message| {
            (
                chars + message.content.len() as u64,
                tools + message.tool_uses.len() as u64,
            )
        });
    chars / CHARS_PER_TOKEN + tools * TOKENS_PER_TOOL_USE + BASELINE_TOKENS
}
