//! Prompt that seeds a continuation conversation.

use std::fmt::Write as _;

use chat_state::{Conversation, Role};

/// Longest excerpt of a single message carried into the prompt.
pub const MAX_MESSAGE_CHARS: usize = 2_000;

const PREAMBLE: &str = "This conversation continues an earlier one that grew too long. \
Below is a condensed transcript of it. Read it, then reply with a short summary of the goal, \
the decisions made so far and any open tasks, and continue from there.";

/// Build the first message of a conversation continuing `conversation`.
#[must_use]
pub fn compaction_prompt(conversation: &Conversation) -> String {
    let mut prompt = String::new();
    prompt.push_str(PREAMBLE);
    let _ = write!(prompt, "\n\nPrevious conversation: {}\n", conversation.title);
    if let Some(cwd) = conversation.cwd.as_deref() {
        let _ = writeln!(prompt, "Working directory: {cwd}");
    }

    for message in &conversation.messages {
        let content = message.content.trim();
        if content.is_empty() && message.tool_uses.is_empty() {
            continue;
        }
        let speaker = match message.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => "System",
        };
        let _ = write!(prompt, "\n{speaker}: {}\n", excerpt(content));
        if !message.tool_uses.is_empty() {
            let tools: Vec<&str> = message
                .tool_uses
                .iter()
                .map(|tool| tool.name.as_str())
                .collect();
            let _ = writeln!(prompt, "[tools used: {}]", tools.join(", "));
        }
    }

    prompt
}

fn excerpt(content: &str) -> String {
    if content.chars().count() <= MAX_MESSAGE_CHARS {
        return content.to_string();
    }
    let head: String = content.chars().take(MAX_MESSAGE_CHARS).collect();
    format!("{head} [...]")
}
