use chat_api::{RequestSettings, UsageCounters};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

/// Epoch milliseconds.
pub type Millis = i64;

#[must_use]
pub fn now_millis() -> Millis {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    i64::try_from(nanos / 1_000_000).unwrap_or(i64::MAX)
}

#[must_use]
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "user" => Self::User,
            "assistant" => Self::Assistant,
            "system" => Self::System,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Running,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    pub status: ToolStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feedback {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: Millis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_uses: Vec<ToolUse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Feedback>,
    #[serde(default)]
    pub is_streaming: bool,
}

impl Message {
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            role,
            content: content.into(),
            timestamp: now_millis(),
            model: None,
            tool_uses: Vec::new(),
            feedback: None,
            is_streaming: false,
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Empty assistant message that receives streamed content.
    #[must_use]
    pub fn streaming_placeholder(model: Option<String>) -> Self {
        Self {
            model,
            is_streaming: true,
            ..Self::assistant(String::new())
        }
    }

    #[must_use]
    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }

    /// Append a tool use unless one with the same id is already present.
    pub fn start_tool(&mut self, id: &str, name: &str, input: Option<Value>) -> bool {
        if self.tool_uses.iter().any(|tool| tool.id == id) {
            return false;
        }
        self.tool_uses.push(ToolUse {
            id: id.to_string(),
            name: name.to_string(),
            input,
            status: ToolStatus::Running,
        });
        true
    }

    /// Mark a tool use complete, revising its input when one is supplied.
    ///
    /// Unknown ids leave the message untouched.
    pub fn finish_tool(&mut self, id: &str, input: Option<Value>) -> bool {
        let Some(tool) = self.tool_uses.iter_mut().find(|tool| tool.id == id) else {
            return false;
        };
        tool.status = ToolStatus::Complete;
        if input.is_some() {
            tool.input = input;
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub created_at: Millis,
    pub updated_at: Millis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<RequestSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageCounters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cumulative_usage: Option<UsageCounters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

impl Conversation {
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: new_id(),
            title: title.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            backend: None,
            model: None,
            cwd: None,
            settings: None,
            session_id: None,
            usage: None,
            cumulative_usage: None,
            agent_id: None,
        }
    }

    #[must_use]
    pub fn has_message(&self, message_id: &str) -> bool {
        self.messages.iter().any(|message| message.id == message_id)
    }

    #[must_use]
    pub fn latest_assistant(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|message| message.is_assistant())
    }

    #[must_use]
    pub fn last_user_message(&self) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
    }

    /// Whether the conversation-level settings have been captured yet.
    #[must_use]
    pub fn has_snapshot(&self) -> bool {
        self.model.is_some()
    }

    /// Record backend usage for the latest generation.
    pub fn record_usage(&mut self, usage: UsageCounters) {
        let cumulative = self.cumulative_usage.unwrap_or_default().accumulate(&usage);
        self.usage = Some(usage);
        self.cumulative_usage = Some(cumulative);
    }
}

/// Global chat settings applied to conversations that have no snapshot yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSettings {
    pub backend: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub settings: RequestSettings,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            backend: "claude".to_string(),
            model: "sonnet".to_string(),
            cwd: None,
            agent_id: None,
            settings: RequestSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratingEntry {
    pub conversation_id: String,
    pub started_at: Millis,
    pub backend: String,
}

impl GeneratingEntry {
    #[must_use]
    pub fn is_stale(&self, now: Millis, stale_after_ms: i64) -> bool {
        now.saturating_sub(self.started_at) > stale_after_ms
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Conversation, GeneratingEntry, Message, Role, ToolStatus};
    use chat_api::UsageCounters;

    #[test]
    fn tool_lifecycle_is_idempotent_by_id() {
        let mut message = Message::streaming_placeholder(Some("sonnet".to_string()));
        assert!(message.start_tool("t1", "Read", Some(json!({"path": "a"}))));
        assert!(!message.start_tool("t1", "Read", None));
        assert_eq!(message.tool_uses.len(), 1);

        assert!(message.finish_tool("t1", Some(json!({"path": "b"}))));
        assert_eq!(message.tool_uses[0].status, ToolStatus::Complete);
        assert_eq!(message.tool_uses[0].input, Some(json!({"path": "b"})));

        assert!(!message.finish_tool("missing", None));
    }

    #[test]
    fn message_ids_are_unique() {
        let first = Message::user("a");
        let second = Message::user("a");
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn usage_accumulates_across_generations() {
        let mut conversation = Conversation::new("t");
        let usage = UsageCounters {
            input_tokens: 10,
            output_tokens: 5,
            ..UsageCounters::default()
        };
        conversation.record_usage(usage);
        conversation.record_usage(usage);

        assert_eq!(conversation.usage, Some(usage));
        assert_eq!(
            conversation.cumulative_usage.map(|usage| usage.input_tokens),
            Some(20)
        );
    }

    #[test]
    fn persisted_shape_uses_camel_case() {
        let mut message = Message::new(Role::Assistant, "hi");
        message.is_streaming = true;
        let value = serde_json::to_value(&message).expect("serialize");
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["isStreaming"], true);
        assert!(value.get("toolUses").is_none());
    }

    #[test]
    fn staleness_uses_strict_threshold() {
        let entry = GeneratingEntry {
            conversation_id: "c".to_string(),
            started_at: 1_000,
            backend: "claude".to_string(),
        };
        assert!(!entry.is_stale(2_000, 1_000));
        assert!(entry.is_stale(2_001, 1_000));
    }
}
