use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Role/content pair sent as model-facing history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
}

impl WireMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Generation settings forwarded to the backend.
///
/// `extra` carries backend-specific keys and is flattened into the same JSON
/// object as the well-known fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub additional_dirs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Body of the generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub messages: Vec<WireMessage>,
    pub backend: String,
    pub model: String,
    pub conversation_id: String,
    pub settings: RequestSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Server-persisted history of one conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    #[serde(default)]
    pub messages: Vec<TranscriptMessage>,
}

impl Transcript {
    /// Most recent assistant message by timestamp; later entries win ties.
    #[must_use]
    pub fn latest_assistant(&self) -> Option<&TranscriptMessage> {
        self.messages
            .iter()
            .filter(|message| message.role == "assistant")
            .fold(None, |latest: Option<&TranscriptMessage>, message| match latest {
                Some(current) if current.ts > message.ts => Some(current),
                _ => Some(message),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub content: String,
    /// Epoch milliseconds. Accepts a number or an RFC 3339 string on input.
    #[serde(deserialize_with = "deserialize_timestamp_millis")]
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Integer(i64),
    Float(f64),
    Text(String),
}

fn deserialize_timestamp_millis<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match RawTimestamp::deserialize(deserializer)? {
        RawTimestamp::Integer(value) => Ok(value),
        RawTimestamp::Float(value) => Ok(value as i64),
        RawTimestamp::Text(value) => parse_timestamp_millis(&value).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid transcript timestamp: {value}"))
        }),
    }
}

/// Parse an RFC 3339 string or a decimal epoch-millisecond string.
pub fn parse_timestamp_millis(value: &str) -> Option<i64> {
    let value = value.trim();
    if let Ok(millis) = value.parse::<i64>() {
        return Some(millis);
    }

    let parsed = OffsetDateTime::parse(value, &Rfc3339).ok()?;
    i64::try_from(parsed.unix_timestamp_nanos() / 1_000_000).ok()
}
