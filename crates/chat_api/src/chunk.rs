use serde::{Deserialize, Serialize};

/// Token accounting reported by the backend for one generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UsageCounters {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
}

impl UsageCounters {
    /// Tokens occupying the context window after this generation.
    #[must_use]
    pub fn context_tokens(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.output_tokens)
            .saturating_add(self.cache_read_input_tokens)
            .saturating_add(self.cache_creation_input_tokens)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.context_tokens() == 0
    }

    /// Field-wise saturating sum, used for cumulative counters.
    #[must_use]
    pub fn accumulate(&self, other: &Self) -> Self {
        Self {
            input_tokens: self.input_tokens.saturating_add(other.input_tokens),
            output_tokens: self.output_tokens.saturating_add(other.output_tokens),
            cache_read_input_tokens: self
                .cache_read_input_tokens
                .saturating_add(other.cache_read_input_tokens),
            cache_creation_input_tokens: self
                .cache_creation_input_tokens
                .saturating_add(other.cache_creation_input_tokens),
        }
    }
}

/// One JSON payload carried by a `data:` line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageCounters>,
}

impl StreamPayload {
    #[must_use]
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Self::default()
        }
    }

    /// True when the payload itself announces the end of the stream.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.unwrap_or(false)
    }
}

/// Unit produced by the stream decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedChunk {
    Payload(StreamPayload),
    /// The terminal sentinel was observed. Nothing follows it.
    Done,
}

impl DecodedChunk {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Done => true,
            Self::Payload(payload) => payload.is_done(),
        }
    }
}
