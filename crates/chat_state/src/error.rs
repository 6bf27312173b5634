use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatStateError {
    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse stored value for key '{key}': {source}")]
    JsonParse {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize value for key '{key}': {source}")]
    JsonSerialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown conversation '{id}'")]
    UnknownConversation { id: String },

    #[error("conversation '{conversation_id}' has no message '{message_id}'")]
    UnknownMessage {
        conversation_id: String,
        message_id: String,
    },
}

impl ChatStateError {
    #[must_use]
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    #[must_use]
    pub fn json_parse(key: impl Into<String>, source: serde_json::Error) -> Self {
        Self::JsonParse {
            key: key.into(),
            source,
        }
    }

    #[must_use]
    pub fn json_serialize(key: impl Into<String>, source: serde_json::Error) -> Self {
        Self::JsonSerialize {
            key: key.into(),
            source,
        }
    }

    #[must_use]
    pub fn unknown_conversation(id: impl Into<String>) -> Self {
        Self::UnknownConversation { id: id.into() }
    }

    #[must_use]
    pub fn unknown_message(
        conversation_id: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Self {
        Self::UnknownMessage {
            conversation_id: conversation_id.into(),
            message_id: message_id.into(),
        }
    }
}
