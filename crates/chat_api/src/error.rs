use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatApiError {
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),

    #[error("invalid header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP {status} {message}")]
    Status { status: StatusCode, message: String },

    #[error("response carried no body")]
    MissingBody,

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("retry exhausted after max attempts (status: {}, last_error: {last_error:?})", status_label(.status))]
    RetryExhausted {
        status: Option<StatusCode>,
        last_error: Option<String>,
    },

    #[error("stream read failed: {0}")]
    StreamRead(String),

    #[error("request was cancelled")]
    Cancelled,
}

impl ChatApiError {
    /// True for a local abort, which callers treat as silent.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

fn status_label(status: &Option<StatusCode>) -> String {
    status
        .map(|status| status.as_u16().to_string())
        .unwrap_or_else(|| "n/a".to_owned())
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    error: Option<ErrorPayloadValue>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorPayloadValue {
    Text(String),
    Fields { message: Option<String> },
}

/// Extract a human readable message from a failed response body.
///
/// Accepts `{"error":"..."}`, `{"error":{"message":"..."}}` or raw text, and
/// falls back to the status reason for empty bodies.
pub fn parse_error_message(status: StatusCode, body: &str) -> String {
    let from_json = serde_json::from_str::<ErrorPayload>(body)
        .ok()
        .and_then(|payload| payload.error)
        .and_then(|value| match value {
            ErrorPayloadValue::Text(message) => Some(message),
            ErrorPayloadValue::Fields { message } => message,
        })
        .filter(|message| !message.trim().is_empty());

    if let Some(message) = from_json {
        return message;
    }

    if body.trim().is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        body.to_string()
    }
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use super::{parse_error_message, ChatApiError};

    #[test]
    fn retry_exhausted_display_reports_missing_status() {
        let error = ChatApiError::RetryExhausted {
            status: None,
            last_error: Some("connection reset".to_string()),
        };
        assert_eq!(
            error.to_string(),
            "retry exhausted after max attempts (status: n/a, last_error: Some(\"connection reset\"))"
        );
    }

    #[test]
    fn parse_error_message_accepts_plain_string_error() {
        let message =
            parse_error_message(StatusCode::BAD_REQUEST, r#"{"error":"model not found"}"#);
        assert_eq!(message, "model not found");
    }

    #[test]
    fn parse_error_message_uses_reason_for_empty_body() {
        let message = parse_error_message(StatusCode::SERVICE_UNAVAILABLE, "");
        assert_eq!(message, "Service Unavailable");
    }
}
