use url::Url;

use crate::error::ChatApiError;

/// Default base URL for the local generation backend.
pub const DEFAULT_BASE_URL: &str = "http://localhost:3000";

const GENERATE_SEGMENTS: [&str; 2] = ["api", "chat"];

/// Normalize a configured base URL to the server root.
///
/// Normalization rules:
/// 1) blank input falls back to [`DEFAULT_BASE_URL`]
/// 2) trailing slashes are dropped
/// 3) a trailing `/api/chat` or `/api` is stripped so either the root or an
///    endpoint URL may be configured
pub fn normalize_base_url(input: &str) -> String {
    let base = if input.trim().is_empty() {
        DEFAULT_BASE_URL
    } else {
        input.trim()
    };

    let trimmed = base.trim_end_matches('/');
    let trimmed = trimmed.strip_suffix("/api/chat").unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix("/api").unwrap_or(trimmed);
    trimmed.to_string()
}

/// Endpoint that opens a generation stream.
pub fn generation_url(base_url: &str) -> Result<Url, ChatApiError> {
    endpoint(base_url, &GENERATE_SEGMENTS)
}

/// Endpoint serving the server-persisted transcript of one conversation.
///
/// The id is pushed as a single path segment, so it is percent-encoded.
pub fn transcript_url(base_url: &str, conversation_id: &str) -> Result<Url, ChatApiError> {
    endpoint(
        base_url,
        &["api", "conversations", conversation_id, "transcript"],
    )
}

fn endpoint(base_url: &str, segments: &[&str]) -> Result<Url, ChatApiError> {
    let normalized = normalize_base_url(base_url);
    let mut url = Url::parse(&normalized)
        .map_err(|error| ChatApiError::InvalidBaseUrl(format!("{normalized}: {error}")))?;
    url.path_segments_mut()
        .map_err(|()| ChatApiError::InvalidBaseUrl(format!("{normalized}: cannot be a base")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}
