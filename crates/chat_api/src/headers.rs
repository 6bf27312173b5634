use std::collections::BTreeMap;

use crate::config::ChatApiConfig;

pub const HEADER_ACCEPT: &str = "accept";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_USER_AGENT: &str = "user-agent";

pub const EVENT_STREAM: &str = "text/event-stream";
pub const APPLICATION_JSON: &str = "application/json";

/// Build a deterministic header map for a generation request.
pub fn build_stream_headers(config: &ChatApiConfig) -> BTreeMap<String, String> {
    let mut headers = base_headers(config);
    headers.insert(HEADER_ACCEPT.to_owned(), EVENT_STREAM.to_owned());
    headers.insert(HEADER_CONTENT_TYPE.to_owned(), APPLICATION_JSON.to_owned());
    merge_extra_headers(&mut headers, config);
    headers
}

/// Build a deterministic header map for a transcript fetch.
pub fn build_json_headers(config: &ChatApiConfig) -> BTreeMap<String, String> {
    let mut headers = base_headers(config);
    headers.insert(HEADER_ACCEPT.to_owned(), APPLICATION_JSON.to_owned());
    merge_extra_headers(&mut headers, config);
    headers
}

fn base_headers(config: &ChatApiConfig) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    let user_agent = config
        .user_agent
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(default_user_agent);
    headers.insert(HEADER_USER_AGENT.to_owned(), user_agent);
    headers
}

fn merge_extra_headers(headers: &mut BTreeMap<String, String>, config: &ChatApiConfig) {
    for (key, value) in &config.extra_headers {
        headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_owned());
    }
}

pub fn default_user_agent() -> String {
    format!("chat_engine/{}", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use super::{build_json_headers, build_stream_headers, HEADER_ACCEPT, HEADER_USER_AGENT};
    use crate::config::ChatApiConfig;

    #[test]
    fn extra_headers_are_lowercased_and_override_defaults() {
        let config = ChatApiConfig::default()
            .insert_header("X-Tab-Id", " tab-1 ")
            .insert_header("Accept", "text/plain");
        let headers = build_stream_headers(&config);

        assert_eq!(headers.get("x-tab-id").map(String::as_str), Some("tab-1"));
        assert_eq!(headers.get(HEADER_ACCEPT).map(String::as_str), Some("text/plain"));
    }

    #[test]
    fn blank_user_agent_falls_back_to_default() {
        let config = ChatApiConfig::default().with_user_agent("  ");
        let headers = build_json_headers(&config);
        assert!(headers[HEADER_USER_AGENT].starts_with("chat_engine/"));
    }
}
