use chat_api::retry::*;

#[test]
fn retry_statuses_are_limited_to_not_started_responses() {
    assert!(is_retryable_http_error(429, ""));
    assert!(is_retryable_http_error(502, ""));
    assert!(is_retryable_http_error(503, ""));
    assert!(is_retryable_http_error(504, ""));
    assert!(!is_retryable_http_error(500, "internal failure"));
    assert!(!is_retryable_http_error(400, "rate limit exceeded"));
}

#[test]
fn retry_server_error_text_pattern_is_retryable() {
    assert!(is_retryable_http_error(500, "upstream connect error"));
    assert!(is_retryable_http_error(500, "Model Overloaded"));
}

#[test]
fn retry_delay_is_exponential() {
    assert_eq!(retry_delay(0).as_millis(), 500);
    assert_eq!(retry_delay(1).as_millis(), 1000);
    assert_eq!(retry_delay(2).as_millis(), 2000);
}
