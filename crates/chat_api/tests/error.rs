use reqwest::StatusCode;

use chat_api::error::parse_error_message;
use chat_api::ChatApiError;

#[test]
fn parse_error_message_prefers_nested_message() {
    let body = r#"{"error":{"code":"bad_request","message":"invalid model"}}"#;
    let message = parse_error_message(StatusCode::BAD_REQUEST, body);
    assert_eq!(message, "invalid model");
}

#[test]
fn parse_error_message_falls_back_to_raw_body() {
    let body = "raw failure text";
    let message = parse_error_message(StatusCode::INTERNAL_SERVER_ERROR, body);
    assert_eq!(message, "raw failure text");
}

#[test]
fn cancelled_is_distinguished_from_other_failures() {
    assert!(ChatApiError::Cancelled.is_cancelled());
    assert!(!ChatApiError::MissingBody.is_cancelled());
    assert_eq!(ChatApiError::MissingBody.to_string(), "response carried no body");
}
