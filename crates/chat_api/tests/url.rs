use chat_api::url::{generation_url, normalize_base_url, transcript_url, DEFAULT_BASE_URL};

#[test]
fn normalize_strips_trailing_api_paths() {
    assert_eq!(normalize_base_url("http://host:3000/"), "http://host:3000");
    assert_eq!(normalize_base_url("http://host:3000/api/chat"), "http://host:3000");
    assert_eq!(normalize_base_url("http://host:3000/api/"), "http://host:3000");
    assert_eq!(normalize_base_url("http://host/prefix"), "http://host/prefix");
}

#[test]
fn normalize_defaults_blank_input() {
    assert_eq!(normalize_base_url("   "), DEFAULT_BASE_URL);
}

#[test]
fn endpoints_are_built_from_root() {
    let url = generation_url("http://host/prefix/").expect("generation url");
    assert_eq!(url.as_str(), "http://host/prefix/api/chat");

    let url = transcript_url("http://host", "a b/c").expect("transcript url");
    assert_eq!(url.as_str(), "http://host/api/conversations/a%20b%2Fc/transcript");
}

#[test]
fn invalid_base_url_is_reported() {
    assert!(generation_url("not a url").is_err());
}
