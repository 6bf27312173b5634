/// Title of a conversation with no user message yet.
pub const DEFAULT_TITLE: &str = "New Chat";

pub const TITLE_MAX_CHARS: usize = 50;

const ELLIPSIS: &str = "...";

/// Title derived from the first line of a user message.
#[must_use]
pub fn title_from_content(content: &str) -> String {
    let first_line = content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default();
    if first_line.is_empty() {
        return DEFAULT_TITLE.to_string();
    }

    if first_line.chars().count() <= TITLE_MAX_CHARS {
        return first_line.to_string();
    }
    let truncated: String = first_line.chars().take(TITLE_MAX_CHARS).collect();
    format!("{}{ELLIPSIS}", truncated.trim_end())
}

#[cfg(test)]
mod tests {
    use super::{title_from_content, DEFAULT_TITLE, TITLE_MAX_CHARS};

    #[test]
    fn uses_first_non_blank_line() {
        assert_eq!(title_from_content("\n  Fix the build  \nsecond"), "Fix the build");
    }

    #[test]
    fn blank_content_gets_default_title() {
        assert_eq!(title_from_content("   \n\t"), DEFAULT_TITLE);
    }

    #[test]
    fn long_lines_are_truncated_on_char_boundaries() {
        let line = "é".repeat(TITLE_MAX_CHARS + 10);
        let title = title_from_content(&line);
        assert!(title.ends_with("..."));
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + 3);
    }
}
