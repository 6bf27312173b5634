//! Inline lexer for the tool-lifecycle signals multiplexed into assistant text.
//!
//! Control sequences look like HTML comments carrying a tag and an optional
//! JSON body:
//!
//! ```text
//! <!--TOOL_START:{"id":"t1","name":"Read","input":{"path":"a.rs"}}-->
//! <!--TOOL_END:{"id":"t1"}-->
//! <!--HEARTBEAT-->
//! ```
//!
//! Any other comment is ordinary text. A sequence that is still open at the
//! end of a chunk is carried over and resumed on the next push.

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

const OPEN: &str = "<!--";
const CLOSE: &str = "-->";
const TOOL_START_TAG: &str = "TOOL_START:";
const TOOL_END_TAG: &str = "TOOL_END:";
const HEARTBEAT_TAG: &str = "HEARTBEAT";
const TAGS: [&str; 3] = [TOOL_START_TAG, TOOL_END_TAG, HEARTBEAT_TAG];

/// Upper bound for an unterminated sequence before it is released as text.
pub const DEFAULT_MAX_CARRY: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum EmbeddedEvent {
    ToolStart {
        id: String,
        name: String,
        input: Option<Value>,
    },
    ToolEnd {
        id: String,
        input: Option<Value>,
    },
    Heartbeat,
}

/// Display text and events extracted from one push.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedText {
    pub text: String,
    pub events: Vec<EmbeddedEvent>,
}

impl ParsedText {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.events.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct ToolStartBody {
    id: String,
    name: String,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ToolEndBody {
    id: String,
    #[serde(default)]
    input: Option<Value>,
}

enum Sequence {
    Event(EmbeddedEvent),
    Malformed {
        tag: &'static str,
        error: serde_json::Error,
    },
    NotControl,
}

#[derive(Debug)]
pub struct EmbeddedEventParser {
    carry: String,
    max_carry: usize,
}

impl Default for EmbeddedEventParser {
    fn default() -> Self {
        Self::with_max_carry(DEFAULT_MAX_CARRY)
    }
}

impl EmbeddedEventParser {
    #[must_use]
    pub fn with_max_carry(max_carry: usize) -> Self {
        Self {
            carry: String::new(),
            max_carry,
        }
    }

    /// Lex one chunk of assistant text, resuming any carried sequence.
    pub fn push(&mut self, chunk: &str) -> ParsedText {
        let mut input = std::mem::take(&mut self.carry);
        input.push_str(chunk);

        let mut parsed = ParsedText::default();
        let mut rest = input.as_str();

        loop {
            let Some(start) = rest.find(OPEN) else {
                let keep = partial_opener_len(rest);
                let (text, tail) = rest.split_at(rest.len() - keep);
                parsed.text.push_str(text);
                self.carry.push_str(tail);
                break;
            };

            parsed.text.push_str(&rest[..start]);
            let candidate = &rest[start..];
            let body_and_tail = &candidate[OPEN.len()..];

            match body_and_tail.find(CLOSE) {
                Some(close) => {
                    let body = &body_and_tail[..close];
                    let end = OPEN.len() + close + CLOSE.len();
                    match classify(body) {
                        Sequence::Event(event) => parsed.events.push(event),
                        Sequence::Malformed { tag, error } => {
                            warn!(tag, %error, "dropping malformed embedded control sequence");
                        }
                        Sequence::NotControl => parsed.text.push_str(&candidate[..end]),
                    }
                    rest = &candidate[end..];
                }
                None if could_be_control(body_and_tail) => {
                    if candidate.len() > self.max_carry {
                        warn!(
                            len = candidate.len(),
                            "unterminated control sequence exceeded carry limit; releasing as text"
                        );
                        parsed.text.push_str(candidate);
                    } else {
                        self.carry.push_str(candidate);
                    }
                    break;
                }
                None => {
                    parsed.text.push_str(OPEN);
                    rest = body_and_tail;
                }
            }
        }

        parsed
    }

    /// Release whatever is still carried as plain text.
    pub fn finish(&mut self) -> String {
        std::mem::take(&mut self.carry)
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.carry.is_empty()
    }

    /// Lex a complete text in one shot.
    pub fn parse_all(text: &str) -> ParsedText {
        let mut parser = Self::default();
        let mut parsed = parser.push(text);
        parsed.text.push_str(&parser.finish());
        parsed
    }
}

fn classify(body: &str) -> Sequence {
    if body == HEARTBEAT_TAG {
        return Sequence::Event(EmbeddedEvent::Heartbeat);
    }

    if let Some(json) = body.strip_prefix(TOOL_START_TAG) {
        return match serde_json::from_str::<ToolStartBody>(json) {
            Ok(start) => Sequence::Event(EmbeddedEvent::ToolStart {
                id: start.id,
                name: start.name,
                input: start.input,
            }),
            Err(error) => Sequence::Malformed {
                tag: TOOL_START_TAG,
                error,
            },
        };
    }

    if let Some(json) = body.strip_prefix(TOOL_END_TAG) {
        return match serde_json::from_str::<ToolEndBody>(json) {
            Ok(end) => Sequence::Event(EmbeddedEvent::ToolEnd {
                id: end.id,
                input: end.input,
            }),
            Err(error) => Sequence::Malformed {
                tag: TOOL_END_TAG,
                error,
            },
        };
    }

    Sequence::NotControl
}

/// True while an unterminated body may still turn into a control sequence.
fn could_be_control(body: &str) -> bool {
    let core = body
        .strip_suffix("--")
        .or_else(|| body.strip_suffix('-'))
        .unwrap_or(body);

    TAGS.iter().any(|tag| {
        tag.starts_with(core) || (*tag != HEARTBEAT_TAG && body.starts_with(tag))
    })
}

/// Length of a trailing proper prefix of the opener, e.g. `<!` at chunk end.
fn partial_opener_len(text: &str) -> usize {
    (1..OPEN.len())
        .rev()
        .find(|len| text.ends_with(&OPEN[..*len]))
        .unwrap_or(0)
}
