//! Transport-only primitives for the chat generation backend.
//!
//! This crate owns request building, the incremental stream decoder, the
//! embedded tool-event lexer and transcript fetching. It holds no
//! conversation state and never touches persisted local storage.
//!
//! Stream decoding skips malformed chunks instead of failing the stream, so
//! callers only ever see transport-level failures as errors.

pub mod chunk;
pub mod client;
pub mod config;
pub mod decoder;
pub mod embedded;
pub mod error;
pub mod headers;
pub mod payload;
pub mod retry;
pub mod url;

pub use chunk::{DecodedChunk, StreamPayload, UsageCounters};
pub use client::{ByteStream, CancellationSignal, ChatApiClient};
pub use config::ChatApiConfig;
pub use decoder::{decode_byte_stream, StreamDecoder, TERMINAL_SENTINEL};
pub use embedded::{EmbeddedEvent, EmbeddedEventParser, ParsedText};
pub use error::ChatApiError;
pub use payload::{GenerationRequest, RequestSettings, Transcript, TranscriptMessage, WireMessage};
pub use url::normalize_base_url;
pub use reqwest::StatusCode;
