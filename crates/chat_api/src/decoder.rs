use std::collections::VecDeque;

use futures_util::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::chunk::{DecodedChunk, StreamPayload};

/// Literal payload that ends a stream's chunk sequence.
pub const TERMINAL_SENTINEL: &str = "[DONE]";

const DATA_PREFIX: &str = "data:";

/// Incremental decoder for `data: <payload>` line streams.
///
/// Bytes are buffered until a full line is available, so neither line
/// boundaries nor multi-byte UTF-8 sequences need to line up with push
/// boundaries. Once the terminal sentinel is seen the decoder is finished and
/// ignores any further input.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    finished: bool,
    skipped: usize,
}

impl StreamDecoder {
    /// Feed arbitrary bytes into the decoder and drain complete chunks.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<DecodedChunk> {
        if self.finished {
            return Vec::new();
        }

        self.buffer.extend_from_slice(bytes);
        let mut chunks = Vec::new();
        let mut consumed = 0;

        while let Some(offset) = self.buffer[consumed..].iter().position(|byte| *byte == b'\n') {
            let line_end = consumed + offset;
            let line = String::from_utf8_lossy(&self.buffer[consumed..line_end]).into_owned();
            consumed = line_end + 1;

            if let Some(chunk) = self.decode_line(&line) {
                let terminal = matches!(chunk, DecodedChunk::Done);
                chunks.push(chunk);
                if terminal {
                    self.finish_with_sentinel();
                    return chunks;
                }
            }
        }

        self.buffer.drain(..consumed);
        chunks
    }

    /// Flush a trailing line that was never newline-terminated.
    ///
    /// Call once the underlying source is exhausted.
    pub fn finish(&mut self) -> Vec<DecodedChunk> {
        if self.finished || self.buffer.is_empty() {
            self.buffer.clear();
            return Vec::new();
        }

        let line = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        let chunk = self.decode_line(&line);
        if matches!(chunk, Some(DecodedChunk::Done)) {
            self.finish_with_sentinel();
        }
        chunk.into_iter().collect()
    }

    /// Decode a complete payload string in one shot.
    pub fn decode_all(input: &str) -> Vec<DecodedChunk> {
        let mut decoder = Self::default();
        let mut chunks = decoder.feed(input.as_bytes());
        chunks.extend(decoder.finish());
        chunks
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    #[must_use]
    pub fn is_empty_buffer(&self) -> bool {
        self.buffer.iter().all(u8::is_ascii_whitespace)
    }

    /// Number of malformed chunks skipped so far.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn finish_with_sentinel(&mut self) {
        self.finished = true;
        self.buffer.clear();
    }

    fn decode_line(&mut self, line: &str) -> Option<DecodedChunk> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let payload = line.strip_prefix(DATA_PREFIX)?;
        let payload = payload.strip_prefix(' ').unwrap_or(payload);
        let trimmed = payload.trim();

        if trimmed.is_empty() {
            return None;
        }
        if trimmed == TERMINAL_SENTINEL {
            debug!("terminal sentinel received");
            return Some(DecodedChunk::Done);
        }

        match serde_json::from_str::<StreamPayload>(payload) {
            Ok(parsed) => Some(DecodedChunk::Payload(parsed)),
            Err(error) => {
                self.skipped += 1;
                warn!(%error, payload = trimmed, "skipping malformed stream chunk");
                None
            }
        }
    }
}

struct DecodeState<S> {
    bytes: S,
    decoder: StreamDecoder,
    pending: VecDeque<DecodedChunk>,
    exhausted: bool,
}

/// Lazily decode a byte stream into ordered chunks.
///
/// The returned stream ends after the terminal sentinel, after the source is
/// exhausted, or right after yielding the first source error.
pub fn decode_byte_stream<S, B, E>(bytes: S) -> impl Stream<Item = Result<DecodedChunk, E>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
{
    let state = DecodeState {
        bytes,
        decoder: StreamDecoder::default(),
        pending: VecDeque::new(),
        exhausted: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(chunk) = state.pending.pop_front() {
                return Some((Ok(chunk), state));
            }
            if state.exhausted {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(bytes)) => {
                    let decoded = state.decoder.feed(bytes.as_ref());
                    state.pending.extend(decoded);
                }
                Some(Err(error)) => {
                    state.exhausted = true;
                    return Some((Err(error), state));
                }
                None => {
                    let decoded = state.decoder.finish();
                    state.pending.extend(decoded);
                    state.exhausted = true;
                }
            }

            if state.decoder.is_finished() {
                state.exhausted = true;
            }
        }
    })
}
