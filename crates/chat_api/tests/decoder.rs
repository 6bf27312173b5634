use chat_api::{decode_byte_stream, DecodedChunk, StreamDecoder, StreamPayload, UsageCounters};
use futures_util::StreamExt;
use pretty_assertions::assert_eq;

const SAMPLE: &str = concat!(
    "data: {\"content\":\"Hi\"}\n\n",
    ": keep-alive comment\n",
    "event: message\n",
    "data: {\"content\":\" th\u{e9}re \u{1f44b}\"}\r\n\r\n",
    "data: {broken\n\n",
    "data: {\"sessionId\":\"s-1\",\"usage\":{\"inputTokens\":12,\"outputTokens\":3}}\n\n",
    "data: [DONE]\n\n",
    "data: {\"content\":\"after sentinel\"}\n\n",
);

fn decode_with_splits(input: &[u8], splits: &[usize]) -> Vec<DecodedChunk> {
    let mut decoder = StreamDecoder::default();
    let mut chunks = Vec::new();
    let mut start = 0;
    for &split in splits {
        chunks.extend(decoder.feed(&input[start..split]));
        start = split;
    }
    chunks.extend(decoder.feed(&input[start..]));
    chunks.extend(decoder.finish());
    chunks
}

fn expected_chunks() -> Vec<DecodedChunk> {
    vec![
        DecodedChunk::Payload(StreamPayload::content("Hi")),
        DecodedChunk::Payload(StreamPayload::content(" th\u{e9}re \u{1f44b}")),
        DecodedChunk::Payload(StreamPayload {
            session_id: Some("s-1".to_string()),
            usage: Some(UsageCounters {
                input_tokens: 12,
                output_tokens: 3,
                ..UsageCounters::default()
            }),
            ..StreamPayload::default()
        }),
        DecodedChunk::Done,
    ]
}

#[test]
fn decoding_unsplit_input_matches_expected_sequence() {
    assert_eq!(StreamDecoder::decode_all(SAMPLE), expected_chunks());
}

#[test]
fn decoding_is_invariant_under_every_single_split_point() {
    let bytes = SAMPLE.as_bytes();
    let expected = expected_chunks();
    for split in 0..=bytes.len() {
        assert_eq!(decode_with_splits(bytes, &[split]), expected, "split at {split}");
    }
}

#[test]
fn decoding_is_invariant_under_pseudo_random_multi_splits() {
    let bytes = SAMPLE.as_bytes();
    let expected = expected_chunks();
    let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;

    for _ in 0..200 {
        let mut splits = Vec::new();
        let mut cursor = 0;
        while cursor < bytes.len() {
            seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            cursor += 1 + (seed >> 33) as usize % 7;
            if cursor < bytes.len() {
                splits.push(cursor);
            }
        }
        assert_eq!(decode_with_splits(bytes, &splits), expected, "splits {splits:?}");
    }
}

#[test]
fn one_byte_at_a_time_matches_unsplit() {
    let bytes = SAMPLE.as_bytes();
    let splits: Vec<usize> = (1..bytes.len()).collect();
    assert_eq!(decode_with_splits(bytes, &splits), expected_chunks());
}

#[test]
fn done_flag_payload_is_terminal_but_still_emitted() {
    let chunks = StreamDecoder::decode_all("data: {\"done\":true}\n");
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].is_terminal());
}

#[test]
fn data_prefix_without_space_is_accepted() {
    let chunks = StreamDecoder::decode_all("data:{\"content\":\"x\"}\n");
    assert_eq!(chunks, vec![DecodedChunk::Payload(StreamPayload::content("x"))]);
}

#[tokio::test]
async fn byte_stream_decoding_is_lazy_and_stops_at_sentinel() {
    let pieces: Vec<Result<Vec<u8>, String>> = SAMPLE
        .as_bytes()
        .chunks(5)
        .map(|piece| Ok(piece.to_vec()))
        .collect();
    let decoded: Vec<_> = decode_byte_stream(futures_util::stream::iter(pieces))
        .collect()
        .await;

    let decoded: Vec<DecodedChunk> = decoded
        .into_iter()
        .map(|chunk| chunk.expect("source never fails"))
        .collect();
    assert_eq!(decoded, expected_chunks());
}

#[tokio::test]
async fn byte_stream_source_error_is_yielded_then_stream_ends() {
    let pieces: Vec<Result<Vec<u8>, String>> = vec![
        Ok(b"data: {\"content\":\"a\"}\n".to_vec()),
        Err("connection reset".to_string()),
        Ok(b"data: {\"content\":\"b\"}\n".to_vec()),
    ];
    let decoded: Vec<_> = decode_byte_stream(futures_util::stream::iter(pieces))
        .collect()
        .await;

    assert_eq!(decoded.len(), 2);
    assert_eq!(
        decoded[0],
        Ok(DecodedChunk::Payload(StreamPayload::content("a")))
    );
    assert_eq!(decoded[1], Err("connection reset".to_string()));
}
