//! Incremental decoding of a relayed event stream
//!
//! Bytes arrive in arbitrary chunks. [`Utf8Decoder`] keeps multi-byte
//! sequences intact across chunk boundaries and [`SseDecoder`] turns the text
//! into [`StreamEvent`]s line by line.
//!
//! A `data:` line whose JSON does not parse stays, whole, at the front of the
//! pending buffer and extraction stops there. A complete line never changes,
//! so later chunks are only appended; the held lines are processed when the
//! body ends and the unparseable one is dropped.

use crate::messages::ChunkEvent;

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";

/// A decoded unit from the wire stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Incremental text from `choices[0].delta.content`
    Delta(String),
    /// Terminal `[DONE]` marker
    Done,
}

/// Stateful UTF-8 decoder for chunked input
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a chunk, holding back an incomplete trailing sequence
    ///
    /// Invalid sequences are replaced with U+FFFD.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());
        let mut consumed = 0;

        loop {
            match std::str::from_utf8(&self.pending[consumed..]) {
                Ok(valid) => {
                    out.push_str(valid);
                    consumed = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid_end = consumed + e.valid_up_to();
                    // valid_up_to() guarantees this slice is UTF-8
                    out.push_str(&String::from_utf8_lossy(&self.pending[consumed..valid_end]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            consumed = valid_end + bad;
                        }
                        None => {
                            consumed = valid_end;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..consumed);
        out
    }

    /// Flush whatever is still held back at end of input
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// Line-oriented decoder for `data:` event streams
#[derive(Debug, Default)]
pub struct SseDecoder {
    utf8: Utf8Decoder,
    buffer: String,
    done: bool,
    /// The buffer starts with a complete line that failed to parse
    stalled: bool,
}

enum LineOutcome {
    Skip,
    Delta(String),
    Done,
    Incomplete,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the `[DONE]` sentinel has been seen
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed one raw chunk and return the events it completes
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }
        let text = self.utf8.decode(chunk);
        self.buffer.push_str(&text);
        if self.stalled {
            return Vec::new();
        }
        self.drain_lines()
    }

    /// Signal end of body and return any events still pending
    ///
    /// Remaining complete lines are retried once more, followed by a final
    /// unterminated line if there is one. Unparseable payloads are discarded.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }
        let tail = self.utf8.finish();
        self.buffer.push_str(&tail);
        self.stalled = false;
        let remaining = std::mem::take(&mut self.buffer);

        let mut events = Vec::new();
        for raw in remaining.split('\n') {
            match classify_line(raw) {
                LineOutcome::Skip => {}
                LineOutcome::Delta(text) => events.push(StreamEvent::Delta(text)),
                LineOutcome::Done => {
                    self.done = true;
                    events.push(StreamEvent::Done);
                    break;
                }
                LineOutcome::Incomplete => {
                    tracing::debug!(line = raw, "Dropping unparseable event line at end of stream");
                }
            }
        }
        events
    }

    fn drain_lines(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        let mut consumed = 0;

        while let Some(offset) = self.buffer[consumed..].find('\n') {
            let end = consumed + offset;

            match classify_line(&self.buffer[consumed..end]) {
                LineOutcome::Skip => {}
                LineOutcome::Delta(text) => events.push(StreamEvent::Delta(text)),
                LineOutcome::Done => {
                    self.done = true;
                    self.buffer.clear();
                    events.push(StreamEvent::Done);
                    return events;
                }
                LineOutcome::Incomplete => {
                    tracing::debug!(
                        line = &self.buffer[consumed..end],
                        "Holding unparseable event line"
                    );
                    self.stalled = true;
                    break;
                }
            }
            consumed = end + 1;
        }

        self.buffer.drain(..consumed);
        events
    }
}

fn classify_line(line: &str) -> LineOutcome {
    let line = line.strip_suffix('\r').unwrap_or(line);

    if line.is_empty() || line.starts_with(':') {
        return LineOutcome::Skip;
    }
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return LineOutcome::Skip;
    };
    if payload.trim() == DONE_SENTINEL {
        return LineOutcome::Done;
    }

    match serde_json::from_str::<ChunkEvent>(payload) {
        Ok(event) => match event.delta_content() {
            Some(text) => LineOutcome::Delta(text.to_string()),
            None => LineOutcome::Skip,
        },
        Err(_) => LineOutcome::Incomplete,
    }
}

/// Decode a complete byte stream from scratch
pub fn decode_all<'a>(chunks: impl IntoIterator<Item = &'a [u8]>) -> Vec<StreamEvent> {
    let mut decoder = SseDecoder::new();
    let mut events = Vec::new();
    for chunk in chunks {
        events.extend(decoder.feed(chunk));
        if decoder.is_done() {
            return events;
        }
    }
    events.extend(decoder.finish());
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(text: &str) -> StreamEvent {
        StreamEvent::Delta(text.to_string())
    }

    #[test]
    fn test_utf8_decoder_split_multibyte() {
        let bytes = "héllo 🦀".as_bytes();
        let mut decoder = Utf8Decoder::new();

        // 'é' is two bytes starting at index 1; split inside it
        let mut out = decoder.decode(&bytes[..2]);
        assert_eq!(out, "h");
        out.push_str(&decoder.decode(&bytes[2..9]));
        out.push_str(&decoder.decode(&bytes[9..]));
        out.push_str(&decoder.finish());
        assert_eq!(out, "héllo 🦀");
    }

    #[test]
    fn test_utf8_decoder_byte_at_a_time() {
        let text = "añb€c🦀";
        let mut decoder = Utf8Decoder::new();
        let mut out = String::new();
        for b in text.as_bytes() {
            out.push_str(&decoder.decode(std::slice::from_ref(b)));
        }
        out.push_str(&decoder.finish());
        assert_eq!(out, text);
    }

    #[test]
    fn test_utf8_decoder_invalid_bytes_replaced() {
        let mut decoder = Utf8Decoder::new();
        let out = decoder.decode(b"a\xffb");
        assert_eq!(out, "a\u{FFFD}b");
    }

    #[test]
    fn test_utf8_decoder_truncated_tail_flushed_lossy() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(&[b'x', 0xE2, 0x82]), "x");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[test]
    fn test_feed_basic_deltas_and_done() {
        let mut decoder = SseDecoder::new();
        let mut events = decoder.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"He\"}}]}\n");
        events.extend(decoder.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\n"));
        events.extend(decoder.feed(b"data: [DONE]\n"));

        assert_eq!(events, vec![delta("He"), delta("llo"), StreamEvent::Done]);
        assert!(decoder.is_done());
    }

    #[test]
    fn test_json_split_across_chunks_yields_one_delta() {
        let mut decoder = SseDecoder::new();

        let first = decoder.feed(b"data: {\"choices\":[{\"delta\":{\"con");
        assert!(first.is_empty());

        let second = decoder.feed(b"tent\":\"hi\"}}]}\n");
        assert_eq!(second, vec![delta("hi")]);
    }

    #[test]
    fn test_unparseable_complete_line_is_rebuffered() {
        let mut decoder = SseDecoder::new();

        let events = decoder.feed(
            b"data: {\"broken\n\
              data: {\"choices\":[{\"delta\":{\"content\":\"later\"}}]}\n",
        );
        // Extraction stops at the broken line and keeps it for the next chunk
        assert!(events.is_empty());

        let more = decoder.feed(b"");
        assert!(more.is_empty());

        // End of body: the broken line is dropped, the following one survives
        let tail = decoder.finish();
        assert_eq!(tail, vec![delta("later")]);
    }

    #[test]
    fn test_held_line_buffers_later_chunks_until_finish() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: {\"broken\n").is_empty());

        let line = b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n";
        for _ in 0..100 {
            assert!(decoder.feed(line).is_empty());
        }
        assert!(decoder.buffer.starts_with("data: {\"broken\n"));
        assert_eq!(
            decoder.buffer.len(),
            "data: {\"broken\n".len() + 100 * line.len()
        );

        let tail = decoder.finish();
        assert_eq!(tail.len(), 100);
        assert!(tail.iter().all(|e| *e == delta("x")));
    }

    #[test]
    fn test_comments_blank_and_foreign_fields_skipped() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(
            b": keep-alive\n\
              \n\
              event: message\n\
              id: 7\n\
              data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n",
        );
        assert_eq!(events, vec![delta("x")]);
    }

    #[test]
    fn test_crlf_line_endings() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\r\n\r\ndata: [DONE]\r\n",
        );
        assert_eq!(events, vec![delta("a"), StreamEvent::Done]);
    }

    #[test]
    fn test_done_with_whitespace() {
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.feed(b"data:  [DONE]  \n"), vec![StreamEvent::Done]);
    }

    #[test]
    fn test_nothing_after_done() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(
            b"data: [DONE]\ndata: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n",
        );
        assert_eq!(events, vec![StreamEvent::Done]);
        assert!(decoder.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n").is_empty());
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_role_only_and_empty_deltas_produce_nothing() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(
            b"data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\
              data: {\"choices\":[{\"delta\":{\"content\":\"\"}}]}\n\
              data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n",
        );
        assert!(events.is_empty());
    }

    #[test]
    fn test_finish_handles_unterminated_last_line() {
        let mut decoder = SseDecoder::new();
        assert!(decoder
            .feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}")
            .is_empty());
        assert_eq!(decoder.finish(), vec![delta("tail")]);
    }

    #[test]
    fn test_multibyte_content_split_across_chunks() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"🦀\"}}]}\n".as_bytes();
        let split = line.iter().position(|&b| b == 0xF0).unwrap() + 2;

        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(&line[..split]).is_empty());
        assert_eq!(decoder.feed(&line[split..]), vec![delta("🦀")]);
    }

    #[test]
    fn test_decode_all_is_deterministic_for_any_chunking() {
        let stream = "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
                      data: {\"choices\":[{\"delta\":{\"content\":\"lo, \"}}]}\n\n\
                      data: {\"choices\":[{\"delta\":{\"content\":\"wörld\"}}]}\n\n\
                      data: [DONE]\n\n"
            .as_bytes();
        let expected = decode_all([stream]);

        for size in 1..stream.len() {
            let chunks: Vec<&[u8]> = stream.chunks(size).collect();
            assert_eq!(decode_all(chunks), expected, "chunk size {size}");
        }
    }
}
