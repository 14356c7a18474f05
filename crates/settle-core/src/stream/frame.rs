//! Newline-delimited JSON frame decoding.
//!
//! The agent endpoint streams one JSON record per line. Reads from the
//! response body split lines (and UTF-8 sequences) at arbitrary points, so
//! the decoder buffers raw bytes and only parses a line once its terminating
//! `\n` has arrived.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use futures_util::Stream;
use serde_json::Value;

/// Categories of frame decoding failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// A complete line was not valid UTF-8.
    InvalidUtf8,
    /// A complete line was not a JSON document.
    InvalidJson,
    /// The underlying body stream failed mid-read.
    Transport,
}

/// A frame could not be decoded. Always terminates the read loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    /// One-line summary suitable for display.
    pub message: String,
    /// Underlying parser/transport error.
    pub details: Option<String>,
}

impl DecodeError {
    fn invalid_json(line: &str, err: &serde_json::Error) -> Self {
        Self {
            kind: DecodeErrorKind::InvalidJson,
            message: format!("Error parsing chunk: {line}"),
            details: Some(err.to_string()),
        }
    }

    fn invalid_utf8(err: std::str::Utf8Error) -> Self {
        Self {
            kind: DecodeErrorKind::InvalidUtf8,
            message: "Error parsing chunk: invalid UTF-8".to_string(),
            details: Some(err.to_string()),
        }
    }

    fn transport(err: &impl fmt::Display) -> Self {
        Self {
            kind: DecodeErrorKind::Transport,
            message: format!("Response stream failed: {err}"),
            details: None,
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for DecodeError {}

/// Incremental splitter for newline-delimited JSON.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already known to contain no newline.
    scanned: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk read from the body.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Pops and parses the next complete frame, if one is buffered.
    ///
    /// Blank lines are skipped. The trailing fragment after the last newline
    /// stays buffered until more data arrives.
    pub fn next_frame(&mut self) -> Option<Result<Value, DecodeError>> {
        loop {
            let Some(offset) = self.buffer[self.scanned..]
                .iter()
                .position(|byte| *byte == b'\n')
            else {
                self.scanned = self.buffer.len();
                return None;
            };

            let end = self.scanned + offset;
            let mut line: Vec<u8> = self.buffer.drain(..=end).collect();
            self.scanned = 0;

            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return Some(parse_frame(&line));
        }
    }

    /// Number of bytes currently held back as an incomplete frame.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Ends decoding, discarding any incomplete trailing fragment.
    ///
    /// Returns the number of discarded bytes.
    pub fn finish(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        self.scanned = 0;
        dropped
    }
}

fn parse_frame(line: &[u8]) -> Result<Value, DecodeError> {
    let text = std::str::from_utf8(line).map_err(DecodeError::invalid_utf8)?;
    serde_json::from_str(text).map_err(|err| DecodeError::invalid_json(text, &err))
}

/// Stream adapter that turns a response body into decoded JSON frames.
///
/// Yields at most one error; the stream is finished after it.
pub struct FrameStream<S> {
    inner: S,
    decoder: FrameDecoder,
    done: bool,
}

impl<S> FrameStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
            done: false,
        }
    }
}

impl<S, B, E> Stream for FrameStream<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    type Item = Result<Value, DecodeError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if this.done {
                return Poll::Ready(None);
            }

            if let Some(frame) = this.decoder.next_frame() {
                if frame.is_err() {
                    this.done = true;
                }
                return Poll::Ready(Some(frame));
            }

            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(chunk)) => this.decoder.push(chunk.as_ref()),
                Some(Err(err)) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(DecodeError::transport(&err))));
                }
                None => {
                    let dropped = this.decoder.finish();
                    if dropped > 0 {
                        tracing::debug!(dropped, "discarding incomplete trailing frame");
                    }
                    this.done = true;
                    return Poll::Ready(None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures_util::StreamExt;
    use serde_json::json;

    use super::*;

    const STREAM: &str = concat!(
        r#"{"agent":{"messages":[{"kwargs":{"content":"hi"}}]}}"#,
        "\n",
        r#"{"tools":{"messages":[{"kwargs":{"content":"User Operation Hash: 0xabc123"}}]}}"#,
        "\n",
        r#"{"agent":{"messages":[{"kwargs":{"content":"done 👋"}}]}}"#,
        "\n",
    );

    fn decode_chunks(chunks: &[&[u8]]) -> Vec<Value> {
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for chunk in chunks {
            decoder.push(chunk);
            while let Some(frame) = decoder.next_frame() {
                frames.push(frame.expect("valid frame"));
            }
        }
        decoder.finish();
        frames
    }

    fn byte_stream(chunks: Vec<&[u8]>) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Unpin {
        let chunks: Vec<_> = chunks
            .into_iter()
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        futures_util::stream::iter(chunks)
    }

    #[test]
    fn test_frames_independent_of_split_point() {
        let bytes = STREAM.as_bytes();
        let baseline = decode_chunks(&[bytes]);
        assert_eq!(baseline.len(), 3);

        for split in 0..=bytes.len() {
            let (a, b) = bytes.split_at(split);
            assert_eq!(decode_chunks(&[a, b]), baseline, "split at {split}");
        }
    }

    #[test]
    fn test_frames_independent_of_chunk_size() {
        let bytes = STREAM.as_bytes();
        let baseline = decode_chunks(&[bytes]);

        for size in 1..=16 {
            let chunks: Vec<&[u8]> = bytes.chunks(size).collect();
            assert_eq!(decode_chunks(&chunks), baseline, "chunk size {size}");
        }
    }

    #[test]
    fn test_trailing_fragment_is_held_then_dropped() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"{\"agent\":1}\n{\"agent\":");

        assert_eq!(decoder.next_frame().unwrap().unwrap(), json!({"agent": 1}));
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.pending_len(), 9);
        assert_eq!(decoder.finish(), 9);
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn test_crlf_and_blank_lines() {
        let frames = decode_chunks(&[&b"\r\n{\"a\":1}\r\n\n   \n{\"b\":2}\n"[..]]);
        assert_eq!(frames, vec![json!({"a": 1}), json!({"b": 2})]);
    }

    #[test]
    fn test_invalid_json_reports_line() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"not json\n");

        let err = decoder.next_frame().unwrap().unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::InvalidJson);
        assert_eq!(err.message, "Error parsing chunk: not json");
        assert!(err.details.is_some());
    }

    #[tokio::test]
    async fn test_stream_cut_mid_frame_yields_only_complete_frames() {
        let cut = STREAM.len() - 10;
        let stream = byte_stream(vec![&STREAM.as_bytes()[..cut]]);
        let frames: Vec<_> = FrameStream::new(stream).collect().await;

        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn test_stream_stops_after_malformed_frame() {
        let stream = byte_stream(vec![&b"{\"a\":1}\n{oops\n{\"b\":2}\n"[..]]);
        let frames: Vec<_> = FrameStream::new(stream).collect().await;

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_ref().unwrap(), &json!({"a": 1}));
        assert_eq!(
            frames[1].as_ref().unwrap_err().kind,
            DecodeErrorKind::InvalidJson
        );
    }

    #[tokio::test]
    async fn test_stream_keeps_utf8_split_across_chunks() {
        let data = "{\"text\":\"Hello 👋 world\"}\n".as_bytes();
        let emoji_start = data
            .windows(4)
            .position(|w| w == [0xF0, 0x9F, 0x91, 0x8B])
            .expect("emoji not found");
        let split = emoji_start + 2;

        let stream = byte_stream(vec![&data[..split], &data[split..]]);
        let mut frames = FrameStream::new(stream);

        let frame = frames.next().await.unwrap().unwrap();
        assert_eq!(frame, json!({"text": "Hello 👋 world"}));
        assert!(frames.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_surfaces_transport_error() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"{\"a\":1}\n")),
            Err(std::io::Error::other("connection reset")),
            Ok(Bytes::from_static(b"{\"b\":2}\n")),
        ];
        let frames: Vec<_> = FrameStream::new(futures_util::stream::iter(chunks))
            .collect()
            .await;

        assert_eq!(frames.len(), 2);
        let err = frames[1].as_ref().unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::Transport);
        assert!(err.message.contains("connection reset"));
    }
}
