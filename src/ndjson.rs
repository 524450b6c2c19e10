//! Incremental decoding of newline-delimited JSON streams.
//!
//! Upstream providers send either bare NDJSON (`{...}\n`) or SSE-style frames
//! (`data: {...}\n`). [`NdjsonDecoder`] splits raw bytes on `\n`, so a line may
//! arrive across any number of chunks (including mid-way through a multi-byte
//! UTF-8 sequence) and still decode to the same payload. Blank lines, SSE
//! comments and the `[DONE]` sentinel never reach the caller.

use crate::constants::{MAX_LINE_LENGTH, SSE_DATA_PREFIX};
use crate::types::StreamEvent;
use bytes::BytesMut;
use tokio_util::codec::Decoder;

#[derive(Debug, Clone)]
pub struct NdjsonDecoder {
    max_line_length: usize,
    /// Index already scanned for `\n` in the current buffer.
    next_index: usize,
    /// Set while skipping the remainder of an over-long line.
    discarding: bool,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_line_length: usize) -> Self {
        Self {
            max_line_length,
            next_index: 0,
            discarding: false,
        }
    }
}

impl Default for NdjsonDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for NdjsonDecoder {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        loop {
            let newline = buf[self.next_index..].iter().position(|b| *b == b'\n');
            match newline {
                Some(offset) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let line = buf.split_to(end + 1);
                    if self.discarding {
                        self.discarding = false;
                        continue;
                    }
                    if let Some(payload) = frame_payload(&line[..end]) {
                        return Ok(Some(payload));
                    }
                }
                None => {
                    if buf.len() > self.max_line_length {
                        tracing::warn!(
                            "[NDJSON] Dropping line longer than {} bytes",
                            self.max_line_length
                        );
                        buf.clear();
                        self.next_index = 0;
                        self.discarding = true;
                    } else {
                        self.next_index = buf.len();
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if buf.is_empty() {
            return Ok(None);
        }
        let rest = buf.split_to(buf.len());
        if std::mem::take(&mut self.discarding) {
            return Ok(None);
        }
        Ok(frame_payload(&rest))
    }
}

/// Strips whitespace and SSE framing from one raw line. Returns `None` for lines
/// that carry no payload.
pub fn frame_payload(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let mut line = text.trim();
    if line.starts_with(':') {
        return None;
    }
    if let Some(rest) = line.strip_prefix(SSE_DATA_PREFIX) {
        line = rest.trim_start();
    }
    if line.is_empty() || line == "[DONE]" {
        return None;
    }
    Some(line.to_string())
}

/// The undecoded tail of a stream plus the decoder that consumes it.
#[derive(Debug, Default)]
pub struct NdjsonBuffer {
    buf: BytesMut,
    decoder: NdjsonDecoder,
}

impl NdjsonBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every line it completed, in order.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        // decode never fails for this decoder; the io::Error type is required by the trait
        while let Ok(Some(line)) = self.decoder.decode(&mut self.buf) {
            lines.push(line);
        }
        lines
    }

    /// Flushes the trailing fragment once the stream has ended.
    pub fn finish(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(Some(line)) = self.decoder.decode_eof(&mut self.buf) {
            lines.push(line);
        }
        lines
    }

    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}

pub fn parse_line(line: &str) -> serde_json::Result<serde_json::Value> {
    serde_json::from_str(line)
}

pub fn parse_event(line: &str) -> serde_json::Result<StreamEvent> {
    serde_json::from_str(line)
}

/// Decodes a whole byte sequence delivered as the given chunks.
pub fn decode_chunks<'a, I>(chunks: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut buffer = NdjsonBuffer::new();
    let mut lines = Vec::new();
    for chunk in chunks {
        lines.extend(buffer.push_chunk(chunk));
    }
    lines.extend(buffer.finish());
    lines
}
