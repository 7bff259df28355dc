//! Newline-delimited JSON decoding over chunked response bodies.
//!
//! Lines may be split across any number of transport chunks and may be
//! arbitrarily long; the decoder buffers until a `\n` arrives. Blank lines and
//! lines that are not valid JSON are skipped without ending the stream.

use std::collections::VecDeque;

use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::ApiError;
use crate::transport::{ByteStream, RecordStream};

/// Counters kept by an [`NdjsonDecoder`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub records: u64,
    pub blank_lines: u64,
    pub malformed_lines: u64,
}

/// Incremental NDJSON decoder.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buf: Vec<u8>,
    /// Bytes of `buf` already searched for a newline.
    scanned: usize,
    stats: DecoderStats,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every record completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buf.extend_from_slice(chunk);

        let mut records = Vec::new();
        let mut line_start = 0;
        let mut search_from = self.scanned;
        while let Some(offset) = self.buf[search_from..].iter().position(|&b| b == b'\n') {
            let line_end = search_from + offset;
            if let Some(value) = decode_line(&self.buf[line_start..line_end], &mut self.stats) {
                records.push(value);
            }
            line_start = line_end + 1;
            search_from = line_start;
        }

        self.buf.drain(..line_start);
        self.scanned = self.buf.len();
        records
    }

    /// Decode whatever is left after a clean end of input.
    pub fn finish(&mut self) -> Option<Value> {
        let rest = std::mem::take(&mut self.buf);
        self.scanned = 0;
        decode_line(&rest, &mut self.stats)
    }

    /// Bytes of the current, not yet terminated line.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }
}

fn decode_line(raw: &[u8], stats: &mut DecoderStats) -> Option<Value> {
    let Ok(text) = std::str::from_utf8(raw) else {
        stats.malformed_lines += 1;
        debug!(len = raw.len(), "skipping non UTF-8 NDJSON line");
        return None;
    };
    // trim also drops the '\r' of CRLF line endings
    let line = text.trim();
    if line.is_empty() {
        stats.blank_lines += 1;
        return None;
    }
    match serde_json::from_str::<Value>(line) {
        Ok(value) => {
            stats.records += 1;
            Some(value)
        }
        Err(e) => {
            stats.malformed_lines += 1;
            debug!(error = %e, preview = %preview(line), "skipping malformed NDJSON line");
            None
        }
    }
}

fn preview(line: &str) -> &str {
    match line.char_indices().nth(80) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

struct DecodeState {
    body: ByteStream,
    decoder: NdjsonDecoder,
    ready: VecDeque<Value>,
    finished: bool,
}

/// Turn a response body into a stream of records.
///
/// A transport failure yields one [`ApiError::StreamTransport`] and ends the
/// stream; the partial line in flight at that moment is discarded.
pub fn decode_stream(body: ByteStream) -> RecordStream {
    let state = DecodeState {
        body,
        decoder: NdjsonDecoder::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    Box::pin(futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(value) = st.ready.pop_front() {
                return Some((Ok(value), st));
            }
            if st.finished {
                return None;
            }
            match st.body.next().await {
                Some(Ok(chunk)) => {
                    trace!(bytes = chunk.len(), "NDJSON chunk");
                    st.ready.extend(st.decoder.push(&chunk));
                }
                Some(Err(e)) => {
                    st.finished = true;
                    debug!(
                        error = %e,
                        discarded_bytes = st.decoder.pending_len(),
                        "NDJSON body interrupted"
                    );
                    return Some((Err(into_stream_error(e)), st));
                }
                None => {
                    st.finished = true;
                    st.ready.extend(st.decoder.finish());
                    let stats = st.decoder.stats();
                    debug!(
                        records = stats.records,
                        malformed = stats.malformed_lines,
                        "NDJSON body complete"
                    );
                }
            }
        }
    }))
}

fn into_stream_error(err: ApiError) -> ApiError {
    match err {
        ApiError::StreamTransport(_) => err,
        other => ApiError::StreamTransport(other.to_string()),
    }
}
