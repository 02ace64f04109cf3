//! Line decoder for newline-delimited feed bodies.
//!
//! The response body of a continuous feed arrives in chunks of arbitrary
//! size. A chunk may hold zero, one or many newlines, and a line may span any
//! number of chunks. The decoder keeps the bytes seen since the last newline
//! and hands back every line completed by the newest chunk.
//!
//! # Decoding Flow
//!
//! 1. Append the chunk to the pending buffer
//! 2. Split off every complete line, stripping its `\n`
//! 3. Remember how far the remainder was scanned so it is not searched again
//! 4. At end of stream, drop whatever is left (it is not a complete record)
//!
//! Lines longer than the configured maximum are dropped instead of emitted,
//! and the decoder stops buffering them as soon as the limit is crossed, so a
//! peer that never sends a newline cannot grow the buffer without bound.
//!
//! # Examples
//!
//! ```
//! use couch_feed::client::LineDecoder;
//!
//! let mut decoder = LineDecoder::new();
//!
//! let lines = decoder.feed(b"{\"id\":\"a\"}\n{\"id\"");
//! assert_eq!(lines.len(), 1);
//!
//! let lines = decoder.feed(b":\"b\"}\n\n");
//! assert_eq!(lines.len(), 2);
//! assert_eq!(&lines[0][..], b"{\"id\":\"b\"}");
//! assert!(lines[1].is_empty());
//! ```

use bytes::{Bytes, BytesMut};

/// Default upper bound on a single line, in bytes
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

/// Incremental splitter of a byte stream into `\n`-terminated lines.
///
/// Empty lines are emitted as empty [`Bytes`]; deciding what they mean is
/// left to the next stage.
#[derive(Debug)]
pub struct LineDecoder {
    /// Bytes received since the last newline
    buffer: BytesMut,
    /// Prefix of `buffer` already known to contain no newline
    scanned: usize,
    /// Complete lines produced so far
    lines_emitted: u64,
    /// Lines dropped for exceeding `max_line`
    lines_dropped: u64,
    max_line: usize,
    /// Inside an oversized line whose head was already thrown away
    discarding: bool,
}

impl LineDecoder {
    /// Create a new line decoder
    pub fn new() -> Self {
        Self::with_max_line(DEFAULT_MAX_LINE_BYTES)
    }

    /// Create a decoder that drops lines longer than `max_line` bytes
    pub fn with_max_line(max_line: usize) -> Self {
        LineDecoder {
            buffer: BytesMut::with_capacity(8192.min(max_line.saturating_add(1))),
            scanned: 0,
            lines_emitted: 0,
            lines_dropped: 0,
            max_line,
            discarding: false,
        }
    }

    /// Feed one chunk and collect the lines it completes, in order.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(data);
        let mut lines = Vec::new();

        while let Some(pos) = self.find_newline() {
            let mut line = self.buffer.split_to(pos + 1);
            line.truncate(pos);
            self.scanned = 0;

            if self.discarding {
                self.discarding = false;
                continue;
            }
            if pos > self.max_line {
                self.note_dropped(pos);
                continue;
            }
            lines.push(line.freeze());
        }

        if self.buffer.len() > self.max_line {
            if !self.discarding {
                self.note_dropped(self.buffer.len());
                self.discarding = true;
            }
            self.buffer.clear();
        }

        self.scanned = self.buffer.len();
        self.lines_emitted += lines.len() as u64;
        lines
    }

    /// End of stream: discard the dangling partial line, if any.
    ///
    /// Returns the number of bytes dropped.
    pub fn finish(&mut self) -> usize {
        let dropped = self.buffer.len();
        if dropped > 0 {
            tracing::debug!("Discarding {} bytes of unterminated line at end of stream", dropped);
        }
        self.buffer.clear();
        self.scanned = 0;
        self.discarding = false;
        dropped
    }

    /// Number of buffered bytes not yet terminated by a newline
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Number of complete lines emitted since creation
    pub fn lines_emitted(&self) -> u64 {
        self.lines_emitted
    }

    /// Number of lines dropped for exceeding the maximum length
    pub fn lines_dropped(&self) -> u64 {
        self.lines_dropped
    }

    fn note_dropped(&mut self, seen: usize) {
        self.lines_dropped += 1;
        tracing::debug!(
            "Dropping line longer than {} bytes ({} bytes seen)",
            self.max_line,
            seen
        );
    }

    fn find_newline(&self) -> Option<usize> {
        self.buffer[self.scanned..]
            .iter()
            .position(|b| *b == b'\n')
            .map(|p| p + self.scanned)
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}
