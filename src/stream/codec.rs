//! NDJSON line framing for the assistant's stdout.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length so a
//! misbehaving process cannot make the relay buffer an unbounded record.
//! Bytes are only decoded once a full line is present, so chunk boundaries
//! that fall inside a multi-byte character are harmless.
//!
//! # Usage
//!
//! ```rust
//! use bytes::BytesMut;
//! use assistant_relay::stream::codec::LineFramer;
//!
//! let mut framer = LineFramer::new();
//! let mut buf = BytesMut::new();
//! assert!(framer.push_chunk(&mut buf, b"{\"type\":").is_empty());
//! let records = framer.push_chunk(&mut buf, b"\"system\"}\n");
//! assert_eq!(records, vec![r#"{"type":"system"}"#.to_owned()]);
//! ```
//!
//! `FramedRead` ends its stream at the first decode error, so readers feed
//! chunks through [`LineFramer::push_chunk`] instead.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};
use tracing::debug;

use crate::{AppError, Result};

/// Maximum record length accepted by the framer: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Newline-delimited record framer.
///
/// # Decoder
///
/// Yields each `\n`-terminated record without its terminator (a trailing
/// `\r` is stripped too). Records longer than [`MAX_LINE_BYTES`] produce
/// [`AppError::Protocol`] and are skipped; framing resumes at the next
/// newline. At end of stream an unterminated tail is discarded.
#[derive(Debug)]
pub struct LineFramer(LinesCodec);

impl LineFramer {
    /// Create a framer with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    /// Create a framer with a custom per-record limit.
    #[must_use]
    pub fn with_max_length(max: usize) -> Self {
        Self(LinesCodec::new_with_max_length(max))
    }

    /// Feed one chunk and return every record it completes.
    ///
    /// Partial records stay buffered in `buf` for the next call. Over-long
    /// records are dropped.
    pub fn push_chunk(&mut self, buf: &mut BytesMut, chunk: &[u8]) -> Vec<String> {
        buf.extend_from_slice(chunk);
        let mut records = Vec::new();
        loop {
            match self.decode(buf) {
                Ok(Some(line)) => records.push(line),
                Ok(None) => break,
                Err(err) => debug!(%err, "line framer: dropping record"),
            }
        }
        records
    }

    /// Signal end of stream, discarding any unterminated tail.
    pub fn finish(&mut self, buf: &mut BytesMut) {
        if let Ok(Some(tail)) = self.decode_eof(buf) {
            debug!(len = tail.len(), "line framer: unexpected tail after eof");
        }
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineFramer {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    /// Drain complete records at end of stream.
    ///
    /// Unlike [`LinesCodec::decode_eof`], a final record without a newline
    /// is not yielded: the process ended mid-write and the fragment cannot
    /// be a complete event.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None => {
                if !src.is_empty() {
                    debug!(len = src.len(), "line framer: discarding partial record at eof");
                    src.clear();
                }
                Ok(None)
            }
        }
    }
}

fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Protocol("line too long: exceeded maximum record length".into())
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
