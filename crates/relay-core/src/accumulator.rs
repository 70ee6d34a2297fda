//! Reassembly buffer for inbound result frames.
//!
//! A result may arrive split across several connections. Bytes from every
//! connection are appended here until they form one complete frame:
//!
//! ```text
//! <one-character tag>,<JSON {"status": int, "value": any}>
//! ```
//!
//! An incomplete buffer is never consumed; the caller asks the peer for more
//! and tries again on the next connection.

use crate::config::ProtocolConfig;
use crate::protocol::{ResultFrame, ResultPayload};
use crate::{RelayError, Result};
use bytes::BytesMut;
use tracing::warn;

/// Longest possible UTF-8 encoding of the one-character type tag.
const MAX_TAG_BYTES: usize = 4;

/// Outcome of a parse attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// The buffered bytes are a prefix of a frame.
    NeedsMoreData,
    /// A full frame was parsed and the buffer cleared.
    Complete(ResultFrame),
}

/// Buffers raw bytes from the peer until they form a result frame.
#[derive(Debug)]
pub struct ResultAccumulator {
    buffer: BytesMut,
    max_bytes: usize,
}

impl Default for ResultAccumulator {
    fn default() -> Self {
        Self::new(ProtocolConfig::DEFAULT_MAX_RESULT_BYTES)
    }
}

impl ResultAccumulator {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_bytes,
        }
    }

    /// Append a chunk read from the peer.
    ///
    /// Fails without buffering anything when the total would exceed the
    /// configured limit.
    pub fn add_data(&mut self, chunk: &[u8]) -> Result<()> {
        let size = self.buffer.len() + chunk.len();
        if size > self.max_bytes {
            return Err(RelayError::ResultTooLarge {
                size,
                limit: self.max_bytes,
            });
        }
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    /// Try to parse one complete frame from the buffered bytes.
    pub fn get_result(&mut self) -> Result<Frame> {
        let Some((frame, consumed)) = parse_frame(&self.buffer)? else {
            return Ok(Frame::NeedsMoreData);
        };

        let trailing = &self.buffer[consumed..];
        if trailing.iter().any(|b| !b.is_ascii_whitespace()) {
            warn!(
                bytes = trailing.len(),
                "Discarding bytes after complete result frame"
            );
        }
        self.buffer.clear();

        Ok(Frame::Complete(frame))
    }

    /// Drop everything buffered.
    pub fn reset_buffer(&mut self) {
        self.buffer.clear();
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Parse a frame from the front of `buf`.
///
/// Returns the frame and the number of bytes it occupied, `None` if `buf` is
/// a valid prefix, or `MalformedFrame` if no amount of extra data can help.
fn parse_frame(buf: &[u8]) -> Result<Option<(ResultFrame, usize)>> {
    let Some(sep) = buf
        .iter()
        .position(|b| *b == ProtocolConfig::TAG_SEPARATOR)
    else {
        if buf.len() > MAX_TAG_BYTES {
            return Err(malformed("missing ',' after type tag"));
        }
        return Ok(None);
    };

    let tag_text =
        std::str::from_utf8(&buf[..sep]).map_err(|_| malformed("type tag is not valid UTF-8"))?;
    let mut chars = tag_text.chars();
    let tag = match (chars.next(), chars.next()) {
        (Some(c), None) => c,
        _ => {
            return Err(malformed(format!(
                "expected a one-character type tag, got {:?}",
                tag_text
            )))
        }
    };

    let body_start = sep + 1;
    let mut stream =
        serde_json::Deserializer::from_slice(&buf[body_start..]).into_iter::<ResultPayload>();

    match stream.next() {
        None => Ok(None),
        Some(Ok(payload)) => {
            let consumed = body_start + stream.byte_offset();
            let frame = ResultFrame {
                tag,
                status: payload.status,
                value: payload.value,
            };
            Ok(Some((frame, consumed)))
        }
        Some(Err(e)) if e.is_eof() => Ok(None),
        Some(Err(e)) => Err(malformed(e.to_string())),
    }
}

fn malformed(message: impl Into<String>) -> RelayError {
    RelayError::MalformedFrame {
        message: message.into(),
    }
}
