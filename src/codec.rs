//! Newline-delimited frame codec.
//!
//! Turns a byte stream into frames and back:
//!
//! ```text
//! Request:  hello\n
//! Response: host processed request: hello\n
//! ```
//!
//! There is no escaping. A frame never contains the delimiter; asking the
//! encoder to write one that does is a caller error and is rejected.

use crate::error::RelayError;
use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Frame delimiter.
pub const DELIMITER: u8 = b'\n';

/// Default bound on a frame's length, delimiter excluded.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024;

/// One frame's payload, without its delimiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Bytes);

impl Frame {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Frame(payload.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// View the payload as UTF-8 text.
    pub fn to_text(&self) -> Result<&str, RelayError> {
        std::str::from_utf8(&self.0)
            .map_err(|e| RelayError::ProtocolViolation(format!("frame is not UTF-8: {e}")))
    }
}

impl From<String> for Frame {
    fn from(s: String) -> Self {
        Frame::new(s)
    }
}

impl From<&'static str> for Frame {
    fn from(s: &'static str) -> Self {
        Frame::new(Bytes::from_static(s.as_bytes()))
    }
}

/// Codec for `\n`-terminated frames with a length bound.
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_length: usize,
    /// Where to resume scanning for the delimiter on the next call.
    next_index: usize,
}

impl LineCodec {
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
        }
    }

    fn too_long(&self, len: usize) -> RelayError {
        RelayError::ProtocolViolation(format!(
            "frame of {len} bytes exceeds limit of {}",
            self.max_length
        ))
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::with_max_length(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl Decoder for LineCodec {
    type Item = Frame;
    type Error = RelayError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, RelayError> {
        match find_delimiter(&buf[self.next_index..]) {
            Some(offset) => {
                let end = self.next_index + offset;
                self.next_index = 0;
                if end > self.max_length {
                    return Err(self.too_long(end));
                }
                let mut line = buf.split_to(end + 1);
                line.truncate(end);
                Ok(Some(Frame(line.freeze())))
            }
            None => {
                if buf.len() > self.max_length {
                    self.next_index = 0;
                    return Err(self.too_long(buf.len()));
                }
                self.next_index = buf.len();
                Ok(None)
            }
        }
    }

    /// A trailing unterminated frame is delivered as the last frame.
    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, RelayError> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        self.next_index = 0;
        if buf.is_empty() {
            return Ok(None);
        }
        Ok(Some(Frame(buf.split().freeze())))
    }
}

impl Encoder<Frame> for LineCodec {
    type Error = RelayError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), RelayError> {
        if let Some(pos) = find_delimiter(frame.as_bytes()) {
            return Err(RelayError::ProtocolViolation(format!(
                "delimiter embedded in frame at byte {pos}"
            )));
        }
        dst.reserve(frame.as_bytes().len() + 1);
        dst.put_slice(frame.as_bytes());
        dst.put_u8(DELIMITER);
        Ok(())
    }
}

fn find_delimiter(buffer: &[u8]) -> Option<usize> {
    buffer.iter().position(|&b| b == DELIMITER)
}
