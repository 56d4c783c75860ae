//! Newline framing for the chat protocol
//!
//! Splits a byte stream into lines and writes messages as lines. Decoding
//! stops at the line: turning a line into a [`Message`](crate::message::Message)
//! happens in the caller, so a malformed line can be answered with an
//! ERROR instead of killing the stream. That includes lines that are not
//! valid UTF-8, which come out as a [`Frame`] carrying a [`DecodeError`].

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ChatError, DecodeError};
use crate::message::{ClientMessage, ServerMessage};

/// Default cap on a single line, in bytes
pub const DEFAULT_MAX_LINE_LENGTH: usize = 4096;

/// One decoded line, or the reason it is not text
pub type Frame = Result<String, DecodeError>;

/// Line codec for [`FramedRead`](tokio_util::codec::FramedRead) /
/// [`FramedWrite`](tokio_util::codec::FramedWrite)
#[derive(Debug, Clone)]
pub struct ChatCodec {
    max_length: usize,
    /// Where to resume the newline search in the buffer
    next_index: usize,
}

impl ChatCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_LENGTH)
    }

    /// Lines longer than `max_length` fail the stream
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
        }
    }

    fn frame(line: &[u8]) -> Frame {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        std::str::from_utf8(line)
            .map(str::to_string)
            .map_err(|_| DecodeError::InvalidUtf8)
    }
}

impl Default for ChatCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ChatCodec {
    type Item = Frame;
    type Error = ChatError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ChatError> {
        // A line of exactly max_length bytes still has room for its newline
        let read_to = src.len().min(self.max_length.saturating_add(1));

        match src[self.next_index..read_to].iter().position(|b| *b == b'\n') {
            Some(offset) => {
                let end = self.next_index + offset;
                self.next_index = 0;
                let line = src.split_to(end + 1);
                Ok(Some(Self::frame(&line[..end])))
            }
            None if src.len() > self.max_length => Err(ChatError::LineTooLong(self.max_length)),
            None => {
                self.next_index = read_to;
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ChatError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            return Ok(None);
        }

        // Unterminated last line
        self.next_index = 0;
        let line = src.split_to(src.len());
        Ok(Some(Self::frame(&line)))
    }
}

fn write_line(line: &str, dst: &mut BytesMut) {
    dst.reserve(line.len() + 1);
    dst.put_slice(line.as_bytes());
    dst.put_u8(b'\n');
}

impl Encoder<ServerMessage> for ChatCodec {
    type Error = ChatError;

    fn encode(&mut self, msg: ServerMessage, dst: &mut BytesMut) -> Result<(), ChatError> {
        write_line(&msg.encode(), dst);
        Ok(())
    }
}

impl Encoder<ClientMessage> for ChatCodec {
    type Error = ChatError;

    fn encode(&mut self, msg: ClientMessage, dst: &mut BytesMut) -> Result<(), ChatError> {
        write_line(&msg.encode(), dst);
        Ok(())
    }
}
