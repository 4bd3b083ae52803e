//! WebSocket message assembly
//!
//! Sits on top of the frame parser and turns the inbound frame stream into
//! whole messages:
//! - fragmented data frames are reassembled before delivery,
//! - control frames (close/ping/pong) pass through even mid-fragmentation,
//! - text payloads are UTF-8 validated.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::frame::{Frame, FrameParser, OpCode};

/// A complete WebSocket message, possibly assembled from fragments.
///
/// Close messages carry the raw frame payload so that echoing them back
/// reproduces the peer's bytes exactly.
#[derive(Debug, Clone)]
pub enum Message {
    /// Text message (UTF-8 validated)
    Text(Bytes),
    /// Binary message
    Binary(Bytes),
    /// Close message with the raw close payload
    Close(Bytes),
    /// Ping message
    Ping(Bytes),
    /// Pong message
    Pong(Bytes),
}

impl Message {
    /// Check if this is a text message
    #[inline]
    pub fn is_text(&self) -> bool {
        matches!(self, Message::Text(_))
    }

    /// Check if this is a binary message
    #[inline]
    pub fn is_binary(&self) -> bool {
        matches!(self, Message::Binary(_))
    }

    /// Check if this is a close message
    #[inline]
    pub fn is_close(&self) -> bool {
        matches!(self, Message::Close(_))
    }

    /// Get message as text (None for non-text messages)
    #[inline]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            // SAFETY: Text payloads are UTF-8 validated during assembly
            Message::Text(b) => Some(unsafe { std::str::from_utf8_unchecked(b) }),
            _ => None,
        }
    }

    /// Get the message payload as bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(b)
            | Message::Binary(b)
            | Message::Close(b)
            | Message::Ping(b)
            | Message::Pong(b) => b,
        }
    }

    /// Consume the message and return its payload
    pub fn into_bytes(self) -> Bytes {
        match self {
            Message::Text(b)
            | Message::Binary(b)
            | Message::Close(b)
            | Message::Ping(b)
            | Message::Pong(b) => b,
        }
    }
}

/// Incremental message parser.
///
/// `parse` ingests raw transport bytes; completed messages queue up and are
/// drained with [`MessageParser::pop`]. A returned error marks a protocol
/// violation by the peer; messages completed before the violation remain in
/// the queue.
#[derive(Debug)]
pub struct MessageParser {
    buf: BytesMut,
    parser: FrameParser,
    fragment_opcode: Option<OpCode>,
    fragment_buf: BytesMut,
    max_message_size: usize,
    messages: VecDeque<Message>,
}

impl MessageParser {
    /// Create a new message parser
    pub fn new(max_frame_size: usize, max_message_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            parser: FrameParser::new(max_frame_size),
            fragment_opcode: None,
            fragment_buf: BytesMut::new(),
            max_message_size,
            messages: VecDeque::new(),
        }
    }

    /// Ingest bytes and assemble any completed messages.
    pub fn parse(&mut self, data: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(data);

        while let Some(frame) = self.parser.parse(&mut self.buf)? {
            if let Some(message) = self.handle_frame(frame)? {
                self.messages.push_back(message);
            }
        }

        Ok(())
    }

    /// True if no completed message is waiting
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Peek at the oldest completed message
    #[inline]
    pub fn front(&self) -> Option<&Message> {
        self.messages.front()
    }

    /// Dequeue the oldest completed message
    #[inline]
    pub fn pop(&mut self) -> Option<Message> {
        self.messages.pop_front()
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<Option<Message>> {
        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.fragment_opcode.is_some() {
                    return Err(Error::Protocol("expected continuation frame"));
                }

                if frame.fin {
                    if frame.opcode == OpCode::Text {
                        if std::str::from_utf8(&frame.payload).is_err() {
                            return Err(Error::InvalidUtf8);
                        }
                        Ok(Some(Message::Text(frame.payload)))
                    } else {
                        Ok(Some(Message::Binary(frame.payload)))
                    }
                } else {
                    self.start_fragment(frame.opcode, &frame.payload)?;
                    Ok(None)
                }
            }

            OpCode::Continuation => {
                let opcode = self
                    .fragment_opcode
                    .ok_or(Error::Protocol("unexpected continuation frame"))?;

                if self.fragment_buf.len() + frame.payload.len() > self.max_message_size {
                    return Err(Error::MessageTooLarge);
                }
                self.fragment_buf.extend_from_slice(&frame.payload);

                if frame.fin {
                    self.complete_fragment(opcode).map(Some)
                } else {
                    Ok(None)
                }
            }

            OpCode::Close => Ok(Some(Message::Close(frame.payload))),
            OpCode::Ping => Ok(Some(Message::Ping(frame.payload))),
            OpCode::Pong => Ok(Some(Message::Pong(frame.payload))),
        }
    }

    fn start_fragment(&mut self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_message_size {
            return Err(Error::MessageTooLarge);
        }

        self.fragment_opcode = Some(opcode);
        self.fragment_buf.clear();
        self.fragment_buf.extend_from_slice(payload);
        Ok(())
    }

    fn complete_fragment(&mut self, opcode: OpCode) -> Result<Message> {
        self.fragment_opcode = None;
        let data = self.fragment_buf.split().freeze();

        if opcode == OpCode::Text {
            if std::str::from_utf8(&data).is_err() {
                return Err(Error::InvalidUtf8);
            }
            Ok(Message::Text(data))
        } else {
            Ok(Message::Binary(data))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::tests::masked_frame;

    fn parser() -> MessageParser {
        MessageParser::new(1024 * 1024, 1024 * 1024)
    }

    #[test]
    fn single_text_message() {
        let mut p = parser();
        p.parse(&masked_frame(OpCode::Text, b"hello", true)).unwrap();

        let msg = p.pop().unwrap();
        assert_eq!(msg.as_text(), Some("hello"));
        assert!(p.is_empty());
    }

    #[test]
    fn fragmented_text_reassembled() {
        let mut p = parser();
        p.parse(&masked_frame(OpCode::Text, b"hel", false)).unwrap();
        assert!(p.is_empty());
        p.parse(&masked_frame(OpCode::Continuation, b"lo", true))
            .unwrap();

        let msg = p.pop().unwrap();
        assert_eq!(msg.as_text(), Some("hello"));
    }

    #[test]
    fn ping_interleaved_with_fragments() {
        let mut p = parser();
        p.parse(&masked_frame(OpCode::Binary, b"ab", false)).unwrap();
        p.parse(&masked_frame(OpCode::Ping, b"ping", true)).unwrap();

        // the ping surfaces first, the data message once its fin arrives
        assert!(matches!(p.pop(), Some(Message::Ping(_))));

        p.parse(&masked_frame(OpCode::Continuation, b"cd", true))
            .unwrap();
        let msg = p.pop().unwrap();
        assert!(msg.is_binary());
        assert_eq!(msg.as_bytes(), b"abcd");
    }

    #[test]
    fn close_payload_is_raw() {
        let mut p = parser();
        let payload = [0x03, 0xE8, b'b', b'y', b'e']; // 1000 + "bye"
        p.parse(&masked_frame(OpCode::Close, &payload, true)).unwrap();

        match p.pop().unwrap() {
            Message::Close(b) => assert_eq!(b.as_ref(), &payload),
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[test]
    fn invalid_utf8_rejected() {
        let mut p = parser();
        let err = p
            .parse(&masked_frame(OpCode::Text, &[0xFF, 0xFE], true))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidUtf8));
    }

    #[test]
    fn data_frame_during_fragmentation_rejected() {
        let mut p = parser();
        p.parse(&masked_frame(OpCode::Text, b"a", false)).unwrap();
        assert!(p.parse(&masked_frame(OpCode::Text, b"b", true)).is_err());
    }

    #[test]
    fn oversized_message_rejected() {
        let mut p = MessageParser::new(1024, 8);
        p.parse(&masked_frame(OpCode::Binary, b"12345", false))
            .unwrap();
        let err = p
            .parse(&masked_frame(OpCode::Continuation, b"6789", true))
            .unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge));
    }

    #[test]
    fn messages_before_violation_survive() {
        let mut p = parser();
        let mut wire = masked_frame(OpCode::Text, b"ok", true);
        wire.extend_from_slice(&masked_frame(OpCode::Text, &[0xFF], true));

        assert!(p.parse(&wire).is_err());
        assert_eq!(p.pop().unwrap().as_text(), Some("ok"));
    }
}
