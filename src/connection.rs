//! Per-connection state
//!
//! A connection owns its transport, the two inbound parsers, and the ordered
//! queue of outbound byte buffers. The lifecycle state drives the event
//! loop's activation predicates; the server advances it, never the
//! connection itself.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::error::Result;
use crate::handshake::RequestParser;
use crate::protocol::MessageParser;
use crate::transport::{ReadOutcome, Transport};

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Handshake bytes not yet fully received
    NotConnected,
    /// Handshake response queued; awaiting drain
    Connecting,
    /// The application may send and receive messages
    Connected,
    /// Close frame queued; awaiting the peer's close
    Closing,
    /// No further I/O; drained, then dropped
    Closed,
}

pub(crate) struct Connection {
    pub(crate) transport: Transport,
    pub(crate) state: ConnState,
    pub(crate) handshake_parser: RequestParser,
    pub(crate) message_parser: MessageParser,
    pub(crate) send_buffer: VecDeque<Bytes>,
}

impl Connection {
    pub(crate) fn new(transport: Transport, max_frame_size: usize, max_message_size: usize) -> Self {
        Self {
            transport,
            state: ConnState::NotConnected,
            handshake_parser: RequestParser::new(),
            message_parser: MessageParser::new(max_frame_size, max_message_size),
            send_buffer: VecDeque::new(),
        }
    }

    /// Read the currently-available bytes from the transport.
    pub(crate) fn read(&mut self) -> Result<ReadOutcome> {
        self.transport.read()
    }

    /// Drain the send buffer into the transport.
    pub(crate) fn write(&mut self) -> Result<()> {
        self.transport.write(&mut self.send_buffer)
    }

    /// True while any outbound byte is still queued, here or in the transport.
    pub(crate) fn data_to_send(&self) -> bool {
        !self.send_buffer.is_empty() || self.transport.has_buffered()
    }

    /// Total queued outbound bytes, including transport-internal buffering.
    pub(crate) fn buffer_bytes(&self) -> usize {
        let queued: usize = self.send_buffer.iter().map(|b| b.len()).sum();
        queued + self.transport.buffered_bytes()
    }

    /// Discard every queued outbound byte.
    pub(crate) fn clear_buffer(&mut self) {
        self.send_buffer.clear();
        self.transport.clear_buffer();
    }
}
