//! Error types for the server core

use std::fmt;
use std::io;

/// Result type alias for server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Server error types
#[derive(Debug)]
pub enum Error {
    /// I/O error from the underlying socket
    Io(io::Error),
    /// Invalid WebSocket frame
    InvalidFrame(&'static str),
    /// Invalid UTF-8 in a text message
    InvalidUtf8,
    /// Protocol violation
    Protocol(&'static str),
    /// Invalid HTTP in the upgrade handshake
    InvalidHttp(&'static str),
    /// Peer closed the connection
    ConnectionClosed,
    /// Connection reset by peer
    ConnectionReset,
    /// Would block (non-blocking I/O)
    WouldBlock,
    /// Frame too large
    FrameTooLarge,
    /// Message too large
    MessageTooLarge,
    /// TLS session error
    Tls(rustls::Error),
    /// No connection with this identifier
    UnknownConnection(u64),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::InvalidFrame(msg) => write!(f, "Invalid frame: {}", msg),
            Error::InvalidUtf8 => write!(f, "Invalid UTF-8 in text message"),
            Error::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            Error::InvalidHttp(msg) => write!(f, "Invalid HTTP: {}", msg),
            Error::ConnectionClosed => write!(f, "Connection closed"),
            Error::ConnectionReset => write!(f, "Connection reset by peer"),
            Error::WouldBlock => write!(f, "Would block"),
            Error::FrameTooLarge => write!(f, "Frame too large"),
            Error::MessageTooLarge => write!(f, "Message too large"),
            Error::Tls(e) => write!(f, "TLS error: {}", e),
            Error::UnknownConnection(id) => write!(f, "Unknown connection: {}", id),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Tls(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock => Error::WouldBlock,
            io::ErrorKind::ConnectionReset => Error::ConnectionReset,
            io::ErrorKind::BrokenPipe => Error::ConnectionClosed,
            io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            _ => Error::Io(e),
        }
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e)
    }
}

impl Error {
    /// True for errors that mean the peer is gone rather than misbehaving.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Error::ConnectionClosed | Error::ConnectionReset)
    }
}
