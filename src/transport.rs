//! Connection transports
//!
//! A connection owns exactly one transport: plain TCP, or TCP wrapped in a
//! server-side TLS session. The two flavors differ only in how bytes move:
//!
//! - plain writes go straight to the socket, so a partially-written buffer
//!   stays at the head of the connection's send queue;
//! - TLS writes move whole buffers into the session's clear-text queue
//!   unconditionally, and the session drains itself through `write_tls`.
//!
//! All sockets are non-blocking. Readiness is edge-triggered, so a read
//! drains the socket completely, and a peer close observed during the drain
//! must ride along with the bytes read before it: there is no guarantee of
//! another readable edge to re-report it. [`ReadOutcome::Closed`] carries
//! both.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use rustls::{ServerConfig, ServerConnection};
use tracing::debug;

use crate::RECV_CHUNK_SIZE;
use crate::error::{Error, Result};

/// Outcome of draining a readable transport.
#[derive(Debug)]
pub enum ReadOutcome {
    /// Bytes currently available; the peer is still there
    Data(Bytes),
    /// The peer closed; any bytes read before the EOF come along with it
    Closed(Bytes),
}

/// A connection's transport, chosen at accept time.
pub enum Transport {
    /// Plain TCP
    Plain(TcpStream),
    /// TLS-wrapped TCP
    Tls(TlsTransport),
}

/// TCP stream plus a server-side TLS session and its clear-text out-queue.
pub struct TlsTransport {
    stream: TcpStream,
    session: ServerConnection,
    out_plain: VecDeque<Bytes>,
    out_plain_bytes: usize,
}

impl Transport {
    /// Wrap an accepted stream as a plain transport.
    pub fn plain(stream: TcpStream) -> Self {
        Transport::Plain(stream)
    }

    /// Wrap an accepted stream in a fresh server-side TLS session.
    pub fn tls(stream: TcpStream, config: Arc<ServerConfig>) -> Result<Self> {
        let session = ServerConnection::new(config)?;
        Ok(Transport::Tls(TlsTransport {
            stream,
            session,
            out_plain: VecDeque::new(),
            out_plain_bytes: 0,
        }))
    }

    /// The underlying file descriptor, for readiness registration.
    pub fn raw_fd(&self) -> RawFd {
        match self {
            Transport::Plain(stream) => stream.as_raw_fd(),
            Transport::Tls(tls) => tls.stream.as_raw_fd(),
        }
    }

    /// The peer's socket address.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        let addr = match self {
            Transport::Plain(stream) => stream.peer_addr()?,
            Transport::Tls(tls) => tls.stream.peer_addr()?,
        };
        Ok(addr)
    }

    /// Read the currently-available bytes without blocking.
    ///
    /// `Data` with an empty buffer means nothing was available (for TLS,
    /// possibly because the bytes were handshake traffic); a peer close is
    /// never deferred, it is reported as `Closed` in the same call that
    /// observed it.
    pub fn read(&mut self) -> Result<ReadOutcome> {
        match self {
            Transport::Plain(stream) => read_plain(stream),
            Transport::Tls(tls) => tls.read(),
        }
    }

    /// Drain the connection's send queue into the transport.
    pub fn write(&mut self, send_buffer: &mut VecDeque<Bytes>) -> Result<()> {
        match self {
            Transport::Plain(stream) => write_plain(stream, send_buffer),
            Transport::Tls(tls) => tls.write(send_buffer),
        }
    }

    /// True if the transport itself still holds bytes to flush.
    pub fn has_buffered(&self) -> bool {
        match self {
            Transport::Plain(_) => false,
            Transport::Tls(tls) => !tls.out_plain.is_empty() || tls.session.wants_write(),
        }
    }

    /// Transport-internal buffered byte count (clear-text, TLS only).
    pub fn buffered_bytes(&self) -> usize {
        match self {
            Transport::Plain(_) => 0,
            Transport::Tls(tls) => tls.out_plain_bytes,
        }
    }

    /// Discard transport-internal buffered bytes (TLS only).
    pub fn clear_buffer(&mut self) {
        if let Transport::Tls(tls) = self {
            tls.out_plain.clear();
            tls.out_plain_bytes = 0;
        }
    }
}

fn read_plain(stream: &mut TcpStream) -> Result<ReadOutcome> {
    let mut data = BytesMut::new();
    let mut chunk = [0u8; RECV_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => return Ok(ReadOutcome::Closed(data.freeze())),
            Ok(n) => data.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if data.is_empty() {
                    return Err(e.into());
                }
                debug!(error = %e, "socket read failed; treating as close");
                return Ok(ReadOutcome::Closed(data.freeze()));
            }
        }
    }

    Ok(ReadOutcome::Data(data.freeze()))
}

fn write_plain(stream: &mut TcpStream, send_buffer: &mut VecDeque<Bytes>) -> Result<()> {
    while let Some(head) = send_buffer.front_mut() {
        match stream.write(head) {
            Ok(0) => return Err(Error::ConnectionClosed),
            Ok(n) if n < head.len() => {
                // keep the unwritten suffix at the head of the queue
                head.advance(n);
                break;
            }
            Ok(_) => {
                send_buffer.pop_front();
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

impl TlsTransport {
    fn read(&mut self) -> Result<ReadOutcome> {
        let mut closed = false;

        loop {
            match self.session.read_tls(&mut self.stream) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "TLS socket read failed; treating as close");
                    closed = true;
                    break;
                }
            }
        }

        let io_state = match self.session.process_new_packets() {
            Ok(state) => state,
            Err(e) => {
                // push the fatal alert out before reporting the failure
                let _ = self.write_session_tls();
                return Err(e.into());
            }
        };

        let n = io_state.plaintext_bytes_to_read();
        let mut data = BytesMut::zeroed(n);
        if n > 0 {
            self.session.reader().read_exact(&mut data)?;
        }

        // the session may owe handshake or alert records after processing
        if closed {
            let _ = self.write_session_tls();
        } else {
            self.write_session_tls()?;
        }

        // a close observed in this pass must not be masked by plaintext that
        // arrived with it; there may be no further readable edge
        if closed || io_state.peer_has_closed() {
            return Ok(ReadOutcome::Closed(data.freeze()));
        }

        Ok(ReadOutcome::Data(data.freeze()))
    }

    fn write(&mut self, send_buffer: &mut VecDeque<Bytes>) -> Result<()> {
        // the session owns its own buffering: take every queued buffer
        while let Some(buf) = send_buffer.pop_front() {
            self.out_plain_bytes += buf.len();
            self.out_plain.push_back(buf);
        }

        self.flush()
    }

    /// Move clear-text into the session and TLS records onto the socket
    /// until one of them stops making progress.
    fn flush(&mut self) -> Result<()> {
        loop {
            let mut progressed = false;

            while let Some(head) = self.out_plain.front_mut() {
                match self.session.writer().write(head) {
                    Ok(0) => break, // session buffer limit reached
                    Ok(n) => {
                        progressed = true;
                        self.out_plain_bytes -= n;
                        if n < head.len() {
                            head.advance(n);
                            break;
                        }
                        self.out_plain.pop_front();
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            progressed |= self.write_session_tls()?;

            if !progressed {
                return Ok(());
            }
        }
    }

    /// Drain pending TLS records to the socket. Returns whether any byte moved.
    fn write_session_tls(&mut self) -> Result<bool> {
        let mut progressed = false;

        while self.session.wants_write() {
            match self.session.write_tls(&mut self.stream) {
                Ok(0) => break,
                Ok(_) => progressed = true,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(progressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (server, client)
    }

    #[test]
    fn plain_read_returns_available_bytes() {
        let (server, mut client) = socket_pair();
        let mut transport = Transport::plain(server);

        client.write_all(b"ping").unwrap();
        // give loopback delivery a moment
        std::thread::sleep(std::time::Duration::from_millis(20));

        match transport.read().unwrap() {
            ReadOutcome::Data(data) => assert_eq!(data.as_ref(), b"ping"),
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[test]
    fn plain_read_without_data_is_empty() {
        let (server, _client) = socket_pair();
        let mut transport = Transport::plain(server);

        match transport.read().unwrap() {
            ReadOutcome::Data(data) => assert!(data.is_empty()),
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[test]
    fn plain_read_reports_eof() {
        let (server, client) = socket_pair();
        let mut transport = Transport::plain(server);

        drop(client);
        std::thread::sleep(std::time::Duration::from_millis(20));

        match transport.read().unwrap() {
            ReadOutcome::Closed(data) => assert!(data.is_empty()),
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[test]
    fn plain_read_delivers_final_bytes_with_the_close() {
        let (server, mut client) = socket_pair();
        let mut transport = Transport::plain(server);

        // bytes and the close land in the same drain; the close must not be
        // lost behind them
        client.write_all(b"last words").unwrap();
        drop(client);
        std::thread::sleep(std::time::Duration::from_millis(20));

        match transport.read().unwrap() {
            ReadOutcome::Closed(data) => assert_eq!(data.as_ref(), b"last words"),
            other => panic!("expected close with data, got {:?}", other),
        }
    }

    #[test]
    fn plain_write_drains_fifo() {
        let (server, mut client) = socket_pair();
        let mut transport = Transport::plain(server);

        let mut queue: VecDeque<Bytes> =
            [Bytes::from_static(b"one"), Bytes::from_static(b"two")].into();
        transport.write(&mut queue).unwrap();
        assert!(queue.is_empty());
        assert!(!transport.has_buffered());
        assert_eq!(transport.buffered_bytes(), 0);

        let mut got = [0u8; 6];
        client.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"onetwo");
    }

    #[test]
    fn peer_addr_matches_client() {
        let (server, client) = socket_pair();
        let transport = Transport::plain(server);
        assert_eq!(
            transport.peer_addr().unwrap(),
            client.local_addr().unwrap()
        );
    }
}
