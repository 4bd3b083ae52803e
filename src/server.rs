//! WebSocket server core
//!
//! Multiplexes any number of client connections through a single
//! readiness-based event loop. Each connection walks a small state machine:
//!
//! ```text
//! NotConnected -> Connecting -> Connected -> Closing -> Closed
//!        \------------\------------\-----------------> Closed
//! ```
//!
//! Admission control works through the listener itself: when the population
//! reaches the configured cap the listening socket is closed, leaving
//! overload backpressure to the OS accept queue, and a fresh listener is
//! bound once garbage collection brings the population back under the cap.
//!
//! Closed connections are never erased mid-iteration. Dropping a connection
//! marks it and fires the close upcall; the table entry is reclaimed only
//! after the dispatch pass, so every action dispatched in the same iteration
//! still finds its connection.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use crate::Config;
use crate::connection::{ConnState, Connection};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::handshake::handshake_response;
use crate::poller::{Action, ActionResult, Direction, PollResult, Poller, Registrar};
use crate::protocol::Message;
use crate::transport::{ReadOutcome, Transport};

/// Transport flavor, chosen at construction
enum Flavor {
    Plain,
    Tls(Arc<rustls::ServerConfig>),
}

/// Upcall fired once a connection finishes its handshake
pub type OpenCallback = Box<dyn FnMut(&mut ServerCore, u64)>;
/// Upcall fired for every complete text or binary message
pub type MessageCallback = Box<dyn FnMut(&mut ServerCore, u64, Message)>;
/// Upcall fired exactly once when a connection is dropped
pub type CloseCallback = Box<dyn FnMut(&mut ServerCore, u64)>;

/// The server state the event loop drives and upcalls receive.
///
/// Application callbacks get `&mut ServerCore`, so they can queue frames or
/// close connections from inside an upcall; outside of callbacks the same
/// operations are reachable through [`WsServer`].
pub struct ServerCore {
    listen_addr: SocketAddr,
    config: Config,
    flavor: Flavor,
    listener: Option<TcpListener>,
    active: bool,
    next_connection_id: u64,
    connections: HashMap<u64, Connection>,
    closed_connections: HashSet<u64>,
    open_callback: Option<OpenCallback>,
    message_callback: Option<MessageCallback>,
    close_callback: Option<CloseCallback>,
}

impl ServerCore {
    /// Queue a frame for transmission.
    ///
    /// Returns false (after logging) unless the connection is in the
    /// Connected state.
    pub fn queue_frame(&mut self, conn_id: u64, frame: Frame) -> bool {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            warn!(conn_id, "cannot queue frame for unknown connection");
            return false;
        };

        if conn.state != ConnState::Connected {
            warn!(conn_id, "not connected; cannot queue the frame");
            return false;
        }

        conn.send_buffer.push_back(frame.to_wire());
        true
    }

    /// Begin a graceful close: queue an empty Close frame and wait for the
    /// peer's acknowledgment.
    pub fn close_connection(&mut self, conn_id: u64) {
        match self.connections.get(&conn_id).map(|conn| conn.state) {
            None => {
                warn!(conn_id, "cannot close unknown connection");
            }
            Some(ConnState::Connected) => {
                self.queue_frame(conn_id, Frame::close_empty());
                if let Some(conn) = self.connections.get_mut(&conn_id) {
                    conn.state = ConnState::Closing;
                }
            }
            Some(_) => {
                warn!(conn_id, "not connected; cannot close the connection");
            }
        }
    }

    /// Discard every outbound byte queued for a connection.
    pub fn clear_buffer(&mut self, conn_id: u64) -> Result<()> {
        let conn = self
            .connections
            .get_mut(&conn_id)
            .ok_or(Error::UnknownConnection(conn_id))?;
        conn.clear_buffer();
        Ok(())
    }

    /// The peer address of a connection.
    pub fn peer_addr(&self, conn_id: u64) -> Result<SocketAddr> {
        let conn = self
            .connections
            .get(&conn_id)
            .ok_or(Error::UnknownConnection(conn_id))?;
        conn.transport.peer_addr()
    }

    /// Outbound bytes queued for a connection, including transport-internal
    /// buffering.
    pub fn buffer_bytes(&self, conn_id: u64) -> Result<usize> {
        let conn = self
            .connections
            .get(&conn_id)
            .ok_or(Error::UnknownConnection(conn_id))?;
        Ok(conn.buffer_bytes())
    }

    /// Number of live connections (including those awaiting collection).
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// True while the listener is accepting new connections.
    pub fn is_listening(&self) -> bool {
        self.active
    }

    /// Mark a connection closed, fire the close upcall, and schedule the
    /// table entry for collection after the dispatch pass. Idempotent.
    fn drop_connection(&mut self, conn_id: u64) {
        if self.closed_connections.contains(&conn_id) {
            return;
        }
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return;
        };

        conn.state = ConnState::Closed;
        self.closed_connections.insert(conn_id);
        debug!(conn_id, "dropping connection");
        self.invoke_close_callback(conn_id);
    }

    /// Accept-readiness handler: drain the accept queue, installing actions
    /// for each new connection, and close the listener at the cap.
    fn handle_accept(&mut self, registrar: &mut Registrar<ServerCore>) -> ActionResult {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return ActionResult::CancelAll;
            };

            let (stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return ActionResult::Continue;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return ActionResult::Continue;
                }
            };

            if let Err(e) = stream.set_nonblocking(true) {
                warn!(%peer, error = %e, "could not make accepted socket non-blocking");
                continue;
            }

            let transport = match &self.flavor {
                Flavor::Plain => Transport::plain(stream),
                Flavor::Tls(tls_config) => match Transport::tls(stream, Arc::clone(tls_config)) {
                    Ok(transport) => transport,
                    Err(e) => {
                        warn!(%peer, error = %e, "could not start TLS session");
                        continue;
                    }
                },
            };

            let conn_id = self.next_connection_id;
            self.next_connection_id += 1;
            let fd = transport.raw_fd();

            debug!(conn_id, %peer, "accepted connection");
            self.connections.insert(
                conn_id,
                Connection::new(
                    transport,
                    self.config.max_frame_size,
                    self.config.max_message_size,
                ),
            );

            registrar.add_action(read_action(fd, conn_id));
            registrar.add_action(write_action(fd, conn_id));

            if self.connections.len() >= self.config.max_connections {
                // push overload back into the OS accept queue
                debug!(
                    count = self.connections.len(),
                    "connection cap reached; closing listener"
                );
                self.listener = None;
                self.active = false;
                return ActionResult::CancelAll;
            }
        }
    }

    /// Read-readiness handler for one connection.
    fn handle_readable(&mut self, conn_id: u64) -> ActionResult {
        let read_result = match self.connections.get_mut(&conn_id) {
            Some(conn) => conn.read(),
            None => return ActionResult::CancelAll,
        };

        let (data, closed) = match read_result {
            Ok(ReadOutcome::Data(data)) => (data, false),
            Ok(ReadOutcome::Closed(data)) => (data, true),
            Err(e) => {
                if e.is_disconnect() {
                    debug!(conn_id, "peer closed the connection");
                } else {
                    warn!(conn_id, error = %e, "read failed");
                }
                self.drop_connection(conn_id);
                return ActionResult::CancelAll;
            }
        };

        let state = match self.connections.get(&conn_id) {
            Some(conn) => conn.state,
            None => return ActionResult::CancelAll,
        };

        let result = match state {
            ConnState::NotConnected => self.read_handshake(conn_id, &data),
            ConnState::Connected => self.read_messages(conn_id, &data),
            ConnState::Closing => self.read_closing(conn_id, &data),
            // excluded by the activation predicate
            ConnState::Connecting | ConnState::Closed => ActionResult::Continue,
        };

        if !closed {
            return result;
        }

        // the peer is gone; whatever the final bytes produced has been
        // handled, and no further readable edge will arrive
        debug!(conn_id, "peer closed the connection");
        self.drop_connection(conn_id);
        ActionResult::CancelAll
    }

    fn read_handshake(&mut self, conn_id: u64, data: &[u8]) -> ActionResult {
        let rejected = {
            let Some(conn) = self.connections.get_mut(&conn_id) else {
                return ActionResult::CancelAll;
            };

            match conn.handshake_parser.parse(data) {
                Err(e) => {
                    warn!(conn_id, error = %e, "failed to parse handshake request");
                    true
                }
                Ok(()) => match conn.handshake_parser.pop() {
                    None => false,
                    Some(request) => {
                        let response = handshake_response(&request);
                        conn.send_buffer.push_back(response.to_wire());

                        if response.status() != 101 {
                            // dropping cancels the write action, so the
                            // rejection usually never reaches the peer
                            true
                        } else {
                            conn.state = ConnState::Connecting;
                            false
                        }
                    }
                },
            }
        };

        if rejected {
            self.drop_connection(conn_id);
            ActionResult::CancelAll
        } else {
            ActionResult::Continue
        }
    }

    fn read_messages(&mut self, conn_id: u64, data: &[u8]) -> ActionResult {
        let parse_error = {
            let Some(conn) = self.connections.get_mut(&conn_id) else {
                return ActionResult::CancelAll;
            };
            conn.message_parser.parse(data).err()
        };

        if let Some(e) = parse_error {
            // close the connection if we received an invalid message
            warn!(conn_id, error = %e, "invalid message from peer");
            self.close_connection(conn_id);
            return ActionResult::Continue;
        }

        loop {
            let message = {
                let Some(conn) = self.connections.get_mut(&conn_id) else {
                    return ActionResult::CancelAll;
                };
                if conn.state != ConnState::Connected {
                    break;
                }
                conn.message_parser.pop()
            };
            let Some(message) = message else { break };

            match message {
                Message::Text(_) | Message::Binary(_) => {
                    self.invoke_message_callback(conn_id, message);
                }
                Message::Close(payload) => {
                    self.queue_frame(conn_id, Frame::close(payload));
                    if let Some(conn) = self.connections.get_mut(&conn_id) {
                        // the writer drains the echo, then drops us
                        conn.state = ConnState::Closed;
                    }
                }
                Message::Ping(_) => {
                    // the pong carries no payload
                    self.queue_frame(conn_id, Frame::pong(Bytes::new()));
                }
                Message::Pong(_) => {}
            }
        }

        ActionResult::Continue
    }

    fn read_closing(&mut self, conn_id: u64, data: &[u8]) -> ActionResult {
        let parse_error = {
            let Some(conn) = self.connections.get_mut(&conn_id) else {
                return ActionResult::CancelAll;
            };
            conn.message_parser.parse(data).err()
        };

        if let Some(e) = parse_error {
            // already closing, so invalid messages no longer matter
            debug!(conn_id, error = %e, "ignoring invalid message while closing");
            return ActionResult::Continue;
        }

        loop {
            let Some(conn) = self.connections.get_mut(&conn_id) else {
                return ActionResult::CancelAll;
            };
            let Some(message) = conn.message_parser.pop() else {
                break;
            };

            if message.is_close() {
                conn.state = ConnState::Closed;
                conn.send_buffer.clear();

                // no reason to keep polling this socket
                self.drop_connection(conn_id);
                return ActionResult::CancelAll;
            }
            // every other message type is ignored in this state
        }

        ActionResult::Continue
    }

    /// Write-readiness handler for one connection.
    fn handle_writable(&mut self, conn_id: u64) -> ActionResult {
        enum After {
            Nothing,
            Open,
            Drop(Option<Error>),
        }

        let after = {
            let Some(conn) = self.connections.get_mut(&conn_id) else {
                return ActionResult::CancelAll;
            };

            match conn.state {
                ConnState::Connecting => {
                    let flushed = if conn.data_to_send() { conn.write() } else { Ok(()) };
                    match flushed {
                        Err(e) => After::Drop(Some(e)),
                        Ok(()) if !conn.data_to_send() => {
                            // the whole handshake response is on the wire
                            conn.state = ConnState::Connected;
                            After::Open
                        }
                        Ok(()) => After::Nothing,
                    }
                }
                ConnState::Connected | ConnState::Closing | ConnState::Closed => {
                    let flushed = if conn.data_to_send() { conn.write() } else { Ok(()) };
                    match flushed {
                        Err(e) => After::Drop(Some(e)),
                        Ok(()) => {
                            if conn.state == ConnState::Closed && !conn.data_to_send() {
                                After::Drop(None)
                            } else {
                                After::Nothing
                            }
                        }
                    }
                }
                // excluded by the activation predicate
                ConnState::NotConnected => After::Nothing,
            }
        };

        match after {
            After::Nothing => ActionResult::Continue,
            After::Open => {
                debug!(conn_id, "connection established");
                self.invoke_open_callback(conn_id);
                ActionResult::Continue
            }
            After::Drop(error) => {
                match error {
                    Some(e) if !e.is_disconnect() => {
                        warn!(conn_id, error = %e, "write failed")
                    }
                    _ => {}
                }
                self.drop_connection(conn_id);
                ActionResult::CancelAll
            }
        }
    }

    // The callback slot is taken for the duration of the upcall so the
    // upcall can hold `&mut ServerCore`; a callback the application swapped
    // in from inside the upcall wins over the one we took out.

    fn invoke_open_callback(&mut self, conn_id: u64) {
        if let Some(mut callback) = self.open_callback.take() {
            callback(self, conn_id);
            if self.open_callback.is_none() {
                self.open_callback = Some(callback);
            }
        }
    }

    fn invoke_message_callback(&mut self, conn_id: u64, message: Message) {
        if let Some(mut callback) = self.message_callback.take() {
            callback(self, conn_id, message);
            if self.message_callback.is_none() {
                self.message_callback = Some(callback);
            }
        }
    }

    fn invoke_close_callback(&mut self, conn_id: u64) {
        if let Some(mut callback) = self.close_callback.take() {
            callback(self, conn_id);
            if self.close_callback.is_none() {
                self.close_callback = Some(callback);
            }
        }
    }
}

fn read_action(fd: RawFd, conn_id: u64) -> Action<ServerCore> {
    Action::new(
        fd,
        Direction::In,
        move |core: &mut ServerCore, _| core.handle_readable(conn_id),
        move |core| match core.connections.get(&conn_id) {
            Some(conn) => {
                conn.state != ConnState::Connecting && conn.state != ConnState::Closed
            }
            None => false,
        },
    )
}

fn write_action(fd: RawFd, conn_id: u64) -> Action<ServerCore> {
    Action::new(
        fd,
        Direction::Out,
        move |core: &mut ServerCore, _| core.handle_writable(conn_id),
        move |core| match core.connections.get(&conn_id) {
            Some(conn) => {
                conn.state == ConnState::Connecting
                    || (matches!(
                        conn.state,
                        ConnState::Connected | ConnState::Closing | ConnState::Closed
                    ) && conn.data_to_send())
            }
            None => false,
        },
    )
}

/// Bind the listening socket with address and port reuse, non-blocking.
fn build_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;

    Ok(socket.into())
}

/// Bind a fresh listener and produce its accept action.
fn init_listener(core: &mut ServerCore) -> Result<Action<ServerCore>> {
    let listener = build_listener(core.listen_addr, core.config.backlog)?;
    let fd = listener.as_raw_fd();

    core.listener = Some(listener);
    core.active = true;
    debug!(addr = %core.listen_addr, "listener ready");

    Ok(Action::new(
        fd,
        Direction::In,
        |core: &mut ServerCore, registrar| core.handle_accept(registrar),
        |core| core.active,
    ))
}

/// A readiness-driven WebSocket server.
///
/// ```no_run
/// # fn main() -> sockwave::Result<()> {
/// use sockwave::{Config, Frame, WsServer};
///
/// let mut server = WsServer::bind("127.0.0.1:9001".parse().unwrap(), Config::default())?;
///
/// server.set_message_callback(|core, conn_id, message| {
///     if message.is_text() || message.is_binary() {
///         core.queue_frame(conn_id, Frame::text(message.into_bytes()));
///     }
/// });
///
/// let status = server.run()?;
/// std::process::exit(status)
/// # }
/// ```
pub struct WsServer {
    core: ServerCore,
    poller: Poller<ServerCore>,
}

impl WsServer {
    /// Bind a plaintext server.
    pub fn bind(addr: SocketAddr, config: Config) -> Result<Self> {
        Self::new(addr, config, Flavor::Plain)
    }

    /// Bind a TLS server; every accepted socket is wrapped in a fresh
    /// server-side session built from `tls_config`.
    pub fn bind_tls(
        addr: SocketAddr,
        config: Config,
        tls_config: Arc<rustls::ServerConfig>,
    ) -> Result<Self> {
        Self::new(addr, config, Flavor::Tls(tls_config))
    }

    fn new(addr: SocketAddr, config: Config, flavor: Flavor) -> Result<Self> {
        let mut core = ServerCore {
            listen_addr: addr,
            config,
            flavor,
            listener: None,
            active: false,
            next_connection_id: 0,
            connections: HashMap::new(),
            closed_connections: HashSet::new(),
            open_callback: None,
            message_callback: None,
            close_callback: None,
        };

        let mut poller = Poller::new()?;
        let accept_action = init_listener(&mut core)?;
        poller.add_action(accept_action);

        Ok(Self { core, poller })
    }

    /// The locally bound listener address, while the listener is open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core
            .listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    /// Set the upcall fired once a connection finishes its handshake.
    pub fn set_open_callback(&mut self, callback: impl FnMut(&mut ServerCore, u64) + 'static) {
        self.core.open_callback = Some(Box::new(callback));
    }

    /// Set the upcall fired for every complete text or binary message.
    pub fn set_message_callback(
        &mut self,
        callback: impl FnMut(&mut ServerCore, u64, Message) + 'static,
    ) {
        self.core.message_callback = Some(Box::new(callback));
    }

    /// Set the upcall fired exactly once when a connection is dropped.
    pub fn set_close_callback(&mut self, callback: impl FnMut(&mut ServerCore, u64) + 'static) {
        self.core.close_callback = Some(Box::new(callback));
    }

    /// See [`ServerCore::queue_frame`].
    pub fn queue_frame(&mut self, conn_id: u64, frame: Frame) -> bool {
        self.core.queue_frame(conn_id, frame)
    }

    /// See [`ServerCore::close_connection`].
    pub fn close_connection(&mut self, conn_id: u64) {
        self.core.close_connection(conn_id)
    }

    /// See [`ServerCore::clear_buffer`].
    pub fn clear_buffer(&mut self, conn_id: u64) -> Result<()> {
        self.core.clear_buffer(conn_id)
    }

    /// See [`ServerCore::peer_addr`].
    pub fn peer_addr(&self, conn_id: u64) -> Result<SocketAddr> {
        self.core.peer_addr(conn_id)
    }

    /// See [`ServerCore::buffer_bytes`].
    pub fn buffer_bytes(&self, conn_id: u64) -> Result<usize> {
        self.core.buffer_bytes(conn_id)
    }

    /// See [`ServerCore::connection_count`].
    pub fn connection_count(&self) -> usize {
        self.core.connection_count()
    }

    /// See [`ServerCore::is_listening`].
    pub fn is_listening(&self) -> bool {
        self.core.is_listening()
    }

    /// Run one loop iteration, waiting indefinitely for readiness.
    pub fn loop_once(&mut self) -> Result<PollResult> {
        self.poll_once(None)
    }

    /// Run one loop iteration with a bounded wait: poll, dispatch, collect
    /// closed connections, and re-arm the listener if the population allows.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> Result<PollResult> {
        let result = self.poller.poll(&mut self.core, timeout)?;

        for conn_id in std::mem::take(&mut self.core.closed_connections) {
            self.core.connections.remove(&conn_id);
            debug!(conn_id, "collected closed connection");
        }

        if !self.core.active && self.core.connections.len() < self.core.config.max_connections {
            let accept_action = init_listener(&mut self.core)?;
            self.poller.add_action(accept_action);
        }

        Ok(result)
    }

    /// Run the loop until a callback requests exit, returning its status.
    pub fn run(&mut self) -> Result<i32> {
        loop {
            if let PollResult::Exit(status) = self.loop_once()? {
                return Ok(status);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::OpCode;
    use crate::frame::tests::masked_frame;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::Mutex;
    use std::thread::{self, JoinHandle};
    use std::time::Instant;

    const TICK: Option<Duration> = Some(Duration::from_millis(10));

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Open(u64),
        Message(u64, Vec<u8>),
        Close(u64),
    }

    type EventLog = Arc<Mutex<Vec<Event>>>;

    fn echo_server() -> (WsServer, SocketAddr, EventLog) {
        server_with_config(Config::default())
    }

    fn server_with_config(config: Config) -> (WsServer, SocketAddr, EventLog) {
        let mut server =
            WsServer::bind("127.0.0.1:0".parse().unwrap(), config).expect("bind server");
        let addr = server.local_addr().expect("listener address");
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));

        let log = events.clone();
        server.set_open_callback(move |_, conn_id| {
            log.lock().unwrap().push(Event::Open(conn_id));
        });

        let log = events.clone();
        server.set_message_callback(move |core, conn_id, message| {
            log.lock()
                .unwrap()
                .push(Event::Message(conn_id, message.as_bytes().to_vec()));
            core.queue_frame(conn_id, Frame::text(message.into_bytes()));
        });

        let log = events.clone();
        server.set_close_callback(move |_, conn_id| {
            log.lock().unwrap().push(Event::Close(conn_id));
        });

        (server, addr, events)
    }

    /// Pump the server loop until the client thread finishes.
    fn pump_until_done<T>(server: &mut WsServer, client: JoinHandle<T>) -> T {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !client.is_finished() {
            assert!(Instant::now() < deadline, "test deadline exceeded");
            server.poll_once(TICK).expect("poll");
        }
        // a few extra ticks so pending drops reach garbage collection
        for _ in 0..5 {
            server.poll_once(TICK).expect("poll");
        }
        client.join().expect("client thread")
    }

    fn pump_until(server: &mut WsServer, mut condition: impl FnMut(&WsServer) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition(server) {
            assert!(Instant::now() < deadline, "test deadline exceeded");
            server.poll_once(TICK).expect("poll");
        }
    }

    fn client_handshake(stream: &mut TcpStream) -> String {
        let request = "GET /chat HTTP/1.1\r\n\
            Host: localhost\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Origin: http://localhost\r\n\
            \r\n";
        stream.write_all(request.as_bytes()).unwrap();
        read_until_blank_line(stream)
    }

    fn read_until_blank_line(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            match stream.read(&mut byte) {
                Ok(1) => head.push(byte[0]),
                Ok(_) => break, // EOF
                Err(e) => panic!("reading response head: {e}"),
            }
        }
        String::from_utf8(head).unwrap()
    }

    /// Read one unmasked server frame; returns (opcode, payload).
    fn read_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).unwrap();
        assert_eq!(header[1] & 0x80, 0, "server frames must be unmasked");

        let len = match header[1] & 0x7F {
            126 => {
                let mut ext = [0u8; 2];
                stream.read_exact(&mut ext).unwrap();
                u16::from_be_bytes(ext) as usize
            }
            127 => {
                let mut ext = [0u8; 8];
                stream.read_exact(&mut ext).unwrap();
                u64::from_be_bytes(ext) as usize
            }
            n => n as usize,
        };

        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).unwrap();
        (header[0] & 0x0F, payload)
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        stream
    }

    #[test]
    fn echo_session_with_close_handshake() {
        let (mut server, addr, events) = echo_server();

        let client = thread::spawn(move || {
            let mut stream = connect(addr);

            let response = client_handshake(&mut stream);
            assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
            assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

            stream
                .write_all(&masked_frame(OpCode::Text, b"hello", true))
                .unwrap();
            let (opcode, payload) = read_frame(&mut stream);
            assert_eq!(opcode, 0x1);
            assert_eq!(payload, b"hello");

            // close with a payload; the server echoes it byte for byte
            let close_payload = [0x03, 0xE8, b'b', b'y', b'e'];
            stream
                .write_all(&masked_frame(OpCode::Close, &close_payload, true))
                .unwrap();
            let (opcode, payload) = read_frame(&mut stream);
            assert_eq!(opcode, 0x8);
            assert_eq!(payload, close_payload);

            // and then tears the connection down
            let mut rest = Vec::new();
            assert_eq!(stream.read_to_end(&mut rest).unwrap(), 0);
        });

        pump_until_done(&mut server, client);

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                Event::Open(0),
                Event::Message(0, b"hello".to_vec()),
                Event::Close(0),
            ]
        );
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn ping_gets_empty_pong() {
        let (mut server, addr, _events) = echo_server();

        let client = thread::spawn(move || {
            let mut stream = connect(addr);
            client_handshake(&mut stream);

            stream
                .write_all(&masked_frame(OpCode::Ping, b"payload is not echoed", true))
                .unwrap();
            let (opcode, payload) = read_frame(&mut stream);
            assert_eq!(opcode, 0xA);
            assert!(payload.is_empty());
        });

        pump_until_done(&mut server, client);
    }

    #[test]
    fn handshake_without_origin_is_dropped() {
        let (mut server, addr, events) = echo_server();

        let client = thread::spawn(move || {
            let mut stream = connect(addr);
            let request = "GET / HTTP/1.1\r\n\
                Host: localhost\r\n\
                Upgrade: websocket\r\n\
                Connection: Upgrade\r\n\
                Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                \r\n";
            stream.write_all(request.as_bytes()).unwrap();

            // the connection just goes away; the 403 rarely makes it out
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest);
        });

        pump_until_done(&mut server, client);

        assert_eq!(*events.lock().unwrap(), vec![Event::Close(0)]);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn peer_eof_after_handshake_fires_close() {
        let (mut server, addr, events) = echo_server();

        let client = thread::spawn(move || {
            let mut stream = connect(addr);
            let response = client_handshake(&mut stream);
            assert!(response.starts_with("HTTP/1.1 101"));
            // hang up without sending a single frame
        });

        pump_until_done(&mut server, client);

        assert_eq!(
            *events.lock().unwrap(),
            vec![Event::Open(0), Event::Close(0)]
        );
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn protocol_violation_starts_graceful_close() {
        let (mut server, addr, events) = echo_server();

        let client = thread::spawn(move || {
            let mut stream = connect(addr);
            client_handshake(&mut stream);

            // unmasked client frame: a protocol violation
            stream.write_all(&[0x81, 0x01, b'x']).unwrap();

            // the server opens the closing handshake
            let (opcode, payload) = read_frame(&mut stream);
            assert_eq!(opcode, 0x8);
            assert!(payload.is_empty());

            // acknowledge and wait for teardown
            stream
                .write_all(&masked_frame(OpCode::Close, b"", true))
                .unwrap();
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest);
        });

        pump_until_done(&mut server, client);

        let events = events.lock().unwrap();
        assert!(events.contains(&Event::Open(0)));
        assert!(events.contains(&Event::Close(0)));
        assert!(!events.iter().any(|e| matches!(e, Event::Message(..))));
    }

    #[test]
    fn cap_closes_listener_and_gc_rearms_it() {
        let config = Config::builder().max_connections(2).build();
        let (mut server, addr, events) = server_with_config(config);

        let first = thread::spawn(move || {
            let mut stream = connect(addr);
            client_handshake(&mut stream);
            stream
        });
        let second = thread::spawn(move || {
            let mut stream = connect(addr);
            client_handshake(&mut stream);
            stream
        });

        let first = pump_until_done(&mut server, first);
        let second = pump_until_done(&mut server, second);

        assert_eq!(server.connection_count(), 2);
        assert!(!server.is_listening());

        // one connection leaves; collection brings us under the cap and the
        // listener comes back
        drop(first);
        pump_until(&mut server, |server| server.is_listening());
        assert_eq!(server.connection_count(), 1);

        let third = thread::spawn(move || {
            let mut stream = connect(addr);
            let response = client_handshake(&mut stream);
            assert!(response.starts_with("HTTP/1.1 101"));
            stream
        });
        let third = pump_until_done(&mut server, third);

        assert_eq!(server.connection_count(), 2);
        assert!(!server.is_listening());

        drop(second);
        drop(third);
        pump_until(&mut server, |server| server.connection_count() == 0);

        let events = events.lock().unwrap();
        let mut opens: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                Event::Open(id) => Some(*id),
                _ => None,
            })
            .collect();
        // identifiers are allocated monotonically and never reused, even
        // across the listener teardown
        opens.sort_unstable();
        assert_eq!(opens, vec![0, 1, 2]);
    }

    #[test]
    fn queue_frame_requires_connected_state() {
        let (mut server, _addr, _events) = echo_server();
        assert!(!server.queue_frame(99, Frame::text("nobody home")));
    }

    #[test]
    fn close_connection_on_unknown_id_is_harmless() {
        let (mut server, _addr, _events) = echo_server();
        server.close_connection(7);
        assert!(matches!(
            server.peer_addr(7),
            Err(Error::UnknownConnection(7))
        ));
        assert!(matches!(
            server.buffer_bytes(7),
            Err(Error::UnknownConnection(7))
        ));
    }
}
