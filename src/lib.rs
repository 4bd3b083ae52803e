//! # Sockwave: a readiness-driven WebSocket server
//!
//! A single-process, single-threaded WebSocket server core. Any number of
//! plaintext or TLS-wrapped client connections are multiplexed through one
//! readiness-based event loop:
//!
//! - **Per-connection state machine**: each connection walks
//!   NotConnected → Connecting → Connected → Closing → Closed, and the
//!   event loop's activation predicates are derived directly from that
//!   state.
//! - **Admission control**: when the population hits the configured cap the
//!   listening socket is closed, pushing overload back into the OS accept
//!   queue; the listener is re-bound once connections drain away.
//! - **Deferred garbage collection**: dropped connections are erased only
//!   after the dispatch pass, so callbacks never outlive their connection's
//!   storage.
//!
//! All socket operations are non-blocking; the only suspension point is the
//! readiness wait itself. Application callbacks run on the loop thread and
//! must not block.
//!
//! ## Example
//!
//! ```no_run
//! # fn main() -> sockwave::Result<()> {
//! use sockwave::{Config, Frame, WsServer};
//!
//! let mut server = WsServer::bind("127.0.0.1:9001".parse().unwrap(), Config::default())?;
//!
//! server.set_open_callback(|_, conn_id| println!("connection {conn_id} up"));
//! server.set_message_callback(|core, conn_id, message| {
//!     // echo
//!     core.queue_frame(conn_id, Frame::text(message.into_bytes()));
//! });
//! server.set_close_callback(|_, conn_id| println!("connection {conn_id} gone"));
//!
//! let status = server.run()?;
//! std::process::exit(status)
//! # }
//! ```

pub mod error;
pub mod frame;
pub mod handshake;
pub mod poller;
pub mod protocol;
pub mod server;
pub mod transport;

mod connection;

pub use error::{Error, Result};
pub use frame::{Frame, OpCode};
pub use poller::PollResult;
pub use protocol::Message;
pub use server::{ServerCore, WsServer};

/// WebSocket GUID for the handshake accept key
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Default cap on concurrent connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 60;

/// Largest payload that fits a 2-byte frame header
pub const SMALL_PAYLOAD_THRESHOLD: usize = 125;

/// Largest payload that fits a 4-byte frame header
pub const MEDIUM_PAYLOAD_THRESHOLD: usize = 65535;

/// Read chunk size for draining a readable socket
pub const RECV_CHUNK_SIZE: usize = 64 * 1024;

/// Server configuration
///
/// # Example
///
/// ```
/// use sockwave::Config;
///
/// let config = Config::builder()
///     .max_connections(256)
///     .max_payload_length(16 * 1024)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Cap on concurrent connections (default: 60)
    ///
    /// Reaching the cap closes the listener rather than refusing accepts,
    /// so overload backpressure lands in the OS accept queue.
    pub max_connections: usize,
    /// Maximum frame payload size (default: 16MB)
    pub max_frame_size: usize,
    /// Maximum message size after reassembly (default: 64MB)
    pub max_message_size: usize,
    /// Listen backlog handed to the OS (default: 128)
    pub backlog: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_frame_size: 16 * 1024 * 1024,
            max_message_size: 64 * 1024 * 1024,
            backlog: 128,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for server configuration
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set the cap on concurrent connections
    pub fn max_connections(mut self, count: usize) -> Self {
        self.config.max_connections = count;
        self
    }

    /// Set both the frame and message size limits
    pub fn max_payload_length(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self.config.max_message_size = size;
        self
    }

    /// Set the maximum frame payload size
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set the maximum message size after reassembly
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Set the listen backlog
    pub fn backlog(mut self, backlog: u32) -> Self {
        self.config.backlog = backlog;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::Config;
    pub use crate::error::{Error, Result};
    pub use crate::frame::{Frame, OpCode};
    pub use crate::protocol::Message;
    pub use crate::server::{ServerCore, WsServer};
}
