//! # netman-core
//!
//! An event-driven TCP / WebSocket server core: a reactor that multiplexes
//! many non-blocking sockets over a small pool of poller threads, decodes
//! application frames from the raw byte streams, and hands complete
//! messages to a single dispatcher thread.
//!
//! # Architecture overview (for beginners)
//!
//! - **`protocol`** – Bytes on the wire.  The length-prefixed packer used by
//!   raw connections, the RFC 6455 frame codec, and the HTTP upgrade that
//!   opens a WebSocket connection.
//!
//! - **`connection`** – One accepted socket and its state machine: read
//!   accumulation buffer, pending-write queue, TLS session, protocol state.
//!   The `ConnectManager` tracks every live connection.
//!
//! - **`reactor`** – The threads.  Each `Poller` owns one OS readiness
//!   multiplexer (epoll / kqueue via `mio`); the `EventLoop` runs N of them;
//!   the `Acceptor` admits connections and assigns them round-robin; the
//!   optional `Heartbeat` evicts idle peers.
//!
//! - **`server`** – The facade tying it together, driven by a
//!   [`ConnectionHandler`] supplied by the application.
//!
//! ```no_run
//! use std::sync::Arc;
//! use netman_core::{ConnectionHandler, Request, Server, ServerOptions};
//!
//! struct Echo;
//!
//! impl ConnectionHandler for Echo {
//!     fn on_message(&self, request: Request) {
//!         if let Some(conn) = request.connection() {
//!             let _ = conn.send(request.message().bytes());
//!         }
//!     }
//! }
//!
//! let server = Server::bind("127.0.0.1:9000".parse().unwrap(), ServerOptions::default(), Arc::new(Echo)).unwrap();
//! server.start().unwrap();
//! ```

pub mod connection;
pub mod handler;
pub mod options;
pub mod protocol;
pub mod reactor;
pub mod server;

#[cfg(test)]
mod testing;

pub use connection::manager::ConnectManager;
pub use connection::{Connection, ConnectionError, ConnectionId, Interest, ReadError};
pub use handler::ConnectionHandler;
pub use options::{HeartbeatOptions, Protocol, ServerOptions};
pub use protocol::{FrameError, Message, OpCode, QueryParams, Request};
pub use server::{Server, ServerError, ServerStatus};
