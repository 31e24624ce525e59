//! Per-socket state machine.
//!
//! A [`Connection`] is created by the acceptor, owned (through its
//! registration) by exactly one poller, and tracked by the
//! [`ConnectManager`](manager::ConnectManager) while it is live.  Its mutable
//! state sits behind one mutex:
//!
//! - the poller thread takes it to read, decode and drain the write queue;
//! - application threads take it to append outbound bytes (or perform the
//!   single opportunistic write when nothing is queued);
//! - [`Connection::close`] takes it once to tear the socket down.
//!
//! Handler callbacks always run after the lock has been released.

pub mod framer;
pub mod manager;
pub mod transport;
pub mod write_queue;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use mio::net::TcpStream;
use mio::Token;
use parking_lot::Mutex;
use rustls::ServerConnection;
use thiserror::Error;
use tracing::{debug, trace};

use crate::handler::ConnectionHandler;
use crate::options::Protocol;
use crate::protocol::message::{Message, OpCode};
use crate::protocol::websocket::PING_FRAME;
use crate::protocol::{FrameError, QueryParams};
use crate::reactor::poller::{PollerError, PollerHandle, PollerId};

use framer::{FrameEvent, Framer};
use manager::ConnectManager;
use transport::Transport;
pub use write_queue::Interest;
use write_queue::WriteQueue;

const INITIAL_READ_CAPACITY: usize = 4 * 1024;

// ── Identity ──────────────────────────────────────────────────────────────────

/// Numeric connection identity, unique for the acceptor's lifetime.
///
/// Doubles as the connection's [`mio::Token`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn token(self) -> Token {
        Token(self.0 as usize)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors returned to callers of the public connection API.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection is closed")]
    Closed,

    #[error("connection is not open yet")]
    NotOpen,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Registration(#[from] PollerError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Why a read pass ended the connection.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("peer closed the connection")]
    Eof,

    #[error("peer sent a close frame")]
    CloseFrame,

    #[error("connection is closed")]
    Closed,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Write(#[from] ConnectionError),
}

/// How the poller reacts to a [`ReadError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry on the next readiness event.
    Transient,
    /// Close and deregister the connection.
    Fatal,
}

impl ReadError {
    pub fn classify(&self) -> ErrorClass {
        match self {
            ReadError::Io(e)
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) =>
            {
                ErrorClass::Transient
            }
            _ => ErrorClass::Fatal,
        }
    }
}

/// Result of one read pass: the messages decoded, and the error that ended
/// the pass if any.  Messages decoded before an error are still delivered.
#[derive(Debug, Default)]
pub struct ReadBatch {
    pub messages: Vec<Message>,
    pub error: Option<ReadError>,
}

// ── Connection ────────────────────────────────────────────────────────────────

struct ConnectionState {
    /// `None` once the connection has been closed.
    transport: Option<Transport>,
    writes: WriteQueue,
    framer: Framer,
    read_buf: BytesMut,
    last_active: Instant,
}

/// Everything the acceptor hands over when it creates a connection.
pub(crate) struct ConnectionParts {
    pub id: ConnectionId,
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,
    pub tls: Option<ServerConnection>,
    pub protocol: Protocol,
    pub max_body_length: u32,
    pub poller: Arc<PollerHandle>,
    pub manager: Weak<ConnectManager>,
    pub handler: Arc<dyn ConnectionHandler>,
}

/// One accepted socket.
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    protocol: Protocol,
    tls: bool,
    poller: Arc<PollerHandle>,
    manager: Weak<ConnectManager>,
    handler: Arc<dyn ConnectionHandler>,
    closed: AtomicBool,
    opened: AtomicBool,
    query: OnceLock<QueryParams>,
    state: Mutex<ConnectionState>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("protocol", &self.protocol)
            .field("tls", &self.tls)
            .field("poller", &self.poller.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(parts: ConnectionParts) -> Arc<Self> {
        let tls = parts.tls.is_some();
        let transport = match parts.tls {
            Some(session) => Transport::tls(parts.stream, session),
            None => Transport::plain(parts.stream),
        };

        Arc::new(Self {
            id: parts.id,
            peer_addr: parts.peer_addr,
            protocol: parts.protocol,
            tls,
            poller: parts.poller,
            manager: parts.manager,
            handler: parts.handler,
            closed: AtomicBool::new(false),
            opened: AtomicBool::new(false),
            query: OnceLock::new(),
            state: Mutex::new(ConnectionState {
                transport: Some(transport),
                writes: WriteQueue::new(),
                framer: Framer::new(parts.protocol, parts.max_body_length),
                read_buf: BytesMut::with_capacity(INITIAL_READ_CAPACITY),
                last_active: Instant::now(),
            }),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn poller_id(&self) -> PollerId {
        self.poller.id()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// True once `on_open` has been delivered.
    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    /// Query-string parameters of the WebSocket upgrade request.
    ///
    /// `None` for raw connections and before the upgrade completes.
    pub fn query(&self) -> Option<&QueryParams> {
        self.query.get()
    }

    /// Current readiness interest of the registration.
    pub fn interest(&self) -> Interest {
        self.state.lock().writes.interest()
    }

    /// Outbound bytes the socket has not accepted yet.
    pub fn pending_write_bytes(&self) -> usize {
        self.state.lock().writes.pending_bytes()
    }

    /// Time since the last inbound traffic.
    pub fn idle_for(&self) -> Duration {
        self.state.lock().last_active.elapsed()
    }

    /// Sends one application message.
    ///
    /// Raw connections frame it with the length prefix; WebSocket
    /// connections send it as a binary frame.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::Closed`] after [`Connection::close`].
    /// - [`ConnectionError::NotOpen`] on a WebSocket connection that has not
    ///   completed its upgrade.
    /// - Any other variant is fatal and the connection is closed before the
    ///   error is returned.
    pub fn send(&self, payload: &[u8]) -> Result<(), ConnectionError> {
        self.write_message(OpCode::Binary, payload)
    }

    /// Sends a text message (a text frame on WebSocket connections).
    pub fn text(&self, text: &str) -> Result<(), ConnectionError> {
        self.write_message(OpCode::Text, text.as_bytes())
    }

    /// Sends a binary message.
    pub fn binary(&self, payload: &[u8]) -> Result<(), ConnectionError> {
        self.write_message(OpCode::Binary, payload)
    }

    /// Closes the connection.
    ///
    /// Pending output is flushed best-effort (followed by a close frame on
    /// upgraded WebSocket connections and `close_notify` under TLS), the
    /// socket is deregistered and dropped, and `on_close` runs if `on_open`
    /// did.  Returns `false` if the connection was already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        if let Some(manager) = self.manager.upgrade() {
            manager.detach(self.id);
        }

        let transport = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let transport = state.transport.take();
            if let Some(mut transport) = transport {
                let mut tail = state.framer.farewell().map(<[u8]>::to_vec).unwrap_or_default();
                if !tail.is_empty() {
                    tail = transport.seal(tail).unwrap_or_default();
                }
                transport.send_close_notify();
                tail.extend(transport.take_tls_output());

                let socket = transport.socket();
                let _ = state.writes.drain(socket);
                if state.writes.is_empty() && !tail.is_empty() {
                    let _ = state.writes.submit(socket, tail);
                }
                if let Err(e) = self.poller.remove(socket) {
                    trace!(conn_id = %self.id, error = %e, "deregister failed during close");
                }
                state.writes.clear();
                state.read_buf.clear();
                Some(transport)
            } else {
                None
            }
        };
        // Dropping the stream closes the socket.
        drop(transport);

        debug!(conn_id = %self.id, peer = %self.peer_addr, "connection closed");

        if self.opened.load(Ordering::Acquire) {
            self.handler.on_close(self);
        }
        true
    }

    // ── Reactor-facing operations ─────────────────────────────────────────────

    /// Registers the socket for read readiness with the owning poller.
    ///
    /// Registers for writes instead when `on_open` already left bytes
    /// queued.
    pub(crate) fn register(&self) -> Result<(), ConnectionError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let transport = state.transport.as_mut().ok_or(ConnectionError::Closed)?;
        match state.writes.interest() {
            Interest::Read => self.poller.add_read(transport.socket(), self.id.token())?,
            Interest::Write => self.poller.add_write(transport.socket(), self.id.token())?,
        }
        Ok(())
    }

    /// Runs `f` on the underlying socket while the connection is live.
    #[cfg(test)]
    pub(crate) fn with_socket<R>(&self, f: impl FnOnce(&TcpStream) -> R) -> Option<R> {
        let mut state = self.state.lock();
        state.transport.as_mut().map(|t| f(&*t.socket()))
    }

    /// True when `on_open` has to wait for a TLS handshake or an upgrade.
    pub(crate) fn needs_handshake(&self) -> bool {
        self.tls || self.protocol == Protocol::WebSocket
    }

    /// Delivers `on_open` once.
    pub(crate) fn open(self: &Arc<Self>) {
        if self.is_closed() || self.opened.swap(true, Ordering::AcqRel) {
            return;
        }
        self.handler.on_open(self);
    }

    /// Reads everything available, drives the TLS handshake and the
    /// protocol, and returns the decoded messages.
    ///
    /// Protocol replies (TLS records, `101`, pongs) are queued before this
    /// returns; `on_open` runs here once the connection becomes ready.
    pub(crate) fn on_readable(self: &Arc<Self>) -> ReadBatch {
        if self.is_closed() {
            return ReadBatch {
                messages: Vec::new(),
                error: Some(ReadError::Closed),
            };
        }

        let mut batch = ReadBatch::default();
        let ready = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            batch.error = self.read_locked(state, &mut batch.messages).err();
            state.transport.as_ref().is_some_and(|t| !t.is_handshaking()) && state.framer.is_ready()
        };

        if ready && !self.is_open() {
            self.open();
        }
        batch
    }

    fn read_locked(&self, state: &mut ConnectionState, messages: &mut Vec<Message>) -> Result<(), ReadError> {
        let transport = state.transport.as_mut().ok_or(ReadError::Closed)?;
        let read = transport.read_into(&mut state.read_buf);

        // Handshake replies and alerts go out even when the read failed.
        let tls_output = transport.take_tls_output();
        if !tls_output.is_empty() {
            self.submit_locked(state, tls_output, false)?;
        }
        let eof = read?;
        state.last_active = Instant::now();

        if state.transport.as_ref().is_some_and(Transport::is_handshaking) {
            return if eof { Err(ReadError::Eof) } else { Ok(()) };
        }

        let mut events = Vec::new();
        let fed = state.framer.feed(&mut state.read_buf, &mut events);

        let mut close_requested = false;
        for event in events {
            match event {
                FrameEvent::Deliver(message) => messages.push(message),
                FrameEvent::Reply(bytes) => self.submit_locked(state, bytes, true)?,
                FrameEvent::Upgraded { response, query } => {
                    self.submit_locked(state, response, true)?;
                    let _ = self.query.set(query);
                }
                FrameEvent::CloseRequested => close_requested = true,
            }
        }

        if let Err(e) = fed {
            if let Some(rejection) = state.framer.rejection() {
                let _ = self.submit_locked(state, rejection.to_vec(), true);
            }
            return Err(e.into());
        }
        if close_requested {
            return Err(ReadError::CloseFrame);
        }
        if eof {
            state.framer.on_eof(&state.read_buf)?;
            return Err(ReadError::Eof);
        }
        Ok(())
    }

    /// Drains the write queue on write readiness.
    pub(crate) fn on_writable(&self) -> Result<(), ConnectionError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let transport = state.transport.as_mut().ok_or(ConnectionError::Closed)?;
        let socket = transport.socket();
        if let Some(Interest::Read) = state.writes.drain(socket)? {
            self.poller.mod_to_read(socket, self.id.token())?;
        }
        Ok(())
    }

    /// Sends a keepalive ping on upgraded WebSocket connections.
    pub(crate) fn ping(&self) -> Result<(), ConnectionError> {
        if self.protocol != Protocol::WebSocket || !self.is_open() {
            return Ok(());
        }
        self.submit_checked(PING_FRAME.to_vec())
    }

    fn write_message(&self, opcode: OpCode, payload: &[u8]) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let wire = {
            let state = self.state.lock();
            if !state.framer.is_ready() {
                return Err(ConnectionError::NotOpen);
            }
            state.framer.encode(opcode, payload)?
        };
        self.submit_checked(wire)
    }

    /// Submits protocol bytes, closing the connection on a fatal error.
    fn submit_checked(&self, bytes: Vec<u8>) -> Result<(), ConnectionError> {
        let result = {
            let mut state = self.state.lock();
            self.submit_locked(&mut state, bytes, true)
        };
        match result {
            Err(ConnectionError::Closed) => Err(ConnectionError::Closed),
            Err(e) => {
                debug!(conn_id = %self.id, error = %e, "write failed; closing");
                self.close();
                Err(e)
            }
            Ok(()) => Ok(()),
        }
    }

    /// Hands wire bytes to the write queue; `seal` encrypts them first under
    /// TLS.  Flips the registration to write interest when bytes are left
    /// over.
    fn submit_locked(&self, state: &mut ConnectionState, bytes: Vec<u8>, seal: bool) -> Result<(), ConnectionError> {
        let transport = state.transport.as_mut().ok_or(ConnectionError::Closed)?;
        let wire = if seal { transport.seal(bytes)? } else { bytes };
        let socket = transport.socket();
        if let Some(Interest::Write) = state.writes.submit(socket, wire)? {
            self.poller.mod_to_write(socket, self.id.token())?;
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpStream as StdTcpStream;

    use super::*;
    use crate::handler::MockConnectionHandler;
    use crate::testing;

    fn read_exact(peer: &mut StdTcpStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        peer.read_exact(&mut buf).unwrap();
        buf
    }

    /// Reads until at least one pass decoded something or failed.
    fn read_until_event(conn: &Arc<Connection>) -> ReadBatch {
        for _ in 0..200 {
            let batch = conn.on_readable();
            if !batch.messages.is_empty() || batch.error.is_some() {
                return batch;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("no read event");
    }

    #[test]
    fn test_raw_send_is_length_prefixed() {
        // Arrange
        let fixture = testing::Fixture::new();
        let (conn, mut peer) = fixture.connection(1, Protocol::Raw);

        // Act
        conn.send(b"hello").unwrap();

        // Assert
        assert_eq!(read_exact(&mut peer, 9), [0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o']);
        assert_eq!(conn.interest(), Interest::Read);
    }

    #[test]
    fn test_raw_read_decodes_split_frame() {
        let fixture = testing::Fixture::new();
        let (conn, mut peer) = fixture.connection(2, Protocol::Raw);

        peer.write_all(&[0, 0, 0, 5, b'h']).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let first = conn.on_readable();
        assert!(first.messages.is_empty());
        assert!(first.error.is_none());

        peer.write_all(b"ello").unwrap();
        let batch = read_until_event(&conn);
        assert_eq!(batch.messages, vec![Message::raw(b"hello".to_vec())]);
    }

    #[test]
    fn test_peer_hangup_is_fatal_eof() {
        let fixture = testing::Fixture::new();
        let (conn, peer) = fixture.connection(3, Protocol::Raw);
        drop(peer);

        let batch = read_until_event(&conn);
        let error = batch.error.unwrap();
        assert!(matches!(error, ReadError::Eof));
        assert_eq!(error.classify(), ErrorClass::Fatal);
    }

    #[test]
    fn test_over_limit_header_is_fatal() {
        let fixture = testing::Fixture::new();
        let (conn, mut peer) = fixture.connection_with_limit(4, Protocol::Raw, 4);

        peer.write_all(&[0, 0, 0, 5]).unwrap();
        let batch = read_until_event(&conn);

        assert!(matches!(
            batch.error,
            Some(ReadError::Frame(FrameError::BodyLenExceedLimit { declared: 5, limit: 4 }))
        ));
    }

    #[test]
    fn test_close_runs_once_and_later_sends_fail() {
        let fixture = testing::Fixture::new();
        let (conn, _peer) = fixture.connection(5, Protocol::Raw);

        assert!(conn.close());
        assert!(!conn.close());
        assert!(conn.is_closed());
        assert!(matches!(conn.send(b"x"), Err(ConnectionError::Closed)));
        assert!(matches!(conn.on_readable().error, Some(ReadError::Closed)));
    }

    #[test]
    fn test_close_calls_on_close_only_after_open() {
        // Arrange
        let mut handler = MockConnectionHandler::new();
        handler.expect_on_open().times(1).return_const(());
        handler.expect_on_close().times(1).return_const(());
        let fixture = testing::Fixture::new();
        let (opened, _p1) = fixture.connection_with_handler(6, Protocol::Raw, Arc::new(handler));

        let mut silent = MockConnectionHandler::new();
        silent.expect_on_open().never();
        silent.expect_on_close().never();
        let (never_opened, _p2) = fixture.connection_with_handler(7, Protocol::Raw, Arc::new(silent));

        // Act
        opened.open();
        opened.open();
        opened.close();
        never_opened.close();

        // Assert: mock expectations are verified on drop
    }

    #[test]
    fn test_websocket_send_before_upgrade_is_not_open() {
        let fixture = testing::Fixture::new();
        let (conn, _peer) = fixture.connection(8, Protocol::WebSocket);
        assert!(matches!(conn.send(b"x"), Err(ConnectionError::NotOpen)));
        assert!(conn.needs_handshake());
    }

    #[test]
    fn test_websocket_upgrade_sets_query_and_opens() {
        // Arrange
        let fixture = testing::Fixture::new();
        let (conn, mut peer) = fixture.connection(9, Protocol::WebSocket);
        let request = "GET /ws?room=blue HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\n\
                       Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                       Sec-WebSocket-Version: 13\r\n\r\n";

        // Act
        peer.write_all(request.as_bytes()).unwrap();
        for _ in 0..200 {
            conn.on_readable();
            if conn.is_open() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        // Assert
        assert!(conn.is_open());
        assert_eq!(conn.query().and_then(|q| q.get("room")), Some("blue"));
        let mut response = [0u8; 12];
        peer.read_exact(&mut response).unwrap();
        assert_eq!(&response, b"HTTP/1.1 101");
    }

    #[test]
    fn test_read_error_classification() {
        let would_block = ReadError::Io(io::ErrorKind::WouldBlock.into());
        let reset = ReadError::Io(io::ErrorKind::ConnectionReset.into());
        assert_eq!(would_block.classify(), ErrorClass::Transient);
        assert_eq!(reset.classify(), ErrorClass::Fatal);
        assert_eq!(ReadError::CloseFrame.classify(), ErrorClass::Fatal);
    }

    #[test]
    fn test_connection_id_is_its_token() {
        assert_eq!(ConnectionId(42).token(), Token(42));
        assert_eq!(ConnectionId(42).to_string(), "#42");
    }
}
