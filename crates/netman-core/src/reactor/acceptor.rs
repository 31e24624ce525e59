//! Admits new connections and spreads them over the pollers.
//!
//! The acceptor owns its own [`mio::Poll`] holding exactly two
//! registrations: the listener and a [`mio::Waker`].  Waking it is the
//! only way to make [`Acceptor::run`] return.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use rustls::{ServerConfig, ServerConnection};
use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::event_loop::EventLoop;
use crate::connection::manager::ConnectManager;
use crate::connection::{Connection, ConnectionId, ConnectionParts};
use crate::handler::ConnectionHandler;
use crate::options::Protocol;

const LISTENER: Token = Token(0);
const WAKE: Token = Token(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AcceptorState {
    Idle = 0,
    Running = 1,
    Stopped = 2,
}

impl AcceptorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => AcceptorState::Idle,
            1 => AcceptorState::Running,
            _ => AcceptorState::Stopped,
        }
    }
}

#[derive(Debug, Error)]
pub enum AcceptorError {
    #[error("acceptor setup failed: {0}")]
    Setup(#[source] io::Error),

    #[error("acceptor poll failed: {0}")]
    Poll(#[source] io::Error),

    #[error("acceptor cannot run from state {0:?}")]
    InvalidState(AcceptorState),
}

/// What every admitted connection is built with.
pub struct AcceptorContext {
    pub event_loop: Arc<EventLoop>,
    pub manager: Arc<ConnectManager>,
    pub handler: Arc<dyn ConnectionHandler>,
    pub protocol: Protocol,
    pub max_body_length: u32,
    pub tls: Option<Arc<ServerConfig>>,
    pub tcp_keepalive: Option<Duration>,
}

struct Shared {
    waker: Waker,
    state: AtomicU8,
    exit_requested: AtomicBool,
}

/// Cross-thread control of an [`Acceptor`].
#[derive(Clone)]
pub struct AcceptorHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for AcceptorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptorHandle")
            .field("state", &self.state())
            .finish()
    }
}

impl AcceptorHandle {
    /// Makes [`Acceptor::run`] return.  Safe from any thread; only the
    /// first call has an effect.
    pub fn exit(&self) {
        if self.shared.exit_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.shared.waker.wake() {
            warn!(error = %e, "failed to wake acceptor");
        }
    }

    pub fn state(&self) -> AcceptorState {
        AcceptorState::from_u8(self.shared.state.load(Ordering::Acquire))
    }
}

pub struct Acceptor {
    poll: Poll,
    listener: TcpListener,
    shared: Arc<Shared>,
    ctx: AcceptorContext,
    next_id: u64,
}

impl Acceptor {
    /// # Errors
    ///
    /// [`AcceptorError::Setup`] if the poll, the listener registration or
    /// the waker cannot be created.
    pub fn new(mut listener: TcpListener, ctx: AcceptorContext) -> Result<Self, AcceptorError> {
        let poll = Poll::new().map_err(AcceptorError::Setup)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(AcceptorError::Setup)?;
        let waker = Waker::new(poll.registry(), WAKE).map_err(AcceptorError::Setup)?;

        Ok(Self {
            poll,
            listener,
            shared: Arc::new(Shared {
                waker,
                state: AtomicU8::new(AcceptorState::Idle as u8),
                exit_requested: AtomicBool::new(false),
            }),
            ctx,
            next_id: 1,
        })
    }

    pub fn handle(&self) -> AcceptorHandle {
        AcceptorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// # Errors
    ///
    /// The OS error from `getsockname`.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until [`AcceptorHandle::exit`] is called.
    ///
    /// # Errors
    ///
    /// - [`AcceptorError::InvalidState`] unless the acceptor is idle.
    /// - [`AcceptorError::Poll`] if the wait call fails; the acceptor is
    ///   stopped afterwards.
    pub fn run(&mut self) -> Result<(), AcceptorError> {
        if let Err(current) = self.shared.state.compare_exchange(
            AcceptorState::Idle as u8,
            AcceptorState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(AcceptorError::InvalidState(AcceptorState::from_u8(current)));
        }

        let result = self.accept_loop();
        self.shared
            .state
            .store(AcceptorState::Stopped as u8, Ordering::Release);
        info!("acceptor stopped");
        result
    }

    fn accept_loop(&mut self) -> Result<(), AcceptorError> {
        let mut events = Events::with_capacity(16);
        loop {
            if self.shared.exit_requested.load(Ordering::Acquire) {
                return Ok(());
            }
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(AcceptorError::Poll(e));
            }
            for event in events.iter() {
                match event.token() {
                    WAKE => return Ok(()),
                    LISTENER => self.accept_pending(),
                    _ => {}
                }
            }
        }
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => match accept_failure(e.kind()) {
                    AcceptFailure::Retry => {
                        debug!(error = %e, "accept failed for one peer");
                    }
                    AcceptFailure::Rearm => {
                        warn!(error = %e, "accept failed");
                        // Re-arming reports the backlog again on the next
                        // poll; edge-triggered readiness would not.
                        if let Err(e) = self.poll.registry().reregister(
                            &mut self.listener,
                            LISTENER,
                            Interest::READABLE,
                        ) {
                            warn!(error = %e, "failed to re-arm listener");
                        }
                        return;
                    }
                },
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
        }
        if let Some(idle) = self.ctx.tcp_keepalive {
            if let Err(e) = set_keepalive(&stream, idle) {
                debug!(peer = %peer, error = %e, "failed to enable TCP keepalive");
            }
        }

        let tls = match &self.ctx.tls {
            Some(config) => match ServerConnection::new(Arc::clone(config)) {
                Ok(session) => Some(session),
                Err(e) => {
                    warn!(peer = %peer, error = %e, "failed to create TLS session");
                    return;
                }
            },
            None => None,
        };

        let id = ConnectionId(self.next_id);
        self.next_id += 1;

        let connection = Connection::new(ConnectionParts {
            id,
            stream,
            peer_addr: peer,
            tls,
            protocol: self.ctx.protocol,
            max_body_length: self.ctx.max_body_length,
            poller: self.ctx.event_loop.assign(),
            manager: Arc::downgrade(&self.ctx.manager),
            handler: Arc::clone(&self.ctx.handler),
        });

        self.ctx.manager.add(Arc::clone(&connection));
        // `Server::stop` raises exit before its bulk clear, so a connection
        // inserted after that clear always sees the flag here.
        if self.shared.exit_requested.load(Ordering::SeqCst) {
            debug!(conn_id = %id, peer = %peer, "shutting down; dropping new connection");
            self.ctx.manager.remove(id);
            return;
        }
        if !connection.needs_handshake() {
            connection.open();
        }

        if let Err(e) = self.ctx.event_loop.add_read(&connection) {
            warn!(conn_id = %id, peer = %peer, error = %e, "failed to register connection");
            self.ctx.manager.remove(id);
            return;
        }

        debug!(
            conn_id = %id,
            peer = %peer,
            poller = %connection.poller_id(),
            tls = connection.is_tls(),
            "connection accepted"
        );
    }
}

/// What to do after `accept` fails with something other than `WouldBlock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFailure {
    /// Only that peer is affected; keep accepting.
    Retry,
    /// The listener itself is stuck (descriptor limits, memory); back off
    /// until the next poll.
    Rearm,
}

fn accept_failure(kind: io::ErrorKind) -> AcceptFailure {
    match kind {
        io::ErrorKind::Interrupted
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::PermissionDenied => AcceptFailure::Retry,
        _ => AcceptFailure::Rearm,
    }
}

/// Turns on TCP keepalive, first checking the peer after `idle`.
fn set_keepalive(stream: &TcpStream, idle: Duration) -> io::Result<()> {
    SockRef::from(stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::NoopHandler;

    fn acceptor() -> Acceptor {
        acceptor_with_keepalive(None)
    }

    fn acceptor_with_keepalive(tcp_keepalive: Option<Duration>) -> Acceptor {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let manager = Arc::new(ConnectManager::new());
        let ctx = AcceptorContext {
            event_loop: Arc::new(EventLoop::new(1, 8, Arc::clone(&manager)).unwrap()),
            manager,
            handler: Arc::new(NoopHandler),
            protocol: Protocol::Raw,
            max_body_length: 0,
            tls: None,
            tcp_keepalive,
        };
        Acceptor::new(listener, ctx).unwrap()
    }

    #[test]
    fn test_exit_before_run_returns_immediately() {
        let mut acceptor = acceptor();
        let handle = acceptor.handle();
        assert_eq!(handle.state(), AcceptorState::Idle);

        handle.exit();
        handle.exit();

        assert!(acceptor.run().is_ok());
        assert_eq!(handle.state(), AcceptorState::Stopped);
    }

    #[test]
    fn test_run_twice_is_invalid_state() {
        let mut acceptor = acceptor();
        acceptor.handle().exit();
        acceptor.run().unwrap();

        assert!(matches!(
            acceptor.run(),
            Err(AcceptorError::InvalidState(AcceptorState::Stopped))
        ));
    }

    #[test]
    fn test_accepted_connection_is_registered_with_manager() {
        // Arrange
        let mut acceptor = acceptor();
        let handle = acceptor.handle();
        let addr = acceptor.local_addr().unwrap();
        let manager = Arc::clone(&acceptor.ctx.manager);
        let thread = std::thread::spawn(move || acceptor.run());

        // Act
        let _client = std::net::TcpStream::connect(addr).unwrap();
        let mut admitted = false;
        for _ in 0..200 {
            if manager.len() == 1 {
                admitted = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        handle.exit();

        // Assert
        assert!(admitted, "connection was never admitted");
        let conn = manager.get(ConnectionId(1)).unwrap();
        assert!(conn.is_open(), "plain raw connections open on admission");
        assert!(thread.join().unwrap().is_ok());
    }

    #[test]
    fn test_accept_failures_split_into_retry_and_rearm() {
        assert_eq!(accept_failure(io::ErrorKind::ConnectionAborted), AcceptFailure::Retry);
        assert_eq!(accept_failure(io::ErrorKind::Interrupted), AcceptFailure::Retry);
        assert_eq!(accept_failure(io::ErrorKind::OutOfMemory), AcceptFailure::Rearm);
        assert_eq!(accept_failure(io::ErrorKind::Other), AcceptFailure::Rearm);
    }

    #[test]
    fn test_set_keepalive_sets_idle_time() {
        // Arrange
        let (stream, _peer) = crate::testing::socket_pair();

        // Act
        set_keepalive(&stream, Duration::from_secs(30)).unwrap();

        // Assert
        let socket = SockRef::from(&stream);
        assert!(socket.keepalive().unwrap());
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        assert_eq!(socket.tcp_keepalive_time().unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn test_admitted_socket_gets_configured_keepalive() {
        // Arrange
        let mut acceptor = acceptor_with_keepalive(Some(Duration::from_secs(45)));
        let handle = acceptor.handle();
        let addr = acceptor.local_addr().unwrap();
        let manager = Arc::clone(&acceptor.ctx.manager);
        let thread = std::thread::spawn(move || acceptor.run());

        // Act
        let _client = std::net::TcpStream::connect(addr).unwrap();
        for _ in 0..200 {
            if manager.len() == 1 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        handle.exit();
        assert!(thread.join().unwrap().is_ok());

        // Assert
        let conn = manager.get(ConnectionId(1)).expect("connection was never admitted");
        let keepalive = conn.with_socket(|s| SockRef::from(s).keepalive().unwrap());
        assert_eq!(keepalive, Some(true));
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        assert_eq!(
            conn.with_socket(|s| SockRef::from(s).tcp_keepalive_time().unwrap()),
            Some(Duration::from_secs(45))
        );
    }

    #[test]
    fn test_keepalive_off_by_default() {
        let mut acceptor = acceptor();
        let handle = acceptor.handle();
        let addr = acceptor.local_addr().unwrap();
        let manager = Arc::clone(&acceptor.ctx.manager);
        let thread = std::thread::spawn(move || acceptor.run());

        let _client = std::net::TcpStream::connect(addr).unwrap();
        for _ in 0..200 {
            if manager.len() == 1 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        handle.exit();
        assert!(thread.join().unwrap().is_ok());

        let conn = manager.get(ConnectionId(1)).expect("connection was never admitted");
        assert_eq!(conn.with_socket(|s| SockRef::from(s).keepalive().unwrap()), Some(false));
    }

    #[test]
    fn test_connection_admitted_during_shutdown_is_not_left_behind() {
        // Arrange: exit already requested, as when stop races an accept
        let mut acceptor = acceptor();
        acceptor.handle().exit();
        let (stream, peer) = crate::testing::socket_pair();
        let peer_addr = peer.local_addr().unwrap();

        // Act
        acceptor.admit(stream, peer_addr);

        // Assert
        assert!(acceptor.ctx.manager.is_empty());
        assert!(acceptor.ctx.manager.get(ConnectionId(1)).is_none());
    }
}
