//! Loopback fixtures shared by the unit tests.

use std::net::{TcpListener, TcpStream as StdTcpStream};
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpStream;

use crate::connection::manager::ConnectManager;
use crate::connection::{Connection, ConnectionId, ConnectionParts};
use crate::handler::ConnectionHandler;
use crate::options::Protocol;
use crate::protocol::Request;
use crate::reactor::poller::{Poller, PollerHandle, PollerId};

pub(crate) struct NoopHandler;

impl ConnectionHandler for NoopHandler {
    fn on_message(&self, _request: Request) {}
}

/// A connected pair: the server side as a non-blocking mio stream, the
/// client side as a blocking std stream with a read timeout.
pub(crate) fn socket_pair() -> (TcpStream, StdTcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = StdTcpStream::connect(listener.local_addr().unwrap()).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let (server, _) = listener.accept().unwrap();
    server.set_nonblocking(true).unwrap();
    (TcpStream::from_std(server), client)
}

/// One poller plus a manager, without a running wait loop.
pub(crate) struct Fixture {
    pub manager: Arc<ConnectManager>,
    pub handle: Arc<PollerHandle>,
    _poller: Poller,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_poller(PollerId(0), Arc::new(ConnectManager::new()))
    }

    pub fn with_poller(id: PollerId, manager: Arc<ConnectManager>) -> Self {
        let poller = Poller::new(id, 16, Arc::clone(&manager)).unwrap();
        Self {
            manager,
            handle: poller.handle(),
            _poller: poller,
        }
    }

    pub fn connection(&self, id: u64, protocol: Protocol) -> (Arc<Connection>, StdTcpStream) {
        self.build(id, protocol, 0, Arc::new(NoopHandler))
    }

    pub fn connection_with_limit(&self, id: u64, protocol: Protocol, limit: u32) -> (Arc<Connection>, StdTcpStream) {
        self.build(id, protocol, limit, Arc::new(NoopHandler))
    }

    pub fn connection_with_handler(
        &self,
        id: u64,
        protocol: Protocol,
        handler: Arc<dyn ConnectionHandler>,
    ) -> (Arc<Connection>, StdTcpStream) {
        self.build(id, protocol, 0, handler)
    }

    fn build(
        &self,
        id: u64,
        protocol: Protocol,
        max_body_length: u32,
        handler: Arc<dyn ConnectionHandler>,
    ) -> (Arc<Connection>, StdTcpStream) {
        let (stream, peer) = socket_pair();
        let peer_addr = peer.local_addr().unwrap();
        let conn = Connection::new(ConnectionParts {
            id: ConnectionId(id),
            stream,
            peer_addr,
            tls: None,
            protocol,
            max_body_length,
            poller: Arc::clone(&self.handle),
            manager: Arc::downgrade(&self.manager),
            handler,
        });
        self.manager.add(Arc::clone(&conn));
        conn.register().unwrap();
        (conn, peer)
    }
}
