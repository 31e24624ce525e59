//! The callback seam between the reactor and application code.

use std::sync::Arc;

use crate::connection::Connection;
use crate::protocol::Request;

/// Application callbacks.
///
/// `on_open` and `on_close` run on poller (or acceptor / heartbeat)
/// threads and must not block.  `on_message` runs on the single dispatcher
/// thread, in arrival order per connection; a slow `on_message` eventually
/// stalls the pollers through the bounded channel.
///
/// No connection lock is held while any of these run, so a handler may call
/// back into the connection (`send`, `close`, ...).
#[cfg_attr(test, mockall::automock)]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// The connection is ready for application traffic: right after accept
    /// for plain raw connections, after the TLS handshake and/or WebSocket
    /// upgrade otherwise.
    fn on_open(&self, _connection: &Arc<Connection>) {}

    /// One complete inbound message.
    fn on_message(&self, request: Request);

    /// The socket has been torn down.  Only called if `on_open` was.
    fn on_close(&self, _connection: &Connection) {}
}
