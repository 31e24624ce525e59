//! The server facade: wires listener, pollers, dispatcher and heartbeat.
//!
//! ```text
//!  clients ──► Acceptor ──round-robin──► Poller 0..N ──► mpsc (bounded) ──► dispatcher
//!                 │                          │                                  │
//!                 └──────── ConnectManager ◄─┘                      ConnectionHandler::on_message
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use mio::net::TcpListener;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::connection::manager::ConnectManager;
use crate::handler::ConnectionHandler;
use crate::options::ServerOptions;
use crate::protocol::Request;
use crate::reactor::acceptor::{Acceptor, AcceptorContext, AcceptorError, AcceptorHandle};
use crate::reactor::event_loop::EventLoop;
use crate::reactor::heartbeat::Heartbeat;
use crate::reactor::poller::PollerError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Poller(#[from] PollerError),

    #[error(transparent)]
    Acceptor(#[from] AcceptorError),

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("server has already been started")]
    AlreadyStarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerStatus {
    Stopped = 0,
    Started = 1,
    Stopping = 2,
}

impl ServerStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServerStatus::Stopped,
            1 => ServerStatus::Started,
            _ => ServerStatus::Stopping,
        }
    }
}

pub struct Server {
    local_addr: SocketAddr,
    status: AtomicU8,
    acceptor: Mutex<Option<Acceptor>>,
    acceptor_handle: AcceptorHandle,
    event_loop: Arc<EventLoop>,
    manager: Arc<ConnectManager>,
    heartbeat: Option<Heartbeat>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Binds `addr` and starts the pollers, the dispatcher and the
    /// heartbeat.  Connections are accepted once [`Server::start`] runs.
    ///
    /// # Errors
    ///
    /// Any failure to bind, create a poller or spawn a thread.
    pub fn bind(
        addr: SocketAddr,
        options: ServerOptions,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let manager = Arc::new(ConnectManager::new());
        let event_loop = Arc::new(EventLoop::new(
            options.event_loops(),
            options.events_capacity,
            Arc::clone(&manager),
        )?);

        let (tx, rx) = mpsc::channel(options.channel_capacity.max(1));
        let dispatcher = spawn_dispatcher(rx, Arc::clone(&handler))?;
        event_loop
            .start(tx)
            .map_err(|source| ServerError::Spawn {
                name: "poller",
                source,
            })?;

        let heartbeat = options
            .heartbeat
            .map(|hb| Heartbeat::spawn(hb, Arc::clone(&manager)))
            .transpose()
            .map_err(|source| ServerError::Spawn {
                name: "heartbeat",
                source,
            })?;

        let acceptor = Acceptor::new(
            listener,
            AcceptorContext {
                event_loop: Arc::clone(&event_loop),
                manager: Arc::clone(&manager),
                handler,
                protocol: options.protocol,
                max_body_length: options.max_body_length,
                tls: options.tls.clone(),
                tcp_keepalive: options.tcp_keepalive,
            },
        )?;

        info!(
            addr = %local_addr,
            protocol = %options.protocol,
            pollers = event_loop.len(),
            tls = options.tls.is_some(),
            "server bound"
        );

        Ok(Self {
            local_addr,
            status: AtomicU8::new(ServerStatus::Stopped as u8),
            acceptor_handle: acceptor.handle(),
            acceptor: Mutex::new(Some(acceptor)),
            event_loop,
            manager,
            heartbeat,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// The registry of live connections.
    pub fn connections(&self) -> &Arc<ConnectManager> {
        &self.manager
    }

    /// Runs the accept loop on the calling thread until [`Server::stop`].
    ///
    /// # Errors
    ///
    /// [`ServerError::AlreadyStarted`] on a second call, or the acceptor's
    /// error if its wait call fails.
    pub fn start(&self) -> Result<(), ServerError> {
        let mut acceptor = self.acceptor.lock().take().ok_or(ServerError::AlreadyStarted)?;
        let _ = self.status.compare_exchange(
            ServerStatus::Stopped as u8,
            ServerStatus::Started as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        info!(addr = %self.local_addr, "server started");
        acceptor.run()?;
        Ok(())
    }

    /// Stops accepting, closes every connection and joins the worker
    /// threads.  Only the first call has an effect.
    pub fn stop(&self) {
        if self.status.swap(ServerStatus::Stopping as u8, Ordering::AcqRel) == ServerStatus::Stopping as u8 {
            return;
        }
        info!(addr = %self.local_addr, "server stopping");

        self.acceptor_handle.exit();
        let closed = self.manager.clear_all();
        self.event_loop.stop();
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.stop();
        }

        // The dispatcher ends once every poller has dropped its sender.
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            if dispatcher.thread().id() != thread::current().id() {
                let _ = dispatcher.join();
            }
        }
        info!(closed, "server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_dispatcher(
    mut rx: mpsc::Receiver<Request>,
    handler: Arc<dyn ConnectionHandler>,
) -> Result<JoinHandle<()>, ServerError> {
    thread::Builder::new()
        .name("netman-dispatch".to_string())
        .spawn(move || {
            while let Some(request) = rx.blocking_recv() {
                handler.on_message(request);
            }
            debug!("dispatcher finished");
        })
        .map_err(|source| ServerError::Spawn {
            name: "dispatcher",
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::NoopHandler;

    fn bind() -> Server {
        let options = ServerOptions {
            num_event_loops: 2,
            ..ServerOptions::default()
        };
        Server::bind("127.0.0.1:0".parse().unwrap(), options, Arc::new(NoopHandler)).unwrap()
    }

    #[test]
    fn test_bind_reports_ephemeral_port() {
        let server = bind();
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.status(), ServerStatus::Stopped);
    }

    #[test]
    fn test_bind_to_used_port_fails() {
        let server = bind();
        let result = Server::bind(server.local_addr(), ServerOptions::default(), Arc::new(NoopHandler));
        assert!(matches!(result, Err(ServerError::Bind { .. })));
    }

    #[test]
    fn test_start_twice_is_rejected_and_stop_is_idempotent() {
        // Arrange
        let server = Arc::new(bind());
        let runner = Arc::clone(&server);
        let thread = std::thread::spawn(move || runner.start());
        while server.status() != ServerStatus::Started {
            std::thread::yield_now();
        }

        // Act
        let second = server.start();
        server.stop();
        server.stop();

        // Assert
        assert!(matches!(second, Err(ServerError::AlreadyStarted)));
        assert!(thread.join().unwrap().is_ok());
        assert_eq!(server.status(), ServerStatus::Stopping);
    }
}
