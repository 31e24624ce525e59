//! One readiness multiplexer and the loop that serves it.
//!
//! A [`Poller`] owns a [`mio::Poll`] and runs its wait loop on exactly one
//! thread.  Every other thread talks to it through the shared
//! [`PollerHandle`]: registration goes through a cloned [`mio::Registry`],
//! shutdown through a [`mio::Waker`].
//!
//! mio is edge-triggered, so a readiness event is reported once per state
//! change.  The connection read path drains the socket until `WouldBlock`
//! and the write path drains the queue the same way; nothing is left for a
//! second event that would never come.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mio::event::Source;
use mio::{Events, Poll, Registry, Token, Waker};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::connection::{manager::ConnectManager, ConnectionId, ErrorClass};
use crate::protocol::Request;

/// Token reserved for the poller's own waker.
pub const WAKE_TOKEN: Token = Token(usize::MAX);

/// Index of a poller inside its event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollerId(pub usize);

impl fmt::Display for PollerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "poller-{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum PollerError {
    #[error("failed to create poller: {0}")]
    Create(#[source] io::Error),

    #[error("registration update failed for token {token}: {source}")]
    Registration {
        token: usize,
        #[source]
        source: io::Error,
    },

    #[error("poll wait failed: {0}")]
    Wait(#[source] io::Error),
}

/// Thread-safe side of a poller.
pub struct PollerHandle {
    id: PollerId,
    registry: Registry,
    waker: Waker,
    stopping: AtomicBool,
}

impl fmt::Debug for PollerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollerHandle")
            .field("id", &self.id)
            .field("stopping", &self.stopping.load(Ordering::Relaxed))
            .finish()
    }
}

impl PollerHandle {
    pub fn id(&self) -> PollerId {
        self.id
    }

    /// Registers `source` for read readiness.
    ///
    /// # Errors
    ///
    /// [`PollerError::Registration`] when the OS rejects the registration.
    /// The caller still owns the socket and is responsible for closing it.
    pub fn add_read<S: Source + ?Sized>(&self, source: &mut S, token: Token) -> Result<(), PollerError> {
        self.registry
            .register(source, token, mio::Interest::READABLE)
            .map_err(|e| registration(token, e))
    }

    /// Registers `source` for write readiness.
    pub fn add_write<S: Source + ?Sized>(&self, source: &mut S, token: Token) -> Result<(), PollerError> {
        self.registry
            .register(source, token, mio::Interest::WRITABLE)
            .map_err(|e| registration(token, e))
    }

    /// Switches an existing registration to write readiness.
    pub fn mod_to_write<S: Source + ?Sized>(&self, source: &mut S, token: Token) -> Result<(), PollerError> {
        tolerate_missing(
            self.registry.reregister(source, token, mio::Interest::WRITABLE),
            token,
        )
    }

    /// Switches an existing registration back to read readiness.
    pub fn mod_to_read<S: Source + ?Sized>(&self, source: &mut S, token: Token) -> Result<(), PollerError> {
        tolerate_missing(
            self.registry.reregister(source, token, mio::Interest::READABLE),
            token,
        )
    }

    /// Removes `source` from the poller; a no-op if it is not registered.
    pub fn remove<S: Source + ?Sized>(&self, source: &mut S) -> Result<(), PollerError> {
        tolerate_missing(self.registry.deregister(source), Token(0))
    }

    /// Asks the wait loop to return at its next wake-up.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!(poller = %self.id, error = %e, "failed to wake poller");
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

fn registration(token: Token, source: io::Error) -> PollerError {
    PollerError::Registration {
        token: token.0,
        source,
    }
}

fn tolerate_missing(result: io::Result<()>, token: Token) -> Result<(), PollerError> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(registration(token, e)),
    }
}

/// A multiplexer plus its wait loop.
pub struct Poller {
    poll: Poll,
    events: Events,
    handle: Arc<PollerHandle>,
    manager: Arc<ConnectManager>,
}

impl Poller {
    /// # Errors
    ///
    /// [`PollerError::Create`] if the OS multiplexer, the registry clone or
    /// the waker cannot be created.
    pub fn new(id: PollerId, events_capacity: usize, manager: Arc<ConnectManager>) -> Result<Self, PollerError> {
        let poll = Poll::new().map_err(PollerError::Create)?;
        let registry = poll.registry().try_clone().map_err(PollerError::Create)?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN).map_err(PollerError::Create)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(events_capacity.max(1)),
            handle: Arc::new(PollerHandle {
                id,
                registry,
                waker,
                stopping: AtomicBool::new(false),
            }),
            manager,
        })
    }

    pub fn handle(&self) -> Arc<PollerHandle> {
        Arc::clone(&self.handle)
    }

    /// Closes every connection this poller owns after its wait call failed.
    fn abandon(&self, error: io::Error) -> PollerError {
        let id = self.handle.id;
        let cleared = self.manager.clear_by_poller(id);
        error!(poller = %id, error = %error, cleared, "poll wait failed; poller stopped");
        PollerError::Wait(error)
    }

    /// Runs the wait loop until [`PollerHandle::stop`] is called.
    ///
    /// Every complete, non-empty message is sent to `outbound`; the send
    /// blocks while the channel is full.
    ///
    /// # Errors
    ///
    /// [`PollerError::Wait`] if the wait call itself fails.  Every
    /// connection owned by this poller has been closed by then.
    pub fn wait(mut self, outbound: mpsc::Sender<Request>) -> Result<(), PollerError> {
        let id = self.handle.id;
        debug!(poller = %id, "poller started");

        loop {
            if let Err(e) = self.poll.poll(&mut self.events, None) {
                if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) {
                    continue;
                }
                return Err(self.abandon(e));
            }

            for event in self.events.iter() {
                let token = event.token();
                if token == WAKE_TOKEN {
                    if self.handle.is_stopping() {
                        debug!(poller = %id, "poller stopped");
                        return Ok(());
                    }
                    continue;
                }

                let conn_id = ConnectionId(token.0 as u64);
                let Some(conn) = self.manager.get(conn_id) else {
                    trace!(poller = %id, conn_id = %conn_id, "event for a connection that is gone");
                    continue;
                };

                if event.is_writable() {
                    if let Err(e) = conn.on_writable() {
                        debug!(poller = %id, conn_id = %conn_id, error = %e, "write failed");
                        conn.close();
                        continue;
                    }
                }

                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    let batch = conn.on_readable();
                    for message in batch.messages {
                        if message.is_empty() {
                            continue;
                        }
                        let request = Request::new(Arc::downgrade(&conn), message);
                        if outbound.blocking_send(request).is_err() {
                            warn!(poller = %id, conn_id = %conn_id, "dispatcher gone; dropping message");
                        }
                    }
                    if let Some(e) = batch.error {
                        match e.classify() {
                            ErrorClass::Transient => {}
                            ErrorClass::Fatal => {
                                debug!(poller = %id, conn_id = %conn_id, reason = %e, "closing connection");
                                conn.close();
                            }
                        }
                    }
                }
            }
        }
    }
}
