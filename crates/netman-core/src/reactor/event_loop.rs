//! A fixed pool of pollers, one OS thread each.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::poller::{Poller, PollerError, PollerHandle, PollerId};
use crate::connection::manager::ConnectManager;
use crate::connection::{Connection, ConnectionError};
use crate::protocol::Request;

pub struct EventLoop {
    handles: Vec<Arc<PollerHandle>>,
    /// Pollers waiting for [`EventLoop::start`].
    idle: Mutex<Vec<Poller>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    next: AtomicUsize,
}

impl EventLoop {
    /// Creates `count` pollers (at least one).
    ///
    /// # Errors
    ///
    /// [`PollerError::Create`] if any poller cannot be created.
    pub fn new(count: usize, events_capacity: usize, manager: Arc<ConnectManager>) -> Result<Self, PollerError> {
        let pollers = (0..count.max(1))
            .map(|i| Poller::new(PollerId(i), events_capacity, Arc::clone(&manager)))
            .collect::<Result<Vec<_>, _>>()?;
        let handles = pollers.iter().map(Poller::handle).collect();

        Ok(Self {
            handles,
            idle: Mutex::new(pollers),
            threads: Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Spawns one `netman-poller-{i}` thread per poller.  Calling it again is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// The I/O error from [`thread::Builder::spawn`].
    pub fn start(&self, outbound: mpsc::Sender<Request>) -> io::Result<()> {
        let pollers = std::mem::take(&mut *self.idle.lock());
        let mut threads = self.threads.lock();
        for poller in pollers {
            let id = poller.handle().id();
            let outbound = outbound.clone();
            let thread = thread::Builder::new()
                .name(format!("netman-poller-{}", id.0))
                .spawn(move || {
                    if let Err(e) = poller.wait(outbound) {
                        warn!(poller = %id, error = %e, "poller exited with an error");
                    }
                })?;
            threads.push(thread);
        }
        debug!(pollers = threads.len(), "event loop started");
        Ok(())
    }

    /// Picks the next poller round-robin.
    pub fn assign(&self) -> Arc<PollerHandle> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        Arc::clone(&self.handles[i])
    }

    /// Registers `connection` for reads with the poller it was assigned to.
    ///
    /// # Errors
    ///
    /// The registration error; the caller closes the connection.
    pub fn add_read(&self, connection: &Arc<Connection>) -> Result<(), ConnectionError> {
        connection.register()
    }

    /// Wakes every poller and waits for its thread to finish.
    pub fn stop(&self) {
        for handle in &self.handles {
            handle.stop();
        }
        let current = thread::current().id();
        let threads = std::mem::take(&mut *self.threads.lock());
        for thread in threads {
            if thread.thread().id() == current {
                continue;
            }
            if thread.join().is_err() {
                warn!("poller thread panicked");
            }
        }
        debug!("event loop stopped");
    }
}
