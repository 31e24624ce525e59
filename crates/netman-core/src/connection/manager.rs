//! Registry of live connections.
//!
//! A connection is in the registry exactly while it is live: the acceptor
//! adds it before registering it with a poller, and [`Connection::close`]
//! takes it out.  Removal and closing are coupled in both directions.
//!
//! The map is sharded ([`DashMap`]), so pollers, the acceptor, the
//! dispatcher and the heartbeat can use it concurrently.  No shard lock is
//! ever held while a connection is closed: bulk operations collect the
//! affected connections first.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::{Connection, ConnectionId};
use crate::reactor::poller::PollerId;

#[derive(Debug, Default)]
pub struct ConnectManager {
    connections: DashMap<ConnectionId, Arc<Connection>>,
}

impl ConnectManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, connection: Arc<Connection>) {
        self.connections.insert(connection.id(), connection);
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Removes and closes the connection.  Returns `false` (and does
    /// nothing) if `id` is unknown.
    pub fn remove(&self, id: ConnectionId) -> bool {
        match self.connections.remove(&id) {
            Some((_, connection)) => {
                connection.close();
                true
            }
            None => false,
        }
    }

    /// Drops the entry without closing; used by the connection itself.
    pub(crate) fn detach(&self, id: ConnectionId) {
        self.connections.remove(&id);
    }

    /// Closes every connection owned by `poller`.  Returns how many were
    /// closed.
    pub fn clear_by_poller(&self, poller: PollerId) -> usize {
        let doomed: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter(|entry| entry.value().poller_id() == poller)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let count = close_all(&doomed);
        debug!(poller = %poller, count, "cleared connections of poller");
        count
    }

    /// Closes every connection.  Returns how many were closed.
    pub fn clear_all(&self) -> usize {
        let doomed = self.snapshot();
        let count = close_all(&doomed);
        debug!(count, "cleared all connections");
        count
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// The live connections at this instant.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

fn close_all(connections: &[Arc<Connection>]) -> usize {
    connections.iter().filter(|connection| connection.close()).count()
}
