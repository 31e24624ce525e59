//! Demo handler: every message is sent straight back to its sender.

use std::sync::Arc;

use netman_core::{Connection, ConnectionHandler, Request};
use tracing::{debug, info, warn};

/// Echoes text frames as text and everything else (raw bodies, binary
/// frames, text that is not UTF-8) as a binary frame or raw body.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl ConnectionHandler for EchoHandler {
    fn on_open(&self, connection: &Arc<Connection>) {
        info!(
            conn_id = %connection.id(),
            peer = %connection.peer_addr(),
            protocol = %connection.protocol(),
            tls = connection.is_tls(),
            "connection opened"
        );
    }

    fn on_message(&self, request: Request) {
        let Some(conn) = request.connection() else {
            debug!("message for a connection that is already gone");
            return;
        };
        let message = request.message();
        debug!(conn_id = %conn.id(), len = message.len(), "echoing message");

        let result = match message.as_str() {
            Ok(text) if message.is_text() => conn.text(text),
            _ => conn.send(message.bytes()),
        };
        if let Err(e) = result {
            warn!(conn_id = %conn.id(), "echo failed: {e}");
        }
    }

    fn on_close(&self, connection: &Connection) {
        info!(conn_id = %connection.id(), peer = %connection.peer_addr(), "connection closed");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
