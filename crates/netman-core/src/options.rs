//! Runtime options consumed by the core.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Wire protocol spoken by every connection of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// `[u32 BE length][body]` frames.
    #[default]
    Raw,
    /// HTTP upgrade followed by RFC 6455 frames.
    WebSocket,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Raw => f.write_str("raw"),
            Protocol::WebSocket => f.write_str("websocket"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" | "tcp" => Ok(Protocol::Raw),
            "websocket" | "ws" => Ok(Protocol::WebSocket),
            other => Err(format!("unknown protocol '{other}' (expected raw or websocket)")),
        }
    }
}

/// Idle eviction and keepalive pings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatOptions {
    /// How often the heartbeat thread wakes up.
    pub interval: Duration,
    /// Connections with no inbound traffic for this long are closed.
    pub idle_timeout: Duration,
}

impl HeartbeatOptions {
    /// Heartbeat runs only when both values are set and non-zero.
    pub fn from_parts(interval: Option<Duration>, idle_timeout: Option<Duration>) -> Option<Self> {
        match (interval, idle_timeout) {
            (Some(interval), Some(idle_timeout)) if !interval.is_zero() && !idle_timeout.is_zero() => {
                Some(Self {
                    interval,
                    idle_timeout,
                })
            }
            _ => None,
        }
    }
}

/// Everything [`Server::bind`](crate::Server::bind) needs besides the
/// address and the handler.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Number of poller threads; `0` uses the available parallelism.
    pub num_event_loops: usize,
    /// Largest accepted body / WebSocket payload; `0` = unlimited.
    pub max_body_length: u32,
    pub protocol: Protocol,
    /// Enables TLS on every accepted connection.
    pub tls: Option<Arc<rustls::ServerConfig>>,
    pub heartbeat: Option<HeartbeatOptions>,
    /// Idle time before TCP keepalive starts checking the peer; `None` leaves the OS
    /// default (keepalive off).
    pub tcp_keepalive: Option<Duration>,
    /// Capacity of the bounded channel between pollers and the dispatcher.
    pub channel_capacity: usize,
    /// Readiness events fetched per poll call.
    pub events_capacity: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            num_event_loops: 0,
            max_body_length: 0,
            protocol: Protocol::Raw,
            tls: None,
            heartbeat: None,
            tcp_keepalive: None,
            channel_capacity: 128,
            events_capacity: 128,
        }
    }
}

impl ServerOptions {
    /// The poller count actually used.
    pub fn event_loops(&self) -> usize {
        if self.num_event_loops > 0 {
            return self.num_event_loops;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}
