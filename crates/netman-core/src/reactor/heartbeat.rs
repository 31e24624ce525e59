//! Idle eviction and WebSocket keepalive pings.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::connection::manager::ConnectManager;
use crate::options::{HeartbeatOptions, Protocol};

/// Outcome of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Sweep {
    pub evicted: usize,
    pub pinged: usize,
}

/// Closes connections idle longer than `idle_timeout` and pings the rest.
pub fn sweep(manager: &ConnectManager, idle_timeout: Duration) -> Sweep {
    let mut result = Sweep::default();
    for connection in manager.snapshot() {
        if connection.idle_for() > idle_timeout {
            debug!(conn_id = %connection.id(), "evicting idle connection");
            if connection.close() {
                result.evicted += 1;
            }
            continue;
        }
        match connection.ping() {
            Ok(()) if connection.is_open() && connection.protocol() == Protocol::WebSocket => {
                result.pinged += 1
            }
            Ok(()) => {}
            Err(e) => trace!(conn_id = %connection.id(), error = %e, "ping failed"),
        }
    }
    result
}

/// Background thread running [`sweep`] every interval.
pub struct Heartbeat {
    stop: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Heartbeat {
    /// # Errors
    ///
    /// The I/O error from [`thread::Builder::spawn`].
    pub fn spawn(options: HeartbeatOptions, manager: Arc<ConnectManager>) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("netman-heartbeat".to_string())
            .spawn(move || {
                debug!(
                    interval_ms = options.interval.as_millis() as u64,
                    idle_timeout_ms = options.idle_timeout.as_millis() as u64,
                    "heartbeat started"
                );
                while !flag.load(Ordering::Acquire) {
                    thread::park_timeout(options.interval);
                    if flag.load(Ordering::Acquire) {
                        break;
                    }
                    let result = sweep(&manager, options.idle_timeout);
                    if result.evicted > 0 {
                        debug!(evicted = result.evicted, pinged = result.pinged, "heartbeat sweep");
                    }
                }
            })?;

        Ok(Self {
            stop,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.lock().take() {
            thread.thread().unpark();
            let _ = thread.join();
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}
