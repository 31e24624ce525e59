//! netman server: entry point.
//!
//! Runs the netman reactor with the demo [`EchoHandler`], configured from a
//! TOML file with command-line overrides.
//!
//! # Usage
//!
//! ```text
//! netman-server [OPTIONS]
//!
//! Options:
//!   --config          <PATH>   TOML configuration file [default: netman.toml]
//!   --bind            <ADDR>   Listen address (overrides [server] bind_address)
//!   --port            <PORT>   Listen port (overrides [server] port)
//!   --protocol        <NAME>   "raw" or "websocket"
//!   --event-loops     <N>      Poller threads, 0 = one per CPU
//!   --max-body-length <BYTES>  Largest accepted message, 0 = unlimited
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable                 | Flag                |
//! |--------------------------|---------------------|
//! | `NETMAN_CONFIG`          | `--config`          |
//! | `NETMAN_BIND`            | `--bind`            |
//! | `NETMAN_PORT`            | `--port`            |
//! | `NETMAN_PROTOCOL`        | `--protocol`        |
//! | `NETMAN_EVENT_LOOPS`     | `--event-loops`     |
//! | `NETMAN_MAX_BODY_LENGTH` | `--max-body-length` |
//!
//! Flags take precedence over the environment, which takes precedence over
//! the file.  A missing config file means all defaults.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use netman_core::Server;
use netman_server::{init_logging, load_config, AppConfig, EchoHandler};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Event-driven TCP / WebSocket echo server.
#[derive(Debug, Parser)]
#[command(
    name = "netman-server",
    about = "Event-driven TCP / WebSocket server running a demo echo handler",
    version
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "netman.toml", env = "NETMAN_CONFIG")]
    config: PathBuf,

    /// IP address to listen on.
    #[arg(long, env = "NETMAN_BIND")]
    bind: Option<String>,

    /// TCP port to listen on.
    #[arg(long, env = "NETMAN_PORT")]
    port: Option<u16>,

    /// Framing protocol: `raw` (u32 length prefix) or `websocket`.
    #[arg(long, env = "NETMAN_PROTOCOL")]
    protocol: Option<String>,

    /// Number of poller threads; 0 means one per CPU.
    #[arg(long, env = "NETMAN_EVENT_LOOPS")]
    event_loops: Option<usize>,

    /// Largest accepted message body in bytes; 0 means unlimited.
    #[arg(long, env = "NETMAN_MAX_BODY_LENGTH")]
    max_body_length: Option<u32>,
}

impl Cli {
    /// Applies the command-line overrides on top of the file configuration.
    fn apply(&self, mut config: AppConfig) -> AppConfig {
        if let Some(bind) = &self.bind {
            config.server.bind_address = bind.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(protocol) = &self.protocol {
            config.server.protocol = protocol.clone();
        }
        if let Some(event_loops) = self.event_loops {
            config.server.event_loops = event_loops;
        }
        if let Some(max_body_length) = self.max_body_length {
            config.server.max_body_length = max_body_length;
        }
        config
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    let config = cli.apply(config);

    init_logging(&config.logging).context("failed to initialise logging")?;

    let addr = config.bind_addr().context("invalid listen address")?;
    let options = config.to_options().context("invalid server configuration")?;
    let server = Arc::new(
        Server::bind(addr, options, Arc::new(EchoHandler))
            .with_context(|| format!("failed to start server on {addr}"))?,
    );

    // The accept loop blocks, so it runs off the async runtime.
    let runner = {
        let server = Arc::clone(&server);
        tokio::task::spawn_blocking(move || server.start())
    };

    let stopper = Arc::clone(&server);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received Ctrl+C, shutting down"),
            Err(e) => error!("failed to listen for Ctrl+C signal: {e}"),
        }
        stopper.stop();
    });

    runner
        .await
        .context("accept loop panicked")?
        .context("accept loop failed")?;
    server.stop();

    info!("netman server stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_use_netman_toml_and_no_overrides() {
        // Arrange: parse with no arguments
        let cli = Cli::parse_from(["netman-server"]);

        // Assert
        assert_eq!(cli.config, PathBuf::from("netman.toml"));
        assert!(cli.bind.is_none());
        assert!(cli.port.is_none());
        assert!(cli.protocol.is_none());
    }

    #[test]
    fn test_cli_without_overrides_keeps_file_values() {
        let cli = Cli::parse_from(["netman-server"]);
        let file = AppConfig::from_toml_str("[server]\nport = 7000\nprotocol = \"websocket\"\n").unwrap();

        let config = cli.apply(file.clone());

        assert_eq!(config, file);
    }

    #[test]
    fn test_cli_port_override() {
        let cli = Cli::parse_from(["netman-server", "--port", "9999"]);

        let config = cli.apply(AppConfig::default());

        assert_eq!(config.server.port, 9999);
    }

    #[test]
    fn test_cli_overrides_every_server_field() {
        // Arrange
        let cli = Cli::parse_from([
            "netman-server",
            "--bind",
            "127.0.0.1",
            "--protocol",
            "ws",
            "--event-loops",
            "3",
            "--max-body-length",
            "1024",
        ]);

        // Act
        let config = cli.apply(AppConfig::default());

        // Assert
        assert_eq!(config.server.bind_address, "127.0.0.1");
        assert_eq!(config.server.protocol, "ws");
        assert_eq!(config.server.event_loops, 3);
        assert_eq!(config.server.max_body_length, 1024);
    }

    #[test]
    fn test_cli_invalid_port_is_rejected() {
        let result = Cli::try_parse_from(["netman-server", "--port", "70000"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_bind_override_produces_bind_addr() {
        let cli = Cli::parse_from(["netman-server", "--bind", "127.0.0.1", "--port", "8080"]);

        let addr = cli.apply(AppConfig::default()).bind_addr().unwrap();

        assert_eq!(addr.to_string(), "127.0.0.1:8080");
    }
}
