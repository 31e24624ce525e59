//! TOML configuration for the server binary.
//!
//! Every field has a default, so an empty file (or no file at all) is a
//! valid configuration.  Example:
//!
//! ```toml
//! [server]
//! bind_address = "0.0.0.0"
//! port = 9000
//! protocol = "websocket"   # or "raw"
//! event_loops = 4          # 0 = one per CPU
//! max_body_length = 65536  # 0 = unlimited
//! tcp_keepalive_secs = 60  # omit to leave keepalive off
//!
//! [tls]
//! cert_path = "/etc/netman/cert.pem"
//! key_path = "/etc/netman/key.pem"
//!
//! [heartbeat]
//! interval_secs = 15
//! idle_timeout_secs = 60
//!
//! [logging]
//! level = "info"
//! output = "stdout"        # "stderr" or a file path
//! ```
//!
//! TLS is enabled when both PEM paths are set; the heartbeat runs when both
//! of its values are set.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use netman_core::{HeartbeatOptions, Protocol, ServerOptions};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error accessing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] rustls::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub tls: TlsSection,
    #[serde(default)]
    pub heartbeat: HeartbeatSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// `"raw"` or `"websocket"`.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub event_loops: usize,
    #[serde(default)]
    pub max_body_length: u32,
    #[serde(default = "default_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_capacity")]
    pub events_capacity: usize,
    /// Idle seconds before TCP keepalive kicks in; unset or 0 = off.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_keepalive_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TlsSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSection {
    /// `tracing` filter directive; `RUST_LOG` overrides it.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `"stdout"`, `"stderr"` or a file path (opened in append mode).
    #[serde(default = "default_log_output")]
    pub output: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    9000
}
fn default_protocol() -> String {
    "raw".to_string()
}
fn default_capacity() -> usize {
    128
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_output() -> String {
    "stdout".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            protocol: default_protocol(),
            event_loops: 0,
            max_body_length: 0,
            channel_capacity: default_capacity(),
            events_capacity: default_capacity(),
            tcp_keepalive_secs: None,
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: default_log_output(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Loads the configuration at `path`, or the defaults if the file does not
/// exist.
///
/// # Errors
///
/// [`ConfigError::Io`] for file-system errors other than "not found",
/// [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => AppConfig::from_toml_str(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

impl AppConfig {
    /// # Errors
    ///
    /// [`ConfigError::Parse`] if the TOML is malformed.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// The address to listen on.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if `bind_address:port` is not a socket
    /// address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.server.bind_address, self.server.port)
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                field: "server.bind_address",
                reason: e.to_string(),
            })
    }

    /// Builds the core's options, loading TLS material if configured.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] for an unknown protocol or a half-configured
    /// TLS section, plus any error from [`load_tls`].
    pub fn to_options(&self) -> Result<ServerOptions, ConfigError> {
        let protocol: Protocol = self
            .server
            .protocol
            .parse()
            .map_err(|reason| ConfigError::Invalid {
                field: "server.protocol",
                reason,
            })?;

        let tls = match (&self.tls.cert_path, &self.tls.key_path) {
            (Some(cert), Some(key)) => Some(load_tls(cert, key)?),
            (None, None) => None,
            _ => {
                return Err(ConfigError::Invalid {
                    field: "tls",
                    reason: "cert_path and key_path must be set together".to_string(),
                })
            }
        };

        Ok(ServerOptions {
            num_event_loops: self.server.event_loops,
            max_body_length: self.server.max_body_length,
            protocol,
            tls,
            heartbeat: HeartbeatOptions::from_parts(
                self.heartbeat.interval_secs.map(Duration::from_secs),
                self.heartbeat.idle_timeout_secs.map(Duration::from_secs),
            ),
            channel_capacity: self.server.channel_capacity,
            events_capacity: self.server.events_capacity,
            tcp_keepalive: self
                .server
                .tcp_keepalive_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        })
    }
}

/// Builds a rustls server configuration from PEM files.
///
/// # Errors
///
/// [`ConfigError::Io`] if a file cannot be read, [`ConfigError::NoPrivateKey`]
/// if the key file holds no key, [`ConfigError::Tls`] if rustls rejects the
/// certificate/key pair.
pub fn load_tls(cert_path: &Path, key_path: &Path) -> Result<Arc<rustls::ServerConfig>, ConfigError> {
    let mut cert_reader = BufReader::new(File::open(cert_path).map_err(io_err(cert_path))?);
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err(cert_path))?;
    if certs.is_empty() {
        return Err(ConfigError::Invalid {
            field: "tls.cert_path",
            reason: format!("no certificates in {}", cert_path.display()),
        });
    }

    let mut key_reader = BufReader::new(File::open(key_path).map_err(io_err(key_path))?);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(io_err(key_path))?
        .ok_or_else(|| ConfigError::NoPrivateKey(key_path.to_path_buf()))?;

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ConfigError {
    let path = path.to_path_buf();
    move |source| ConfigError::Io { path, source }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
