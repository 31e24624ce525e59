//! # netman-server
//!
//! The pieces of the `netman-server` binary that are worth testing on their
//! own: TOML configuration, logging setup and the demo echo handler.

pub mod config;
pub mod echo;
pub mod logging;

pub use config::{load_config, AppConfig, ConfigError};
pub use echo::EchoHandler;
pub use logging::{init_logging, LogOutput};
