//! Subscriber setup for the `tracing` macros used throughout the workspace.
//!
//! The filter comes from `[logging] level`, unless `RUST_LOG` is set, in which
//! case the environment wins.  Output goes to stdout, stderr or a file opened
//! in append mode.

use std::fs::OpenOptions;
use std::path::PathBuf;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::{ConfigError, LoggingSection};

/// Where log lines are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    Stderr,
    File(PathBuf),
}

impl LogOutput {
    /// `"stdout"` and `"stderr"` (any case) name the standard streams;
    /// anything else is a file path.  An empty string means stdout.
    pub fn parse(output: &str) -> Self {
        let trimmed = output.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("stdout") {
            Self::Stdout
        } else if trimmed.eq_ignore_ascii_case("stderr") {
            Self::Stderr
        } else {
            Self::File(PathBuf::from(trimmed))
        }
    }

    fn make_writer(&self) -> Result<BoxMakeWriter, ConfigError> {
        Ok(match self {
            Self::Stdout => BoxMakeWriter::new(std::io::stdout),
            Self::Stderr => BoxMakeWriter::new(std::io::stderr),
            Self::File(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| ConfigError::Io {
                        path: path.clone(),
                        source,
                    })?;
                BoxMakeWriter::new(std::sync::Mutex::new(file))
            }
        })
    }
}

/// Builds the filter: `RUST_LOG` if present and valid, else `level`, else
/// `info`.
fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber.
///
/// A second call is a no-op, so tests and embedding applications may call it
/// freely.
///
/// # Errors
///
/// [`ConfigError::Io`] if the log file cannot be opened.
pub fn init_logging(section: &LoggingSection) -> Result<(), ConfigError> {
    let output = LogOutput::parse(&section.output);
    let writer = output.make_writer()?;
    let ansi = matches!(output, LogOutput::Stdout | LogOutput::Stderr);

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(&section.level))
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true)
        .try_init();
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
