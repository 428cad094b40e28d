//! Tracing subscriber setup.
//!
//! The library only emits `tracing` events; binaries and tests call
//! `init_tracing` once to print them.

use crate::core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::Level;

/// Log output format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-field default format
    Full,
    /// Single-line compact format
    Compact,
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum level: trace, debug, info, warn or error
    pub level: String,
    /// Output format
    pub format: LogFormat,
    /// Include the module path of each event
    pub with_target: bool,
}

impl LoggingConfig {
    /// Parsed minimum level.
    pub fn max_level(&self) -> Result<Level> {
        Level::from_str(&self.level)
            .map_err(|_| Error::InvalidConfig(format!("unknown log level {:?}", self.level)))
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Full,
            with_target: true,
        }
    }
}

/// Install a global `fmt` subscriber.
///
/// Returns `false` if a subscriber was already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<bool> {
    let level = config.max_level()?;
    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(config.with_target);

    let installed = match config.format {
        LogFormat::Full => builder.try_init().is_ok(),
        LogFormat::Compact => builder.compact().try_init().is_ok(),
    };
    Ok(installed)
}
