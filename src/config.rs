//! Client and server configuration.
//!
//! Both configs load from JSON; missing fields fall back to defaults.

use crate::core::{Error, Result};
use crate::server::optimizer::OptimizerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default LZ4 threshold for wire payloads (bytes).
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 64 * 1024;

/// Client coordinator configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Per-call timeout for shard RPCs (ms)
    pub rpc_timeout_ms: u64,
    /// Deadline for discovery queries and readiness waits (ms)
    pub discovery_timeout_ms: u64,
    /// Interval between readiness checks (ms)
    pub ready_poll_interval_ms: u64,
    /// Frames larger than this are LZ4-compressed
    pub compression_threshold: usize,
}

impl ClientConfig {
    /// Parse from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would never make progress.
    pub fn validate(&self) -> Result<()> {
        if self.rpc_timeout_ms == 0 {
            return Err(Error::InvalidConfig("rpc_timeout_ms must be positive".into()));
        }
        if self.ready_poll_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "ready_poll_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: 5_000,
            discovery_timeout_ms: 30_000,
            ready_poll_interval_ms: 100,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
        }
    }
}

/// Parameter server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen_addr: String,
    /// Frames larger than this are LZ4-compressed
    pub compression_threshold: usize,
    /// Optimizer used when a parameter arrives without a config blob
    pub default_optimizer: OptimizerConfig,
}

impl ServerConfig {
    /// Parse from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.default_optimizer.validate()?;
        Ok(config)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            default_optimizer: OptimizerConfig::default(),
        }
    }
}
