//! Error types for the parameter server.

use crate::core::types::ElementType;
use thiserror::Error;

/// Result type alias for parameter server operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in parameter server operations.
#[derive(Error, Debug)]
pub enum Error {
    // Discovery errors
    #[error("Discovery store unavailable: {0}")]
    DiscoveryUnavailable(String),

    #[error("Timed out waiting for fleet: desired {desired} servers, found {found}")]
    DiscoveryTimeout { desired: usize, found: usize },

    #[error("Fleet size mismatch: expected {expected} servers, got {got}")]
    FleetSizeMismatch { expected: usize, got: usize },

    // Shard state errors
    #[error("Parameter server is not ready")]
    NotReady,

    #[error("Parameter server already initialized")]
    AlreadyInitialized,

    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    // Shard RPC errors
    #[error("RPC to shard {index} failed: {message}")]
    ShardRpc { index: usize, message: String },

    #[error("Shard {index} returned {got} parameters, expected {expected}")]
    ParamCountMismatch {
        index: usize,
        expected: usize,
        got: usize,
    },

    // Optimizer errors
    #[error("Invalid gradient: {0}")]
    InvalidGradient(String),

    #[error("Unsupported element type: {0}")]
    UnsupportedElementType(ElementType),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap a transport failure for a specific shard.
    pub fn shard_rpc(index: usize, err: impl std::fmt::Display) -> Self {
        Error::ShardRpc {
            index,
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
