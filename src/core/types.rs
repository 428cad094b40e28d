//! Value objects shared by clients and servers.

use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Element type tag of a serialized tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
}

impl ElementType {
    /// Width of one element in bytes.
    pub fn size_of(&self) -> usize {
        match self {
            ElementType::Int32 | ElementType::UInt32 | ElementType::Float32 => 4,
            ElementType::Int64 | ElementType::UInt64 | ElementType::Float64 => 8,
        }
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElementType::Int32 => write!(f, "int32"),
            ElementType::UInt32 => write!(f, "uint32"),
            ElementType::Int64 => write!(f, "int64"),
            ElementType::UInt64 => write!(f, "uint64"),
            ElementType::Float32 => write!(f, "float32"),
            ElementType::Float64 => write!(f, "float64"),
        }
    }
}

impl std::str::FromStr for ElementType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "int32" => Ok(ElementType::Int32),
            "uint32" => Ok(ElementType::UInt32),
            "int64" => Ok(ElementType::Int64),
            "uint64" => Ok(ElementType::UInt64),
            "float32" => Ok(ElementType::Float32),
            "float64" => Ok(ElementType::Float64),
            other => Err(Error::InvalidConfig(format!("unknown element type {:?}", other))),
        }
    }
}

/// A named parameter value.
///
/// Replaced wholesale on update; the content is never patched in place by
/// callers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    /// Unique key within the global parameter space
    pub name: String,
    /// Element type of the content
    pub element_type: ElementType,
    /// Serialized tensor data
    pub content: Vec<u8>,
}

impl Parameter {
    /// Create a new parameter.
    pub fn new(name: &str, element_type: ElementType, content: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            element_type,
            content,
        }
    }
}

/// A delta to apply to the parameter of the same name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gradient {
    /// Name of the parameter this gradient targets
    pub name: String,
    /// Element type of the content
    pub element_type: ElementType,
    /// Serialized tensor data
    pub content: Vec<u8>,
}

impl Gradient {
    /// Create a new gradient.
    pub fn new(name: &str, element_type: ElementType, content: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            element_type,
            content,
        }
    }
}

/// A parameter together with its optimizer configuration.
///
/// Only sent at initialization; the server keeps the config for every later
/// gradient applied to this parameter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterWithConfig {
    /// The initial value
    pub param: Parameter,
    /// Opaque optimizer configuration
    pub config: Vec<u8>,
}

impl ParameterWithConfig {
    /// Wrap a parameter with the server's default optimizer config.
    pub fn new(param: Parameter) -> Self {
        Self {
            param,
            config: Vec::new(),
        }
    }

    /// Set the optimizer config blob.
    pub fn with_config(mut self, config: Vec<u8>) -> Self {
        self.config = config;
        self
    }
}

/// A parameter server replica.
///
/// `index` is the shard identity; `addr` may change across restarts.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Server {
    /// Shard index
    pub index: usize,
    /// Network address
    pub addr: String,
}

impl Server {
    /// Create a new server entry.
    pub fn new(index: usize, addr: &str) -> Self {
        Self {
            index,
            addr: addr.to_string(),
        }
    }
}

/// Timestamp wrapper for consistent serialization.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Get current UTC timestamp.
pub fn now() -> Timestamp {
    chrono::Utc::now()
}
