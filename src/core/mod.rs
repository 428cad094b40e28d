//! Core utilities and common types for the parameter server.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
