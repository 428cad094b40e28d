//! RPC Module
//!
//! Transport between clients and parameter servers:
//! - `PserverRpc` call surface and `Connector` factory
//! - Length-delimited bincode frames with call ids and LZ4 compression
//! - TCP server loop and client

pub mod codec;
pub mod service;
pub mod tcp;

pub use codec::{Envelope, Request, Response, WireError};
pub use service::{Connector, LocalConnector, PserverRpc};
pub use tcp::{TcpConnector, TcpPserverClient};
