//! # pserver - Sharded Parameter Server
//!
//! Parameter storage for distributed training:
//! - **Discovery**: fleet membership and a one-shot initialization election
//!   over an etcd-style key-value store
//! - **Server**: one shard of the parameter set with an init/ready state machine
//! - **Client**: deterministic sharding, gradient fan-out and ordered
//!   parameter fan-in
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pserver::client::Client;
//! use pserver::core::{ElementType, Parameter, ParameterWithConfig};
//! use pserver::discovery::{FixedSelector, StaticRegistry};
//! use pserver::rpc::TcpConnector;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> pserver::Result<()> {
//!     let registry = Arc::new(StaticRegistry::from_addrs(&["10.0.0.1:7164", "10.0.0.2:7164"]));
//!     let client = Client::new(
//!         registry,
//!         2,
//!         Arc::new(FixedSelector::new(true)),
//!         Arc::new(TcpConnector::default()),
//!     );
//!
//!     if client.begin_init_params().await? {
//!         let w = Parameter::new("w", ElementType::Float32, vec![0u8; 400]);
//!         client.init_param(ParameterWithConfig::new(w)).await?;
//!         client.finish_init_params().await?;
//!     } else {
//!         client.wait_ready().await?;
//!     }
//!
//!     let params = client.get_params(&["w".to_string()]).await?;
//!     println!("w has {} bytes", params[0].content.len());
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod core;
pub mod discovery;
pub mod monitoring;
pub mod rpc;
pub mod server;

#[cfg(feature = "python")]
pub mod python;

pub use core::error::{Error, Result};
