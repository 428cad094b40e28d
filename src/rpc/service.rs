//! Shard RPC surface and connection factory.
//!
//! The client coordinator talks to every shard through `PserverRpc`, so the
//! same code drives in-process servers and remote ones over TCP.

use crate::core::{Error, Gradient, Parameter, ParameterWithConfig, Result, Server};
use crate::server::ParameterServer;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Calls a client can make against one parameter server.
///
/// Each call is a single blocking request/response; server-side errors are
/// returned unchanged, transport failures as `Error::ShardRpc`.
#[async_trait]
pub trait PserverRpc: Send + Sync {
    /// Store a parameter with its optimizer config.
    async fn init_param(&self, param: ParameterWithConfig) -> Result<()>;

    /// Close the initialization phase on this shard.
    async fn finish_init_params(&self) -> Result<()>;

    /// Apply a batch of gradients owned by this shard.
    async fn send_grads(&self, grads: Vec<Gradient>) -> Result<()>;

    /// Fetch parameters owned by this shard, in request order.
    async fn get_params(&self, names: Vec<String>) -> Result<Vec<Parameter>>;

    /// Whether this shard has finished initialization.
    async fn is_ready(&self) -> Result<bool>;
}

/// Opens RPC handles to servers.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to a server.
    async fn connect(&self, server: &Server) -> Result<Arc<dyn PserverRpc>>;
}

/// In-process connector resolving addresses to local servers.
#[derive(Default)]
pub struct LocalConnector {
    servers: RwLock<HashMap<String, Arc<ParameterServer>>>,
}

impl LocalConnector {
    /// Create an empty connector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `server` reachable at `addr`.
    pub async fn register(&self, addr: &str, server: Arc<ParameterServer>) {
        self.servers.write().await.insert(addr.to_string(), server);
    }

    /// Remove the server at `addr`.
    pub async fn unregister(&self, addr: &str) {
        self.servers.write().await.remove(addr);
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self, server: &Server) -> Result<Arc<dyn PserverRpc>> {
        let servers = self.servers.read().await;
        let local = servers.get(&server.addr).cloned().ok_or_else(|| {
            Error::shard_rpc(server.index, format!("no server listening at {}", server.addr))
        })?;
        Ok(local as Arc<dyn PserverRpc>)
    }
}
