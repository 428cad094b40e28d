//! Parameter server holding one shard of the global parameter set.
//!
//! Lifecycle: `Empty -> Initializing -> Ready`. Parameters may only be
//! initialized before `finish_init_params`; gradients and reads are only
//! served after it.

use crate::config::ServerConfig;
use crate::core::{now, Error, Gradient, Parameter, ParameterWithConfig, Result, Timestamp};
use crate::rpc::service::PserverRpc;
use crate::server::optimizer::{create_optimizer, Optimizer, OptimizerConfig};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Initialization state of a shard.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShardState {
    /// No parameter received yet
    Empty,
    /// At least one parameter received, not finished
    Initializing,
    /// Serving gradients and reads
    Ready,
}

/// Server statistics.
#[derive(Clone, Debug, Default)]
pub struct ServerStats {
    pub total_init_requests: u64,
    pub total_gradients_applied: u64,
    pub total_get_requests: u64,
    pub last_update: Option<Timestamp>,
}

/// A stored parameter and the optimizer configured for it.
struct ParamSlot {
    param: Parameter,
    optimizer: Box<dyn Optimizer>,
}

/// Storage side of one shard.
pub struct ParameterServer {
    /// Initialization state
    state: RwLock<ShardState>,
    /// Parameters by name; each slot is updated atomically
    params: RwLock<HashMap<String, Arc<Mutex<ParamSlot>>>>,
    /// Server configuration
    config: ServerConfig,
    /// Statistics
    stats: Mutex<ServerStats>,
}

impl ParameterServer {
    /// Create an empty shard.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            state: RwLock::new(ShardState::Empty),
            params: RwLock::new(HashMap::new()),
            config,
            stats: Mutex::new(ServerStats::default()),
        }
    }

    /// Store a parameter and its optimizer config, replacing any previous
    /// value of the same name.
    pub async fn init_param(&self, pwc: ParameterWithConfig) -> Result<()> {
        let mut state = self.state.write().await;
        if *state == ShardState::Ready {
            return Err(Error::AlreadyInitialized);
        }

        let config = OptimizerConfig::from_blob(&pwc.config, &self.config.default_optimizer)?;
        let name = pwc.param.name.clone();
        let optimizer = create_optimizer(&config);
        let optimizer_kind = optimizer.kind();
        let slot = ParamSlot {
            param: pwc.param,
            optimizer,
        };

        self.params
            .write()
            .await
            .insert(name.clone(), Arc::new(Mutex::new(slot)));

        if *state == ShardState::Empty {
            debug!("shard entering initializing state");
        }
        *state = ShardState::Initializing;
        self.stats.lock().await.total_init_requests += 1;
        debug!(param = %name, optimizer = ?optimizer_kind, "parameter initialized");
        Ok(())
    }

    /// Close the initialization phase.
    ///
    /// A shard that never received a parameter goes straight to `Ready`.
    pub async fn finish_init_params(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state == ShardState::Ready {
            return Err(Error::AlreadyInitialized);
        }
        *state = ShardState::Ready;
        let count = self.params.read().await.len();
        info!(params = count, "shard ready");
        Ok(())
    }

    /// Apply one gradient to its parameter.
    pub async fn send_grad(&self, grad: &Gradient) -> Result<()> {
        self.ensure_ready().await?;

        let slot = self
            .params
            .read()
            .await
            .get(&grad.name)
            .cloned()
            .ok_or_else(|| Error::UnknownParameter(grad.name.clone()))?;

        {
            let mut slot = slot.lock().await;
            let ParamSlot { param, optimizer } = &mut *slot;
            optimizer.update(param, grad)?;
        }

        let mut stats = self.stats.lock().await;
        stats.total_gradients_applied += 1;
        stats.last_update = Some(now());
        Ok(())
    }

    /// Apply gradients in order, stopping at the first failure.
    pub async fn send_grads(&self, grads: &[Gradient]) -> Result<()> {
        for grad in grads {
            self.send_grad(grad).await?;
        }
        Ok(())
    }

    /// Current values for `names`, in request order.
    ///
    /// Fails as a whole if any name is unknown.
    pub async fn get_params(&self, names: &[String]) -> Result<Vec<Parameter>> {
        self.ensure_ready().await?;

        let slots: Vec<Arc<Mutex<ParamSlot>>> = {
            let params = self.params.read().await;
            names
                .iter()
                .map(|name| {
                    params
                        .get(name)
                        .cloned()
                        .ok_or_else(|| Error::UnknownParameter(name.clone()))
                })
                .collect::<Result<_>>()?
        };

        let mut result = Vec::with_capacity(slots.len());
        for slot in slots {
            result.push(slot.lock().await.param.clone());
        }

        self.stats.lock().await.total_get_requests += 1;
        Ok(result)
    }

    /// Current value of a single parameter.
    pub async fn get_param(&self, name: &str) -> Result<Parameter> {
        let mut params = self.get_params(&[name.to_string()]).await?;
        params
            .pop()
            .ok_or_else(|| Error::UnknownParameter(name.to_string()))
    }

    /// Current initialization state.
    pub async fn state(&self) -> ShardState {
        *self.state.read().await
    }

    /// Whether initialization has finished.
    pub async fn is_ready(&self) -> bool {
        self.state().await == ShardState::Ready
    }

    /// Number of stored parameters.
    pub async fn param_count(&self) -> usize {
        self.params.read().await.len()
    }

    /// Get statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.lock().await.clone()
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    async fn ensure_ready(&self) -> Result<()> {
        if self.is_ready().await {
            Ok(())
        } else {
            Err(Error::NotReady)
        }
    }
}

impl Default for ParameterServer {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

#[async_trait]
impl PserverRpc for ParameterServer {
    async fn init_param(&self, param: ParameterWithConfig) -> Result<()> {
        ParameterServer::init_param(self, param).await
    }

    async fn finish_init_params(&self) -> Result<()> {
        ParameterServer::finish_init_params(self).await
    }

    async fn send_grads(&self, grads: Vec<Gradient>) -> Result<()> {
        ParameterServer::send_grads(self, &grads).await
    }

    async fn get_params(&self, names: Vec<String>) -> Result<Vec<Parameter>> {
        ParameterServer::get_params(self, &names).await
    }

    async fn is_ready(&self) -> Result<bool> {
        Ok(ParameterServer::is_ready(self).await)
    }
}
