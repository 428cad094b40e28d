//! Client coordinator.
//!
//! Every training worker owns one `Client`. It discovers the fleet, runs the
//! initialization election, and fans gradient pushes and parameter fetches
//! out to the owning shards.
//!
//! Within one `send_grads`/`get_params` call shards are contacted
//! concurrently. Across calls nothing is ordered: a `get_params` issued
//! after `send_grads` may or may not observe the gradient unless the caller
//! awaits the first call before starting the second. A failed `send_grads`
//! may already have been applied on other shards; nothing is rolled back.

use crate::client::partition::{partition_by_shard, shard};
use crate::config::ClientConfig;
use crate::core::{Error, Gradient, Parameter, ParameterWithConfig, Result, Server};
use crate::discovery::{Selector, ServerRegistry};
use crate::rpc::{Connector, PserverRpc};
use futures::future::try_join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Immutable view of the fleet for one coordination round.
struct Fleet {
    servers: Vec<Server>,
    shards: Vec<Arc<dyn PserverRpc>>,
    /// Set once every shard of this snapshot has been seen `Ready`
    ready: AtomicBool,
}

impl Fleet {
    fn len(&self) -> usize {
        self.shards.len()
    }
}

/// Client side of the parameter server protocol.
pub struct Client {
    registry: Arc<dyn ServerRegistry>,
    selector: Arc<dyn Selector>,
    connector: Arc<dyn Connector>,
    /// Expected number of shards
    server_count: usize,
    config: ClientConfig,
    /// Current fleet snapshot, fetched on first use
    fleet: RwLock<Option<Arc<Fleet>>>,
    /// Cached election outcome
    selected: OnceCell<bool>,
}

impl Client {
    /// Create a client for a fleet of `server_count` servers.
    ///
    /// The fleet is resolved lazily on the first call that needs it.
    pub fn new(
        registry: Arc<dyn ServerRegistry>,
        server_count: usize,
        selector: Arc<dyn Selector>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            registry,
            selector,
            connector,
            server_count,
            config: ClientConfig::default(),
            fleet: RwLock::new(None),
            selected: OnceCell::new(),
        }
    }

    /// Create with configuration.
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Expected number of shards.
    pub fn server_count(&self) -> usize {
        self.server_count
    }

    /// Servers in the current fleet snapshot, ordered by index.
    pub async fn servers(&self) -> Result<Vec<Server>> {
        Ok(self.fleet().await?.servers.clone())
    }

    /// Run the initialization election.
    ///
    /// The selector is consulted at most once; later calls return the
    /// cached answer.
    pub async fn begin_init_params(&self) -> Result<bool> {
        let selected = self
            .selected
            .get_or_try_init(|| self.selector.select())
            .await
            .copied()?;
        debug!(selected, "begin init params");
        Ok(selected)
    }

    /// Send one parameter to its owning shard.
    ///
    /// Only the elected client should call this.
    pub async fn init_param(&self, param: ParameterWithConfig) -> Result<()> {
        if self.selected.get() == Some(&false) {
            warn!(param = %param.param.name, "init_param called by a client that was not elected");
        }

        let fleet = self.fleet().await?;
        let index = shard(&param.param.name, fleet.len());
        fleet.shards[index].init_param(param).await
    }

    /// Tell every shard that initialization is complete.
    pub async fn finish_init_params(&self) -> Result<()> {
        let fleet = self.fleet().await?;
        try_join_all(fleet.shards.iter().map(|rpc| rpc.finish_init_params())).await?;

        fleet.ready.store(true, Ordering::SeqCst);
        info!(servers = fleet.len(), "parameter initialization finished");
        Ok(())
    }

    /// Block until every shard reports `Ready`.
    ///
    /// Used by clients that lost the election. Gives up with
    /// `Error::NotReady` after the configured discovery timeout.
    pub async fn wait_ready(&self) -> Result<()> {
        let deadline = Instant::now() + self.config.discovery_timeout();
        loop {
            let fleet = self.fleet().await?;
            if self.check_ready(&fleet).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::NotReady);
            }
            tokio::time::sleep(self.config.ready_poll_interval()).await;
        }
    }

    /// Push gradients, one RPC per owning shard.
    ///
    /// Fails with the first shard error. Shards that already applied their
    /// gradients keep them.
    pub async fn send_grads(&self, grads: Vec<Gradient>) -> Result<()> {
        if grads.is_empty() {
            return Ok(());
        }
        let fleet = self.ensure_ready().await?;
        let buckets = partition_by_shard(grads, fleet.len(), |g| g.name.as_str());

        let calls = buckets
            .into_iter()
            .enumerate()
            .filter(|(_, bucket)| !bucket.is_empty())
            .map(|(index, bucket)| {
                let rpc = fleet.shards[index].clone();
                let grads: Vec<Gradient> = bucket.into_iter().map(|(_, g)| g).collect();
                async move {
                    let count = grads.len();
                    rpc.send_grads(grads).await?;
                    debug!(shard = index, count, "gradients sent");
                    Ok::<_, Error>(())
                }
            });

        try_join_all(calls).await?;
        Ok(())
    }

    /// Fetch parameters, returned in the order of `names`.
    pub async fn get_params(&self, names: &[String]) -> Result<Vec<Parameter>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let fleet = self.ensure_ready().await?;
        let buckets = partition_by_shard(names.to_vec(), fleet.len(), |n| n.as_str());

        let calls = buckets
            .into_iter()
            .enumerate()
            .filter(|(_, bucket)| !bucket.is_empty())
            .map(|(index, bucket)| {
                let rpc = fleet.shards[index].clone();
                async move {
                    let (positions, wanted): (Vec<usize>, Vec<String>) = bucket.into_iter().unzip();
                    let params = rpc.get_params(wanted.clone()).await?;
                    if params.len() != wanted.len() {
                        return Err(Error::ParamCountMismatch {
                            index,
                            expected: wanted.len(),
                            got: params.len(),
                        });
                    }
                    if let Some((want, got)) = wanted
                        .iter()
                        .zip(params.iter())
                        .find(|(want, got)| **want != got.name)
                    {
                        return Err(Error::shard_rpc(
                            index,
                            format!("asked for {}, got {}", want, got.name),
                        ));
                    }
                    Ok::<_, Error>(positions.into_iter().zip(params).collect::<Vec<_>>())
                }
            });

        let mut slots: Vec<Option<Parameter>> = vec![None; names.len()];
        for (position, param) in try_join_all(calls).await?.into_iter().flatten() {
            slots[position] = Some(param);
        }

        slots
            .into_iter()
            .zip(names)
            .map(|(slot, name)| {
                slot.ok_or_else(|| Error::Internal(format!("no shard answered for {}", name)))
            })
            .collect()
    }

    /// Re-read the registry and replace the fleet snapshot.
    ///
    /// Calls already in flight finish against the snapshot they started
    /// with. The new snapshot is checked for readiness on its first use.
    pub async fn refresh(&self) -> Result<()> {
        let fleet = Arc::new(self.load_fleet().await?);
        *self.fleet.write().await = Some(fleet);
        Ok(())
    }

    async fn fleet(&self) -> Result<Arc<Fleet>> {
        if let Some(fleet) = self.fleet.read().await.as_ref() {
            return Ok(fleet.clone());
        }

        let mut guard = self.fleet.write().await;
        if let Some(fleet) = guard.as_ref() {
            return Ok(fleet.clone());
        }
        let fleet = Arc::new(self.load_fleet().await?);
        *guard = Some(fleet.clone());
        Ok(fleet)
    }

    async fn load_fleet(&self) -> Result<Fleet> {
        if self.server_count == 0 {
            return Err(Error::InvalidConfig("server count must be positive".into()));
        }

        let mut servers = self.registry.list().await?;
        if servers.len() != self.server_count {
            return Err(Error::FleetSizeMismatch {
                expected: self.server_count,
                got: servers.len(),
            });
        }
        servers.sort_by_key(|s| s.index);
        if let Some((expected, _)) = servers
            .iter()
            .enumerate()
            .find(|(i, s)| s.index != *i)
        {
            return Err(Error::Internal(format!(
                "fleet has no server for shard {}",
                expected
            )));
        }

        let shards =
            try_join_all(servers.iter().map(|server| self.connector.connect(server))).await?;
        info!(servers = servers.len(), "fleet snapshot loaded");
        Ok(Fleet {
            servers,
            shards,
            ready: AtomicBool::new(false),
        })
    }

    /// Ask every shard of `fleet` whether it is ready. The result is
    /// recorded on that snapshot only.
    async fn check_ready(&self, fleet: &Fleet) -> Result<bool> {
        let states = try_join_all(fleet.shards.iter().map(|rpc| rpc.is_ready())).await?;
        let ready = states.iter().all(|r| *r);
        if ready {
            fleet.ready.store(true, Ordering::SeqCst);
        }
        Ok(ready)
    }

    /// Current snapshot, once it is known to be ready.
    async fn ensure_ready(&self) -> Result<Arc<Fleet>> {
        let fleet = self.fleet().await?;
        if fleet.ready.load(Ordering::SeqCst) || self.check_ready(&fleet).await? {
            Ok(fleet)
        } else {
            Err(Error::NotReady)
        }
    }
}
