//! Server registries.
//!
//! A registry answers "which servers make up the fleet right now". The
//! static variant wraps a fixed list; the discovery variant reads the
//! desired fleet size and per-shard addresses from a `KvStore`.

use crate::core::{Error, Result, Server};
use crate::discovery::store::KvStore;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Key holding the desired number of shards (decimal).
pub const PS_DESIRED: &str = "/ps_desired";

/// Prefix of per-shard address keys: `/ps/<index>`.
pub const PS_PATH: &str = "/ps/";

/// Source of the current fleet.
#[async_trait]
pub trait ServerRegistry: Send + Sync {
    /// Current servers, ordered by index.
    async fn list(&self) -> Result<Vec<Server>>;
}

/// A fixed list of servers.
#[derive(Clone, Debug)]
pub struct StaticRegistry {
    servers: Vec<Server>,
}

impl StaticRegistry {
    /// Wrap a fixed list of servers.
    pub fn new(servers: Vec<Server>) -> Self {
        Self { servers }
    }

    /// Build from addresses, assigning indices in order.
    pub fn from_addrs<S: AsRef<str>>(addrs: &[S]) -> Self {
        Self::new(
            addrs
                .iter()
                .enumerate()
                .map(|(i, addr)| Server::new(i, addr.as_ref()))
                .collect(),
        )
    }
}

#[async_trait]
impl ServerRegistry for StaticRegistry {
    async fn list(&self) -> Result<Vec<Server>> {
        Ok(self.servers.clone())
    }
}

/// Registry backed by a discovery store.
pub struct DiscoveryRegistry {
    store: Arc<dyn KvStore>,
    /// Deadline for a complete fleet to appear
    timeout: Duration,
    /// Re-read interval in case watch events are missed
    poll_interval: Duration,
}

impl DiscoveryRegistry {
    /// Create a registry over `store`.
    pub fn new(store: Arc<dyn KvStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            poll_interval: Duration::from_millis(500),
        }
    }

    /// Set the fallback poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Authoritative number of shards in the fleet.
    ///
    /// Independent of how many servers have registered so far.
    pub async fn desired(&self) -> Result<usize> {
        read_desired(self.store.as_ref()).await
    }

    /// Servers registered right now, whether or not the fleet is complete.
    async fn snapshot(&self, desired: usize) -> Result<Vec<Server>> {
        let mut servers = Vec::with_capacity(desired);
        for (key, value) in self.store.get_prefix(PS_PATH).await? {
            let index = match key[PS_PATH.len()..].parse::<usize>() {
                Ok(index) if index < desired => index,
                _ => {
                    debug!(%key, "ignoring server entry outside the desired fleet");
                    continue;
                }
            };
            let addr = String::from_utf8(value)
                .map_err(|e| Error::DiscoveryUnavailable(format!("{}: bad address: {}", key, e)))?;
            servers.push(Server { index, addr });
        }
        servers.sort_by_key(|s| s.index);
        Ok(servers)
    }
}

#[async_trait]
impl ServerRegistry for DiscoveryRegistry {
    /// Waits until exactly `desired()` servers have registered.
    async fn list(&self) -> Result<Vec<Server>> {
        let deadline = Instant::now() + self.timeout;
        let mut watcher = self.store.watch(PS_PATH).await?;

        loop {
            let desired = self.desired().await?;
            let servers = self.snapshot(desired).await?;
            if servers.len() == desired {
                info!(servers = desired, "fleet complete");
                return Ok(servers);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::DiscoveryTimeout {
                    desired,
                    found: servers.len(),
                });
            }

            debug!(desired, found = servers.len(), "waiting for servers to register");
            let wait = self.poll_interval.min(deadline - now);
            tokio::select! {
                event = watcher.next() => {
                    if event.is_none() {
                        tokio::time::sleep(wait).await;
                    }
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

async fn read_desired(store: &dyn KvStore) -> Result<usize> {
    let raw = store.get(PS_DESIRED).await?.ok_or_else(|| {
        Error::DiscoveryUnavailable(format!("fleet size key {} is not set", PS_DESIRED))
    })?;
    let text = String::from_utf8(raw)
        .map_err(|e| Error::InvalidConfig(format!("{}: {}", PS_DESIRED, e)))?;
    text.trim()
        .parse::<usize>()
        .map_err(|e| Error::InvalidConfig(format!("{} = {:?}: {}", PS_DESIRED, text, e)))
}

/// Publish the desired fleet size.
pub async fn publish_desired(store: &dyn KvStore, desired: usize) -> Result<()> {
    store.put(PS_DESIRED, desired.to_string().into_bytes()).await
}

/// Claim the lowest free shard slot for a server at `addr`.
///
/// Returns the claimed index.
pub async fn register_server(store: &dyn KvStore, addr: &str) -> Result<usize> {
    let desired = read_desired(store).await?;
    for index in 0..desired {
        let key = format!("{}{}", PS_PATH, index);
        if store
            .compare_and_swap(&key, None, addr.as_bytes().to_vec())
            .await?
        {
            info!(index, %addr, "registered parameter server");
            return Ok(index);
        }
    }
    Err(Error::Internal(format!(
        "all {} shard slots are taken",
        desired
    )))
}

/// Release a shard slot.
pub async fn deregister_server(store: &dyn KvStore, index: usize) -> Result<()> {
    store.delete(&format!("{}{}", PS_PATH, index)).await?;
    Ok(())
}
