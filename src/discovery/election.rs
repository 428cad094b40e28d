//! Initialization election.
//!
//! Exactly one client per training job initializes the parameters. The
//! election is a one-shot barrier: no lease, no renewal.

use crate::core::Result;
use crate::discovery::store::KvStore;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

/// Key claimed by the elected client.
pub const INIT_KEY: &str = "/init_ps";

/// Decides whether this client initializes the parameters.
#[async_trait]
pub trait Selector: Send + Sync {
    /// Whether this client is the one responsible for initialization.
    async fn select(&self) -> Result<bool>;
}

/// Selector with a fixed answer.
#[derive(Clone, Copy, Debug)]
pub struct FixedSelector {
    selected: bool,
}

impl FixedSelector {
    pub fn new(selected: bool) -> Self {
        Self { selected }
    }
}

#[async_trait]
impl Selector for FixedSelector {
    async fn select(&self) -> Result<bool> {
        Ok(self.selected)
    }
}

/// Election by atomic create of `INIT_KEY` in a discovery store.
///
/// The outcome is cached: asking again never re-runs the election.
pub struct DiscoverySelector {
    store: Arc<dyn KvStore>,
    client_id: String,
    outcome: OnceCell<bool>,
}

impl DiscoverySelector {
    /// Create a selector with a fresh client id.
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_client_id(store, &uuid::Uuid::new_v4().to_string())
    }

    /// Create a selector with a given client id.
    pub fn with_client_id(store: Arc<dyn KvStore>, client_id: &str) -> Self {
        Self {
            store,
            client_id: client_id.to_string(),
            outcome: OnceCell::new(),
        }
    }

    /// Identity written to the election key on success.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn elect(&self) -> Result<bool> {
        let won = self
            .store
            .compare_and_swap(INIT_KEY, None, self.client_id.as_bytes().to_vec())
            .await?;
        info!(client = %self.client_id, selected = won, "initialization election finished");
        Ok(won)
    }
}

#[async_trait]
impl Selector for DiscoverySelector {
    async fn select(&self) -> Result<bool> {
        self.outcome.get_or_try_init(|| self.elect()).await.copied()
    }
}
