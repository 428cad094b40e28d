//! Key-value store interface used for service discovery.
//!
//! Modeled on etcd: flat string keys, prefix reads, compare-and-swap and
//! prefix watches.

use crate::core::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// A change observed on a watched prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl WatchEvent {
    /// Key affected by the event.
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key } => key,
        }
    }
}

/// Stream of changes under a prefix. Ends when the store shuts down.
pub type Watcher = BoxStream<'static, WatchEvent>;

/// Discovery store backend.
///
/// Every method fails with `Error::DiscoveryUnavailable` when the store
/// cannot be reached.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a key.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Read every key starting with `prefix`, sorted by key.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Write a key unconditionally.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Atomically set `key` to `new` if its current value equals `expected`
    /// (`None` meaning absent). Returns whether the swap happened.
    async fn compare_and_swap(&self, key: &str, expected: Option<&[u8]>, new: Vec<u8>)
        -> Result<bool>;

    /// Subscribe to changes under `prefix`.
    async fn watch(&self, prefix: &str) -> Result<Watcher>;
}
