//! In-process discovery store.
//!
//! Single-node stand-in for etcd, used by tests and single-host topologies.
//! Can be switched offline to exercise discovery failures.

use crate::core::{Error, Result};
use crate::discovery::store::{KvStore, WatchEvent, Watcher};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;

/// Watch channel depth; slow watchers skip events beyond this.
const WATCH_CAPACITY: usize = 256;

/// In-memory `KvStore`.
pub struct MemoryStore {
    /// Key space
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    /// Change feed for watchers
    events: broadcast::Sender<WatchEvent>,
    /// Reachability flag
    available: AtomicBool,
}

impl MemoryStore {
    /// Create an empty, reachable store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            data: RwLock::new(BTreeMap::new()),
            events,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store going away or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::DiscoveryUnavailable("memory store is offline".into()))
        }
    }

    fn publish(&self, event: WatchEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.check()?;
        let data = self.data.read().await;
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.check()?;
        self.data
            .write()
            .await
            .insert(key.to_string(), value.clone());
        self.publish(WatchEvent::Put {
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check()?;
        let existed = self.data.write().await.remove(key).is_some();
        if existed {
            self.publish(WatchEvent::Delete {
                key: key.to_string(),
            });
        }
        Ok(existed)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
    ) -> Result<bool> {
        self.check()?;
        let mut data = self.data.write().await;
        if data.get(key).map(|v| v.as_slice()) != expected {
            return Ok(false);
        }
        data.insert(key.to_string(), new.clone());
        drop(data);

        self.publish(WatchEvent::Put {
            key: key.to_string(),
            value: new,
        });
        Ok(true)
    }

    async fn watch(&self, prefix: &str) -> Result<Watcher> {
        self.check()?;
        let rx = self.events.subscribe();
        let prefix = prefix.to_string();

        let stream = futures::stream::unfold((rx, prefix), |(mut rx, prefix)| async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.key().starts_with(&prefix) => {
                        return Some((event, (rx, prefix)));
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        store.put("/a", b"1".to_vec()).await.unwrap();
        assert_eq!(store.get("/a").await.unwrap(), Some(b"1".to_vec()));

        assert!(store.delete("/a").await.unwrap());
        assert!(!store.delete("/a").await.unwrap());
        assert_eq!(store.get("/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_prefix_sorted() {
        let store = MemoryStore::new();
        store.put("/ps/1", b"b".to_vec()).await.unwrap();
        store.put("/ps/0", b"a".to_vec()).await.unwrap();
        store.put("/ps_desired", b"2".to_vec()).await.unwrap();
        store.put("/other", b"x".to_vec()).await.unwrap();

        let entries = store.get_prefix("/ps/").await.unwrap();
        let keys: Vec<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["/ps/0", "/ps/1"]);
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = MemoryStore::new();
        assert!(store.compare_and_swap("/k", None, b"v1".to_vec()).await.unwrap());
        assert!(!store.compare_and_swap("/k", None, b"v2".to_vec()).await.unwrap());
        assert!(store
            .compare_and_swap("/k", Some(b"v1"), b"v3".to_vec())
            .await
            .unwrap());
        assert_eq!(store.get("/k").await.unwrap(), Some(b"v3".to_vec()));
    }

    #[tokio::test]
    async fn test_watch_filters_prefix() {
        let store = MemoryStore::new();
        let mut watcher = store.watch("/ps/").await.unwrap();

        store.put("/unrelated", b"x".to_vec()).await.unwrap();
        store.put("/ps/0", b":1234".to_vec()).await.unwrap();
        store.delete("/ps/0").await.unwrap();

        assert_eq!(
            watcher.next().await,
            Some(WatchEvent::Put {
                key: "/ps/0".into(),
                value: b":1234".to_vec()
            })
        );
        assert_eq!(
            watcher.next().await,
            Some(WatchEvent::Delete { key: "/ps/0".into() })
        );
    }

    #[tokio::test]
    async fn test_offline_store() {
        let store = MemoryStore::new();
        store.set_available(false);

        assert!(matches!(
            store.get("/a").await,
            Err(Error::DiscoveryUnavailable(_))
        ));
        assert!(matches!(
            store.put("/a", vec![]).await,
            Err(Error::DiscoveryUnavailable(_))
        ));

        store.set_available(true);
        assert!(store.get("/a").await.is_ok());
    }
}
