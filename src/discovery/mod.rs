//! Discovery Module
//!
//! Fleet membership and initialization election:
//! - Key-value store interface (etcd-style)
//! - Static and discovery-backed server registries
//! - Fixed and compare-and-swap election selectors

pub mod election;
pub mod memory;
pub mod registry;
pub mod store;

pub use election::{DiscoverySelector, FixedSelector, Selector, INIT_KEY};
pub use memory::MemoryStore;
pub use registry::{
    deregister_server, publish_desired, register_server, DiscoveryRegistry, ServerRegistry,
    StaticRegistry, PS_DESIRED, PS_PATH,
};
pub use store::{KvStore, WatchEvent, Watcher};
