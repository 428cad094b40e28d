//! Client Module
//!
//! Coordinator run by every training worker:
//! - Deterministic shard placement
//! - Initialization election and barrier
//! - Gradient fan-out and ordered parameter fan-in

pub mod coordinator;
pub mod partition;

pub use coordinator::Client;
pub use partition::{partition_by_shard, shard, stable_hash};
