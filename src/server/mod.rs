//! Parameter Server Module
//!
//! Storage side of one shard:
//! - Init/finish state machine
//! - Gradient application via per-parameter optimizers
//! - Ordered parameter reads

pub mod optimizer;
pub mod service;

pub use optimizer::{create_optimizer, Optimizer, OptimizerConfig, OptimizerKind, SgdOptimizer};
pub use service::{ParameterServer, ServerStats, ShardState};
