//! # ember-node
//! The consensus coordinator: RocksDB-backed chain storage, fork and orphan
//! management, mempool integration, and commit-ordered event emission.

pub mod events;
pub mod node;
pub mod storage;

pub use events::{ChainEvent, EvictReason};
pub use node::{
    BlockOutcome, ChainSnapshot, Node, NodeChainState, NodeConfig, NodeError, TipInfo, TxOutcome,
};
pub use storage::RocksStore;
