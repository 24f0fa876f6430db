//! Chain events.
//!
//! The coordinator emits events after each atomic persistence commit, in
//! commit order, over a bounded `tokio::sync::broadcast` channel. A slow
//! subscriber that falls behind the buffer observes
//! [`tokio::sync::broadcast::error::RecvError::Lagged`] and continues from
//! the oldest retained event.

use ember_core::error::BlockError;
use ember_core::types::Hash256;

/// Why a transaction left the mempool without confirming.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EvictReason {
    /// Exceeded the mempool age limit.
    Expired,
    /// Displaced by higher-fee-rate entries under capacity pressure.
    CapacityPressure,
    /// An input was spent by a confirmed block.
    BlockConflict,
}

/// An event describing a committed state transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainEvent {
    /// The active tip moved. `reorg_depth` is 0 for a linear extension.
    TipAdvanced {
        new_tip: Hash256,
        height: u64,
        reorg_depth: u64,
    },
    /// A block was accepted: applied to the active chain (`fork: false`) or
    /// stored on a side branch (`fork: true`).
    BlockAccepted {
        hash: Hash256,
        height: u64,
        fork: bool,
    },
    BlockRejected {
        hash: Hash256,
        reason: BlockError,
    },
    TxAdmitted {
        txid: Hash256,
    },
    TxEvicted {
        txid: Hash256,
        reason: EvictReason,
    },
    TxReplaced {
        old_txid: Hash256,
        new_txid: Hash256,
    },
    /// The store reported corruption; the coordinator has stopped accepting
    /// blocks until an operator intervenes.
    CorruptionDetected {
        key: String,
    },
}
