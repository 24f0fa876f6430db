//! Trait seams between crates.
//!
//! - [`ChainState`] — read-only blockchain state (ember-node implements it
//!   over RocksDB; [`MemoryChainStore`](crate::chain_state::MemoryChainStore)
//!   implements it for tests)
//! - [`BlockProducer`] — template creation and tip validation
//!   (ember-consensus implements it)

use crate::error::BlockError;
use crate::types::{Block, BlockHeader, Hash256, OutPoint, UtxoEntry};

/// Read-only view of the blockchain state.
///
/// Header and block lookups by hash cover side branches as well; the
/// height index covers only the active chain.
pub trait ChainState: Send + Sync {
    /// Look up a UTXO by outpoint. Returns `None` if spent or unknown.
    fn get_utxo(&self, outpoint: &OutPoint) -> Option<UtxoEntry>;

    /// Whether a UTXO exists and is unspent.
    fn contains_utxo(&self, outpoint: &OutPoint) -> bool {
        self.get_utxo(outpoint).is_some()
    }

    /// Current chain tip as `(height, block_hash)`.
    fn chain_tip(&self) -> (u64, Hash256);

    /// Get a block header by hash. Returns `None` if unknown.
    fn get_block_header(&self, hash: &Hash256) -> Option<BlockHeader>;

    /// Get a full block by hash. Returns `None` if unknown.
    fn get_block(&self, hash: &Hash256) -> Option<Block>;

    /// The active-chain block hash at `height`.
    fn get_block_hash(&self, height: u64) -> Option<Hash256>;
}

impl ChainState for crate::chain_state::MemoryChainStore {
    fn get_utxo(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        crate::chain_state::ChainStore::get_utxo(self, outpoint)
    }

    fn chain_tip(&self) -> (u64, Hash256) {
        crate::chain_state::ChainStore::chain_tip(self)
    }

    fn get_block_header(&self, hash: &Hash256) -> Option<BlockHeader> {
        crate::chain_state::ChainStore::get_block_header(self, hash)
    }

    fn get_block(&self, hash: &Hash256) -> Option<Block> {
        crate::chain_state::ChainStore::get_block(self, hash)
    }

    fn get_block_hash(&self, height: u64) -> Option<Hash256> {
        crate::chain_state::ChainStore::get_block_hash(self, height)
    }
}

/// Block creation and tip validation.
///
/// Used by miners to assemble templates and by the coordinator to validate
/// blocks extending the active tip.
pub trait BlockProducer: Send + Sync {
    /// Assemble a block template extending the active tip.
    ///
    /// The coinbase pays `coinbase_recipient`; `candidate_txs` are drawn
    /// from the mempool in selection order.
    fn create_block_template(
        &self,
        coinbase_recipient: &crate::address::Address,
        timestamp: u64,
        candidate_txs: &[crate::types::Transaction],
    ) -> Result<Block, BlockError>;

    /// Fully validate a block that claims to extend the active tip.
    fn validate_block(&self, block: &Block) -> Result<crate::block_validation::ValidatedBlock, BlockError>;

    /// The bits consensus expects for the child of `parent`.
    fn expected_bits_for_child(&self, parent: &BlockHeader) -> Result<u32, BlockError>;

    /// The base subsidy at a given height.
    fn block_subsidy(&self, height: u64) -> u64;
}
