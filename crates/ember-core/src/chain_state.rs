//! Chain storage interface and in-memory implementation.
//!
//! [`ChainStore`] is the mutable contract the coordinator drives: connect
//! and disconnect blocks at the tip, look up UTXOs, headers, blocks, and
//! deltas. The [`MemoryChainStore`] backs unit and integration tests; the
//! production node uses RocksDB (ember-node).
//!
//! Blocks passed to [`ChainStore::connect_block`] must already be validated.
//! The store only performs minimal sanity checks (height consistency, no
//! duplicate blocks).

use std::collections::HashMap;

use crate::error::ChainStateError;
use crate::types::{Block, BlockHeader, Hash256, OutPoint, UtxoEntry};
use crate::utxo::{BlockDelta, UtxoSet};

/// Mutable chain storage.
///
/// Not thread-safe — callers wrap implementations in a lock.
pub trait ChainStore: Send + Sync {
    /// Connect a validated block at the given height, returning the delta
    /// that was applied to the UTXO set.
    ///
    /// # Errors
    ///
    /// - [`ChainStateError::HeightMismatch`] if `height` is not the next height
    /// - [`ChainStateError::DuplicateBlock`] if the block hash already exists
    ///   on the active chain
    /// - [`ChainStateError::MissingUtxo`] if an input is not unspent
    fn connect_block(&mut self, block: &Block, height: u64) -> Result<BlockDelta, ChainStateError>;

    /// Disconnect the current tip, reverting its UTXO changes via the stored
    /// delta. Returns the disconnected block so the caller can re-admit its
    /// transactions to the mempool.
    fn disconnect_tip(&mut self) -> Result<Block, ChainStateError>;

    /// Look up a UTXO by outpoint. Returns `None` if spent or unknown.
    fn get_utxo(&self, outpoint: &OutPoint) -> Option<UtxoEntry>;

    /// Whether a UTXO exists and is unspent.
    fn contains_utxo(&self, outpoint: &OutPoint) -> bool {
        self.get_utxo(outpoint).is_some()
    }

    /// Current chain tip as `(height, block_hash)`.
    ///
    /// Returns `(0, Hash256::ZERO)` if no blocks have been connected.
    fn chain_tip(&self) -> (u64, Hash256);

    /// Get a block header by hash, including side-branch headers.
    fn get_block_header(&self, hash: &Hash256) -> Option<BlockHeader>;

    /// Get a full block by hash, including side-branch blocks.
    fn get_block(&self, hash: &Hash256) -> Option<Block>;

    /// The active-chain block hash at `height`.
    fn get_block_hash(&self, height: u64) -> Option<Hash256>;

    /// The stored delta for a connected block.
    fn get_delta(&self, hash: &Hash256) -> Option<BlockDelta>;

    /// Number of unspent outputs.
    fn utxo_count(&self) -> usize;

    /// Whether no blocks have been connected.
    fn is_empty(&self) -> bool;

    /// Iterate over all UTXOs. Used for balance queries and integrity scans.
    fn iter_utxos(&self) -> Vec<(OutPoint, UtxoEntry)>;
}

/// In-memory chain storage for testing. No persistence, no crash recovery.
pub struct MemoryChainStore {
    utxos: UtxoSet,
    blocks: HashMap<Hash256, Block>,
    headers: HashMap<Hash256, BlockHeader>,
    height_to_hash: HashMap<u64, Hash256>,
    deltas: HashMap<Hash256, BlockDelta>,
    tip_height: u64,
    tip_hash: Hash256,
}

impl MemoryChainStore {
    pub fn new() -> Self {
        Self {
            utxos: UtxoSet::new(),
            blocks: HashMap::new(),
            headers: HashMap::new(),
            height_to_hash: HashMap::new(),
            deltas: HashMap::new(),
            tip_height: 0,
            tip_hash: Hash256::ZERO,
        }
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

impl Default for MemoryChainStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainStore for MemoryChainStore {
    fn connect_block(&mut self, block: &Block, height: u64) -> Result<BlockDelta, ChainStateError> {
        if self.tip_hash == Hash256::ZERO {
            if height != 0 {
                return Err(ChainStateError::HeightMismatch {
                    expected: 0,
                    got: height,
                });
            }
        } else if height != self.tip_height + 1 {
            return Err(ChainStateError::HeightMismatch {
                expected: self.tip_height + 1,
                got: height,
            });
        }

        let block_hash = block.hash();
        if self.height_to_hash.values().any(|h| *h == block_hash) {
            return Err(ChainStateError::DuplicateBlock(block_hash.to_string()));
        }

        let delta = self.utxos.apply_block(block, height)?;

        self.headers.insert(block_hash, block.header.clone());
        self.blocks.insert(block_hash, block.clone());
        self.height_to_hash.insert(height, block_hash);
        self.deltas.insert(block_hash, delta.clone());

        self.tip_height = height;
        self.tip_hash = block_hash;

        Ok(delta)
    }

    fn disconnect_tip(&mut self) -> Result<Block, ChainStateError> {
        if self.tip_hash == Hash256::ZERO {
            return Err(ChainStateError::EmptyChain);
        }

        let tip_hash = self.tip_hash;
        let tip_height = self.tip_height;

        let block = self
            .blocks
            .get(&tip_hash)
            .cloned()
            .ok_or_else(|| ChainStateError::BlockNotFound(tip_hash.to_string()))?;
        let delta = self
            .deltas
            .get(&tip_hash)
            .cloned()
            .ok_or_else(|| ChainStateError::MissingDelta(tip_hash.to_string()))?;

        self.utxos.revert_block(&delta);
        self.height_to_hash.remove(&tip_height);

        if tip_height == 0 {
            self.tip_height = 0;
            self.tip_hash = Hash256::ZERO;
        } else {
            self.tip_height = tip_height - 1;
            self.tip_hash = block.header.prev_hash;
        }

        Ok(block)
    }

    fn get_utxo(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        self.utxos.get(outpoint).cloned()
    }

    fn chain_tip(&self) -> (u64, Hash256) {
        (self.tip_height, self.tip_hash)
    }

    fn get_block_header(&self, hash: &Hash256) -> Option<BlockHeader> {
        self.headers.get(hash).cloned()
    }

    fn get_block(&self, hash: &Hash256) -> Option<Block> {
        self.blocks.get(hash).cloned()
    }

    fn get_block_hash(&self, height: u64) -> Option<Hash256> {
        self.height_to_hash.get(&height).copied()
    }

    fn get_delta(&self, hash: &Hash256) -> Option<BlockDelta> {
        self.deltas.get(hash).cloned()
    }

    fn utxo_count(&self) -> usize {
        self.utxos.len()
    }

    fn is_empty(&self) -> bool {
        self.tip_hash == Hash256::ZERO
    }

    fn iter_utxos(&self) -> Vec<(OutPoint, UtxoEntry)> {
        self.utxos
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, Network};
    use crate::constants::COIN;
    use crate::merkle;
    use crate::types::{Transaction, TxInput, TxOutput};

    fn addr(seed: u8) -> Address {
        Address::new(Network::Mainnet, Hash256([seed; 32]))
    }

    fn make_coinbase(value: u64, height: u64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![],
            outputs: vec![TxOutput {
                value,
                recipient: addr(0xAA),
            }],
            lock_time: height,
            nonce: height,
            replaceable: false,
        }
    }

    fn make_tx(ops: &[OutPoint], value: u64, to: u8) -> Transaction {
        Transaction {
            version: 1,
            inputs: ops
                .iter()
                .map(|op| TxInput {
                    previous_output: op.clone(),
                    signature: vec![0; 64],
                    public_key: vec![0; 33],
                })
                .collect(),
            outputs: vec![TxOutput {
                value,
                recipient: addr(to),
            }],
            lock_time: 0,
            nonce: 0,
            replaceable: false,
        }
    }

    fn make_block(prev_hash: Hash256, height: u64, timestamp: u64, txs: Vec<Transaction>) -> Block {
        let txids: Vec<Hash256> = txs.iter().map(|tx| tx.txid()).collect();
        Block {
            header: crate::types::BlockHeader {
                version: 1,
                prev_hash,
                merkle_root: merkle::merkle_root(&txids),
                timestamp,
                bits: 0x207f_ffff,
                nonce: 0,
                height,
            },
            transactions: txs,
        }
    }

    #[test]
    fn new_store_is_empty() {
        let store = MemoryChainStore::new();
        assert!(store.is_empty());
        assert_eq!(store.utxo_count(), 0);
        assert_eq!(store.chain_tip(), (0, Hash256::ZERO));
    }

    #[test]
    fn connect_genesis() {
        let mut store = MemoryChainStore::new();
        let b0 = make_block(Hash256::ZERO, 0, 1_000_000, vec![make_coinbase(50 * COIN, 0)]);
        let hash0 = b0.hash();

        let delta = store.connect_block(&b0, 0).unwrap();
        assert_eq!(delta.created_count(), 1);
        assert_eq!(delta.spent_count(), 0);
        assert_eq!(store.chain_tip(), (0, hash0));
        assert_eq!(store.get_block_hash(0), Some(hash0));
        assert!(store.get_delta(&hash0).is_some());
    }

    #[test]
    fn connect_rejects_wrong_height() {
        let mut store = MemoryChainStore::new();
        let b0 = make_block(Hash256::ZERO, 0, 1_000_000, vec![make_coinbase(50 * COIN, 0)]);
        assert_eq!(
            store.connect_block(&b0, 1).unwrap_err(),
            ChainStateError::HeightMismatch { expected: 0, got: 1 }
        );
    }

    #[test]
    fn connect_rejects_duplicate() {
        let mut store = MemoryChainStore::new();
        let b0 = make_block(Hash256::ZERO, 0, 1_000_000, vec![make_coinbase(50 * COIN, 0)]);
        store.connect_block(&b0, 0).unwrap();
        // Same block again at the next height: same hash, rejected.
        assert!(matches!(
            store.connect_block(&b0, 1).unwrap_err(),
            ChainStateError::DuplicateBlock(_)
        ));
    }

    #[test]
    fn connect_spend_disconnect_restores() {
        let mut store = MemoryChainStore::new();
        let cb0 = make_coinbase(50 * COIN, 0);
        let cb0_txid = cb0.txid();
        let b0 = make_block(Hash256::ZERO, 0, 1_000_000, vec![cb0]);
        let hash0 = b0.hash();
        store.connect_block(&b0, 0).unwrap();

        let cb1 = make_coinbase(50 * COIN, 1);
        let tx = make_tx(&[OutPoint::new(cb0_txid, 0)], 49 * COIN, 0xCC);
        let b1 = make_block(hash0, 1, 1_000_600, vec![cb1, tx]);
        let delta = store.connect_block(&b1, 1).unwrap();
        assert_eq!(delta.spent_count(), 1);
        assert_eq!(delta.created_count(), 2);
        assert!(store.get_utxo(&OutPoint::new(cb0_txid, 0)).is_none());

        let disconnected = store.disconnect_tip().unwrap();
        assert_eq!(disconnected, b1);
        assert_eq!(store.chain_tip(), (0, hash0));
        let restored = store.get_utxo(&OutPoint::new(cb0_txid, 0)).unwrap();
        assert_eq!(restored.output.value, 50 * COIN);
        assert_eq!(store.get_block_hash(1), None);
    }

    #[test]
    fn disconnect_empty_chain_errors() {
        let mut store = MemoryChainStore::new();
        assert_eq!(
            store.disconnect_tip().unwrap_err(),
            ChainStateError::EmptyChain
        );
    }

    #[test]
    fn disconnect_genesis_returns_to_empty() {
        let mut store = MemoryChainStore::new();
        let b0 = make_block(Hash256::ZERO, 0, 1_000_000, vec![make_coinbase(50 * COIN, 0)]);
        store.connect_block(&b0, 0).unwrap();
        store.disconnect_tip().unwrap();
        assert!(store.is_empty());
        assert_eq!(store.utxo_count(), 0);
    }

    #[test]
    fn blocks_remain_after_disconnect() {
        // Disconnected blocks stay retrievable by hash for reorg bookkeeping.
        let mut store = MemoryChainStore::new();
        let b0 = make_block(Hash256::ZERO, 0, 1_000_000, vec![make_coinbase(50 * COIN, 0)]);
        let hash0 = b0.hash();
        store.connect_block(&b0, 0).unwrap();
        store.disconnect_tip().unwrap();
        assert!(store.get_block(&hash0).is_some());
        assert!(store.get_block_header(&hash0).is_some());
    }

    #[test]
    fn chain_of_ten_blocks_roundtrip() {
        let mut store = MemoryChainStore::new();
        let mut prev = Hash256::ZERO;
        for h in 0..10 {
            let b = make_block(prev, h, 1_000_000 + h * 600, vec![make_coinbase(50 * COIN, h)]);
            prev = b.hash();
            store.connect_block(&b, h).unwrap();
        }
        assert_eq!(store.utxo_count(), 10);
        for _ in 0..10 {
            store.disconnect_tip().unwrap();
        }
        assert!(store.is_empty());
        assert_eq!(store.utxo_count(), 0);
    }

    #[test]
    fn dyn_compatible() {
        let mut store = MemoryChainStore::new();
        let b0 = make_block(Hash256::ZERO, 0, 1_000_000, vec![make_coinbase(50 * COIN, 0)]);
        store.connect_block(&b0, 0).unwrap();
        let dyn_store: &dyn ChainStore = &store;
        assert!(!dyn_store.is_empty());
        assert_eq!(dyn_store.utxo_count(), 1);
    }
}
