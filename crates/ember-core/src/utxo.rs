//! The unspent transaction output set and per-block deltas.
//!
//! Applying a block spends its inputs and creates its outputs, producing a
//! [`BlockDelta`] that records everything needed to undo the block exactly:
//! each consumed UTXO with its full prior contents, and each created
//! outpoint. Deltas are persisted alongside blocks so a reorg can revert
//! without replaying the chain.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::ChainStateError;
use crate::types::{Block, OutPoint, UtxoEntry};

/// Undo record for one applied block.
#[derive(
    Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockDelta {
    /// UTXOs consumed by the block, with their prior contents, in spend order.
    pub spent: Vec<(OutPoint, UtxoEntry)>,
    /// Outpoints created by the block, in creation order.
    pub created: Vec<OutPoint>,
}

impl BlockDelta {
    pub fn spent_count(&self) -> usize {
        self.spent.len()
    }

    pub fn created_count(&self) -> usize {
        self.created.len()
    }
}

/// In-memory UTXO set.
///
/// Blocks passed to [`apply_block`](Self::apply_block) must already be
/// validated; the set only refuses to spend outpoints it does not hold.
#[derive(Clone, Debug, Default)]
pub struct UtxoSet {
    entries: HashMap<OutPoint, UtxoEntry>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&UtxoEntry> {
        self.entries.get(outpoint)
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.entries.contains_key(outpoint)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OutPoint, &UtxoEntry)> {
        self.entries.iter()
    }

    /// Apply a validated block at `height`, spending inputs and creating
    /// outputs in block order (coinbase first).
    ///
    /// A transaction may spend an output created earlier in the same block;
    /// forward references fail with `MissingUtxo` because the referenced
    /// output does not exist yet when the spending input is processed.
    pub fn apply_block(&mut self, block: &Block, height: u64) -> Result<BlockDelta, ChainStateError> {
        let mut delta = BlockDelta::default();

        for tx in &block.transactions {
            for input in &tx.inputs {
                let entry = self
                    .entries
                    .remove(&input.previous_output)
                    .ok_or_else(|| {
                        ChainStateError::MissingUtxo(input.previous_output.to_string())
                    })?;
                delta.spent.push((input.previous_output.clone(), entry));
            }

            let txid = tx.txid();
            let is_coinbase = tx.is_coinbase();
            for (index, output) in tx.outputs.iter().enumerate() {
                let outpoint = OutPoint::new(txid, index as u32);
                self.entries.insert(
                    outpoint.clone(),
                    UtxoEntry {
                        output: output.clone(),
                        height,
                        is_coinbase,
                    },
                );
                delta.created.push(outpoint);
            }
        }

        Ok(delta)
    }

    /// Exactly reverse a previously applied block using its delta.
    ///
    /// Restores every spent UTXO with its original contents, then removes
    /// every created outpoint, leaving the set byte-identical to its
    /// pre-apply state. The ordering matters for outputs both created and
    /// consumed within the block: restoring first and removing second leaves
    /// them absent, as they were before the block.
    pub fn revert_block(&mut self, delta: &BlockDelta) {
        for (outpoint, entry) in &delta.spent {
            self.entries.insert(outpoint.clone(), entry.clone());
        }
        for outpoint in &delta.created {
            self.entries.remove(outpoint);
        }
    }
}
