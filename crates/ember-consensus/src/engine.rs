//! The consensus engine.
//!
//! Wires ember-core's validation, difficulty, and subsidy modules to a
//! [`ChainState`] to provide contextual block validation and block-template
//! assembly. The engine is stateless apart from its chain-state handle and
//! clock; the coordinator (ember-node) owns all mutation.
//!
//! Because headers carry their height, validation contexts can be built for
//! any stored parent by walking `prev_hash` links — the reorg path uses this
//! to validate side-branch blocks as they are connected.

use std::fmt;
use std::sync::Arc;

use ember_core::address::Address;
use ember_core::block_validation::{self, BlockContext, ValidatedBlock};
use ember_core::cancel::CancelFlag;
use ember_core::constants::{MAX_BLOCK_SIZE, RETARGET_INTERVAL};
use ember_core::difficulty;
use ember_core::error::BlockError;
use ember_core::merkle;
use ember_core::pow;
use ember_core::reward;
use ember_core::traits::{BlockProducer, ChainState};
use ember_core::types::{
    Block, BlockHeader, Hash256, OutPoint, Transaction, TxOutput, UtxoEntry,
};

/// Bytes reserved in a template for the header and coinbase transaction.
const TEMPLATE_RESERVE_BYTES: usize = 512;

/// The production consensus engine.
pub struct ConsensusEngine {
    chain_state: Arc<dyn ChainState>,
    clock: Box<dyn Fn() -> u64 + Send + Sync>,
}

impl fmt::Debug for ConsensusEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsensusEngine").finish_non_exhaustive()
    }
}

impl ConsensusEngine {
    /// Create an engine using the system clock.
    pub fn new(chain_state: Arc<dyn ChainState>) -> Self {
        Self {
            chain_state,
            clock: Box::new(|| {
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs()
            }),
        }
    }

    /// Create an engine with an injected clock for testing.
    pub fn with_clock(
        chain_state: Arc<dyn ChainState>,
        clock: impl Fn() -> u64 + Send + Sync + 'static,
    ) -> Self {
        Self {
            chain_state,
            clock: Box::new(clock),
        }
    }

    fn now(&self) -> u64 {
        (self.clock)()
    }

    fn header(&self, hash: &Hash256) -> Result<BlockHeader, BlockError> {
        self.chain_state
            .get_block_header(hash)
            .ok_or_else(|| BlockError::UnknownParent(hash.to_string()))
    }

    /// Timestamps of `parent` and up to ten further ancestors, for the
    /// median-time-past bound.
    fn ancestor_timestamps(&self, parent: &BlockHeader) -> Result<Vec<u64>, BlockError> {
        let mut timestamps = Vec::with_capacity(ember_core::constants::MTP_WINDOW);
        let mut current = parent.clone();
        loop {
            timestamps.push(current.timestamp);
            if timestamps.len() == ember_core::constants::MTP_WINDOW || current.height == 0 {
                break;
            }
            current = self.header(&current.prev_hash)?;
        }
        Ok(timestamps)
    }

    /// Median time past of the chain ending at `parent`.
    pub fn median_time_past(&self, parent: &BlockHeader) -> Result<u64, BlockError> {
        Ok(difficulty::median_time_past(&self.ancestor_timestamps(parent)?))
    }

    /// Build the validation context for a child of `parent`.
    pub fn context_for_child(&self, parent: &BlockHeader) -> Result<BlockContext, BlockError> {
        let height = parent.height + 1;
        Ok(BlockContext {
            height,
            prev_hash: parent.hash(),
            expected_bits: self.expected_bits_for_child(parent)?,
            median_time_past: self.median_time_past(parent)?,
            current_time: self.now(),
            subsidy: reward::block_subsidy(height),
        })
    }

    /// Fully validate a block extending the active tip, honoring `cancel`.
    pub fn validate_block_with_cancel(
        &self,
        block: &Block,
        cancel: &CancelFlag,
    ) -> Result<ValidatedBlock, BlockError> {
        let (_, tip_hash) = self.chain_state.chain_tip();
        if block.header.prev_hash != tip_hash {
            return Err(BlockError::UnknownParent(block.header.prev_hash.to_string()));
        }
        let parent = self.header(&tip_hash)?;
        let context = self.context_for_child(&parent)?;
        let cs = &self.chain_state;
        block_validation::validate_block_with_cancel(
            block,
            &context,
            |outpoint: &OutPoint| cs.get_utxo(outpoint),
            cancel,
        )
    }
}

impl BlockProducer for ConsensusEngine {
    fn block_subsidy(&self, height: u64) -> u64 {
        reward::block_subsidy(height)
    }

    /// The bits consensus expects for the child of `parent`.
    ///
    /// Non-retarget heights repeat the parent's bits. At a retarget boundary
    /// the closing window's first header is found by walking `prev_hash`
    /// links, so the computation is correct on side branches too.
    fn expected_bits_for_child(&self, parent: &BlockHeader) -> Result<u32, BlockError> {
        let child_height = parent.height + 1;
        if !difficulty::is_retarget_height(child_height) {
            return Ok(parent.bits);
        }

        let mut first = parent.clone();
        for _ in 0..RETARGET_INTERVAL - 1 {
            first = self.header(&first.prev_hash)?;
        }
        debug_assert_eq!(first.height, child_height - RETARGET_INTERVAL);

        Ok(difficulty::retarget(
            parent.bits,
            first.timestamp,
            parent.timestamp,
        ))
    }

    fn validate_block(&self, block: &Block) -> Result<ValidatedBlock, BlockError> {
        self.validate_block_with_cancel(block, &CancelFlag::new())
    }

    /// Assemble a block template extending the active tip.
    ///
    /// `candidate_txs` come from the mempool in selection order (fee-rate
    /// descending, parents before children). Candidates that no longer apply
    /// — spent inputs, immature coinbases, in-template double spends — are
    /// skipped rather than failing the template; the miner should not be
    /// penalized for stale pool entries.
    fn create_block_template(
        &self,
        coinbase_recipient: &Address,
        timestamp: u64,
        candidate_txs: &[Transaction],
    ) -> Result<Block, BlockError> {
        let (tip_height, tip_hash) = self.chain_state.chain_tip();
        let parent = self.header(&tip_hash)?;
        let height = tip_height + 1;
        let bits = self.expected_bits_for_child(&parent)?;
        let subsidy = reward::block_subsidy(height);

        // A template below the MTP bound would be dead on arrival.
        let mtp = self.median_time_past(&parent)?;
        let timestamp = timestamp.max(mtp + 1);

        let mut included: Vec<Transaction> = Vec::new();
        let mut spent: std::collections::HashSet<OutPoint> = std::collections::HashSet::new();
        let mut created: std::collections::HashMap<OutPoint, UtxoEntry> =
            std::collections::HashMap::new();
        let mut total_fees: u64 = 0;
        let mut budget = MAX_BLOCK_SIZE.saturating_sub(TEMPLATE_RESERVE_BYTES);

        for tx in candidate_txs {
            if tx.is_coinbase() {
                continue;
            }
            let size = tx.size();
            if size > budget {
                continue;
            }

            let mut input_value: u64 = 0;
            let mut tx_spent: Vec<OutPoint> = Vec::new();
            let mut valid = true;
            for input in &tx.inputs {
                if spent.contains(&input.previous_output) {
                    valid = false;
                    break;
                }
                let utxo = created
                    .get(&input.previous_output)
                    .cloned()
                    .or_else(|| self.chain_state.get_utxo(&input.previous_output));
                let Some(utxo) = utxo else {
                    valid = false;
                    break;
                };
                if !utxo.is_mature(height) {
                    valid = false;
                    break;
                }
                input_value = match input_value.checked_add(utxo.output.value) {
                    Some(v) => v,
                    None => {
                        valid = false;
                        break;
                    }
                };
                tx_spent.push(input.previous_output.clone());
            }
            if !valid {
                continue;
            }

            let output_value = match tx.total_output_value() {
                Some(v) if v <= input_value => v,
                _ => continue,
            };

            for op in tx_spent {
                spent.insert(op);
            }
            let txid = tx.txid();
            for (index, output) in tx.outputs.iter().enumerate() {
                created.insert(
                    OutPoint::new(txid, index as u32),
                    UtxoEntry {
                        output: output.clone(),
                        height,
                        is_coinbase: false,
                    },
                );
            }
            total_fees = total_fees.saturating_add(input_value - output_value);
            budget -= size;
            included.push(tx.clone());
        }

        let coinbase_value = subsidy
            .checked_add(total_fees)
            .ok_or(BlockError::BadCoinbase {
                got: u64::MAX,
                allowed: subsidy,
            })?;
        // lock_time and nonce carry the height so coinbase txids are unique
        // across heights even with identical recipients.
        let coinbase = Transaction {
            version: 1,
            inputs: vec![],
            outputs: vec![TxOutput {
                value: coinbase_value,
                recipient: *coinbase_recipient,
            }],
            lock_time: height,
            nonce: height,
            replaceable: false,
        };

        tracing::debug!(
            height,
            included = included.len(),
            total_fees,
            "assembled block template"
        );

        let mut transactions = Vec::with_capacity(1 + included.len());
        transactions.push(coinbase);
        transactions.extend(included);

        let txids: Vec<Hash256> = transactions.iter().map(|tx| tx.txid()).collect();
        let merkle_root = merkle::merkle_root(&txids);

        Ok(Block {
            header: BlockHeader {
                version: 1,
                prev_hash: tip_hash,
                merkle_root,
                timestamp,
                bits,
                nonce: 0,
                height,
            },
            transactions,
        })
    }
}

/// Search for a nonce satisfying the block's claimed difficulty.
///
/// Modifies `block.header.nonce` in place. Returns `true` if a valid nonce
/// was found within `[0, max_nonce]`.
pub fn mine_block(block: &mut Block, max_nonce: u64) -> bool {
    for nonce in 0..=max_nonce {
        block.header.nonce = nonce;
        if pow::check_pow(&block.header).is_ok() {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::address::Network;
    use ember_core::chain_state::{ChainStore, MemoryChainStore};
    use ember_core::constants::{COIN, INITIAL_REWARD, TARGET_BLOCK_TIME};
    use ember_core::crypto::{self, KeyPair};
    use ember_core::genesis;
    use ember_core::pow::GENESIS_BITS;
    use ember_core::types::TxInput;

    fn addr(seed: u8) -> Address {
        Address::new(Network::Mainnet, Hash256([seed; 32]))
    }

    /// A store holding genesis plus `extra` mined coinbase-only blocks.
    fn store_with_chain(extra: u64) -> MemoryChainStore {
        let mut store = MemoryChainStore::new();
        store.connect_block(genesis::genesis_block(), 0).unwrap();
        let mut prev = genesis::genesis_block().header.clone();
        for height in 1..=extra {
            let block = next_coinbase_block(&prev, height, addr(0xAA));
            prev = block.header.clone();
            store.connect_block(&block, height).unwrap();
        }
        store
    }

    fn next_coinbase_block(parent: &BlockHeader, height: u64, recipient: Address) -> Block {
        let coinbase = Transaction {
            version: 1,
            inputs: vec![],
            outputs: vec![TxOutput {
                value: reward::block_subsidy(height),
                recipient,
            }],
            lock_time: height,
            nonce: height,
            replaceable: false,
        };
        let txids = vec![coinbase.txid()];
        let mut block = Block {
            header: BlockHeader {
                version: 1,
                prev_hash: parent.hash(),
                merkle_root: merkle::merkle_root(&txids),
                timestamp: parent.timestamp + TARGET_BLOCK_TIME,
                bits: GENESIS_BITS,
                nonce: 0,
                height,
            },
            transactions: vec![coinbase],
        };
        assert!(mine_block(&mut block, u64::MAX));
        block
    }

    fn engine_at(store: MemoryChainStore, now: u64) -> ConsensusEngine {
        ConsensusEngine::with_clock(Arc::new(store), move || now)
    }

    #[test]
    fn expected_bits_repeats_parent_off_boundary() {
        let store = store_with_chain(3);
        let (_, tip) = ChainStore::chain_tip(&store);
        let parent = ChainStore::get_block_header(&store, &tip).unwrap();
        let engine = engine_at(store, genesis::GENESIS_TIMESTAMP + 10_000);
        assert_eq!(engine.expected_bits_for_child(&parent).unwrap(), GENESIS_BITS);
    }

    #[test]
    fn median_time_past_of_short_chain() {
        let store = store_with_chain(4);
        let (_, tip) = ChainStore::chain_tip(&store);
        let parent = ChainStore::get_block_header(&store, &tip).unwrap();
        let engine = engine_at(store, genesis::GENESIS_TIMESTAMP + 10_000);
        // Heights 0..=4 spaced TARGET_BLOCK_TIME apart: median of 5 = height 2.
        assert_eq!(
            engine.median_time_past(&parent).unwrap(),
            genesis::GENESIS_TIMESTAMP + 2 * TARGET_BLOCK_TIME
        );
    }

    #[test]
    fn template_mine_validate_cycle() {
        let store = store_with_chain(2);
        let (_, tip) = ChainStore::chain_tip(&store);
        let tip_ts = ChainStore::get_block_header(&store, &tip).unwrap().timestamp;
        let engine = engine_at(store, tip_ts + TARGET_BLOCK_TIME);

        let mut block = engine
            .create_block_template(&addr(0xBB), tip_ts + TARGET_BLOCK_TIME, &[])
            .unwrap();
        assert_eq!(block.header.height, 3);
        assert_eq!(block.header.prev_hash, tip);
        assert!(block.transactions[0].is_coinbase());
        assert_eq!(
            block.transactions[0].outputs[0].value,
            reward::block_subsidy(3)
        );

        assert!(mine_block(&mut block, u64::MAX));
        assert!(engine.validate_block(&block).is_ok());
    }

    #[test]
    fn template_timestamp_clamped_above_mtp() {
        let store = store_with_chain(2);
        let engine = engine_at(store, genesis::GENESIS_TIMESTAMP + 10_000);
        // Propose a timestamp far in the past; the template must lift it.
        let block = engine.create_block_template(&addr(0xBB), 0, &[]).unwrap();
        assert!(block.header.timestamp > genesis::GENESIS_TIMESTAMP);
    }

    #[test]
    fn template_includes_fee_paying_candidate() {
        // Build a chain where a spendable (non-coinbase) output exists.
        let kp = KeyPair::generate();
        let mut store = MemoryChainStore::new();
        store.connect_block(genesis::genesis_block(), 0).unwrap();
        let mut prev = genesis::genesis_block().header.clone();

        // Height 1 coinbase pays the key; heights 2..=101 bury it to maturity.
        let block1 = next_coinbase_block(&prev, 1, kp.address(Network::Mainnet));
        let funded_txid = block1.transactions[0].txid();
        prev = block1.header.clone();
        store.connect_block(&block1, 1).unwrap();
        for height in 2..=101 {
            let block = next_coinbase_block(&prev, height, addr(0xAA));
            prev = block.header.clone();
            store.connect_block(&block, height).unwrap();
        }

        let mut spend = Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::new(funded_txid, 0),
                signature: vec![],
                public_key: vec![],
            }],
            outputs: vec![TxOutput {
                value: INITIAL_REWARD - COIN,
                recipient: addr(0xCC),
            }],
            lock_time: 0,
            nonce: 0,
            replaceable: false,
        };
        crypto::sign_input(&mut spend, 0, INITIAL_REWARD, &kp).unwrap();

        let tip_ts = prev.timestamp;
        let engine = engine_at(store, tip_ts + TARGET_BLOCK_TIME);
        let block = engine
            .create_block_template(&addr(0xBB), tip_ts + TARGET_BLOCK_TIME, &[spend.clone()])
            .unwrap();

        assert_eq!(block.transactions.len(), 2);
        assert_eq!(block.transactions[1], spend);
        // Coinbase claims subsidy plus the 1 EMBER fee.
        assert_eq!(
            block.transactions[0].outputs[0].value,
            reward::block_subsidy(102) + COIN
        );
    }

    #[test]
    fn template_skips_immature_coinbase_spend() {
        let kp = KeyPair::generate();
        let mut store = MemoryChainStore::new();
        store.connect_block(genesis::genesis_block(), 0).unwrap();
        let block1 = next_coinbase_block(
            &genesis::genesis_block().header,
            1,
            kp.address(Network::Mainnet),
        );
        let funded_txid = block1.transactions[0].txid();
        let tip_ts = block1.header.timestamp;
        store.connect_block(&block1, 1).unwrap();

        let mut spend = Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::new(funded_txid, 0),
                signature: vec![],
                public_key: vec![],
            }],
            outputs: vec![TxOutput {
                value: INITIAL_REWARD - COIN,
                recipient: addr(0xCC),
            }],
            lock_time: 0,
            nonce: 0,
            replaceable: false,
        };
        crypto::sign_input(&mut spend, 0, INITIAL_REWARD, &kp).unwrap();

        let engine = engine_at(store, tip_ts + TARGET_BLOCK_TIME);
        let block = engine
            .create_block_template(&addr(0xBB), tip_ts + TARGET_BLOCK_TIME, &[spend])
            .unwrap();
        // The immature spend is filtered; only the coinbase remains.
        assert_eq!(block.transactions.len(), 1);
    }

    #[test]
    fn template_skips_in_template_double_spend() {
        let kp = KeyPair::generate();
        let mut store = MemoryChainStore::new();
        store.connect_block(genesis::genesis_block(), 0).unwrap();
        let mut prev = genesis::genesis_block().header.clone();
        let block1 = next_coinbase_block(&prev, 1, kp.address(Network::Mainnet));
        let funded_txid = block1.transactions[0].txid();
        prev = block1.header.clone();
        store.connect_block(&block1, 1).unwrap();
        for height in 2..=101 {
            let block = next_coinbase_block(&prev, height, addr(0xAA));
            prev = block.header.clone();
            store.connect_block(&block, height).unwrap();
        }

        let make_spend = |value: u64| {
            let mut tx = Transaction {
                version: 1,
                inputs: vec![TxInput {
                    previous_output: OutPoint::new(funded_txid, 0),
                    signature: vec![],
                    public_key: vec![],
                }],
                outputs: vec![TxOutput {
                    value,
                    recipient: addr(0xCC),
                }],
                lock_time: 0,
                nonce: 0,
                replaceable: false,
            };
            crypto::sign_input(&mut tx, 0, INITIAL_REWARD, &kp).unwrap();
            tx
        };
        let spend_a = make_spend(INITIAL_REWARD - COIN);
        let spend_b = make_spend(INITIAL_REWARD - 2 * COIN);

        let tip_ts = prev.timestamp;
        let engine = engine_at(store, tip_ts + TARGET_BLOCK_TIME);
        let block = engine
            .create_block_template(
                &addr(0xBB),
                tip_ts + TARGET_BLOCK_TIME,
                &[spend_a.clone(), spend_b],
            )
            .unwrap();
        assert_eq!(block.transactions.len(), 2);
        assert_eq!(block.transactions[1], spend_a);
    }

    #[test]
    fn validate_rejects_unknown_parent() {
        let store = store_with_chain(1);
        let (_, tip) = ChainStore::chain_tip(&store);
        let tip_ts = ChainStore::get_block_header(&store, &tip).unwrap().timestamp;
        let engine = engine_at(store, tip_ts + TARGET_BLOCK_TIME);

        let mut block = engine
            .create_block_template(&addr(0xBB), tip_ts + TARGET_BLOCK_TIME, &[])
            .unwrap();
        block.header.prev_hash = Hash256([0xFF; 32]);
        assert!(mine_block(&mut block, u64::MAX));
        assert!(matches!(
            engine.validate_block(&block).unwrap_err(),
            BlockError::UnknownParent(_)
        ));
    }

    #[test]
    fn validate_honors_cancellation() {
        let store = store_with_chain(1);
        let (_, tip) = ChainStore::chain_tip(&store);
        let tip_ts = ChainStore::get_block_header(&store, &tip).unwrap().timestamp;
        let engine = engine_at(store, tip_ts + TARGET_BLOCK_TIME);

        let mut block = engine
            .create_block_template(&addr(0xBB), tip_ts + TARGET_BLOCK_TIME, &[])
            .unwrap();
        assert!(mine_block(&mut block, u64::MAX));

        // Coinbase-only blocks never hit the per-tx cancel point, so this
        // must still validate even with the flag raised.
        let flag = CancelFlag::new();
        flag.cancel();
        assert!(engine.validate_block_with_cancel(&block, &flag).is_ok());
    }

    #[test]
    fn engine_is_object_safe() {
        let store = store_with_chain(0);
        let engine = engine_at(store, genesis::GENESIS_TIMESTAMP + TARGET_BLOCK_TIME);
        let dyn_bp: &dyn BlockProducer = &engine;
        assert_eq!(dyn_bp.block_subsidy(0), INITIAL_REWARD);
    }
}
