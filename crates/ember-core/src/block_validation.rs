//! Block validation.
//!
//! Two levels:
//!
//! - **Stateless** ([`validate_block_structure`]): format, merkle root,
//!   coinbase position, duplicate txids, size, and proof-of-work against the
//!   header's own claimed bits. No chain state required.
//! - **Stateful** ([`validate_block`]): parent linkage, expected difficulty,
//!   median-time-past and future-drift bounds, full transaction validation
//!   against the parent's UTXO view, in-block double-spend detection, and
//!   the coinbase value bound.
//!
//! Stateful validation threads an in-block overlay over the parent UTXO
//! view: a transaction may spend an output created by an *earlier*
//! transaction in the same block, but never a later one, and never an output
//! already consumed within the block.

use std::collections::{HashMap, HashSet};

use crate::cancel::CancelFlag;
use crate::constants::{MAX_BLOCK_SIZE, MAX_FUTURE_DRIFT};
use crate::error::{BlockError, TxError};
use crate::merkle;
use crate::pow;
use crate::types::{Block, Hash256, OutPoint, UtxoEntry};
use crate::validation;

/// Chain-derived context required for stateful block validation.
///
/// The caller assembles these from the parent's branch: for active-tip
/// extension that is the main chain, during a reorg it is the branch being
/// connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockContext {
    /// Height the block must claim (`parent.height + 1`).
    pub height: u64,
    /// The parent's header hash.
    pub prev_hash: Hash256,
    /// The bits consensus expects at this height.
    pub expected_bits: u32,
    /// Median of the previous 11 ancestor timestamps.
    pub median_time_past: u64,
    /// Local wall-clock time in unix seconds.
    pub current_time: u64,
    /// Base subsidy for this height.
    pub subsidy: u64,
}

/// Summary of a successfully validated block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedBlock {
    /// Sum of all non-coinbase transaction fees.
    pub total_fees: u64,
    /// Total value of the coinbase outputs.
    pub coinbase_value: u64,
}

/// Stateless block checks.
pub fn validate_block_structure(block: &Block) -> Result<(), BlockError> {
    if block.header.version != 1 {
        return Err(BlockError::MalformedHeader(format!(
            "unsupported version {}",
            block.header.version
        )));
    }

    if block.transactions.is_empty() {
        return Err(BlockError::CoinbaseMissing);
    }
    if !block.transactions[0].is_coinbase() {
        return Err(BlockError::CoinbaseMissing);
    }
    for (i, tx) in block.transactions.iter().enumerate().skip(1) {
        if tx.is_coinbase() {
            return Err(BlockError::CoinbaseMisplaced(i));
        }
    }

    for (i, tx) in block.transactions.iter().enumerate() {
        validation::validate_tx_structure(tx)
            .map_err(|source| BlockError::Tx { index: i, source })?;
    }

    let mut txids = HashSet::with_capacity(block.transactions.len());
    let mut txid_vec = Vec::with_capacity(block.transactions.len());
    for tx in &block.transactions {
        let txid = tx.txid();
        if !txids.insert(txid) {
            return Err(BlockError::DuplicateTxid(txid.to_string()));
        }
        txid_vec.push(txid);
    }

    if block.header.merkle_root != merkle::merkle_root(&txid_vec) {
        return Err(BlockError::BadMerkle);
    }

    let size = block.size();
    if size > MAX_BLOCK_SIZE {
        return Err(BlockError::OversizedBlock {
            size,
            max: MAX_BLOCK_SIZE,
        });
    }

    pow::check_pow(&block.header)?;

    Ok(())
}

/// Stateful block validation against a parent UTXO view.
///
/// `get_utxo` resolves outpoints in the state **as of the parent block**;
/// outputs created earlier in this block are layered on top internally.
pub fn validate_block<F>(
    block: &Block,
    context: &BlockContext,
    get_utxo: F,
) -> Result<ValidatedBlock, BlockError>
where
    F: Fn(&OutPoint) -> Option<UtxoEntry>,
{
    validate_block_with_cancel(block, context, get_utxo, &CancelFlag::new())
}

/// Like [`validate_block`], aborting with [`BlockError::Cancelled`] between
/// transactions when `cancel` is raised. No state is mutated either way.
pub fn validate_block_with_cancel<F>(
    block: &Block,
    context: &BlockContext,
    get_utxo: F,
    cancel: &CancelFlag,
) -> Result<ValidatedBlock, BlockError>
where
    F: Fn(&OutPoint) -> Option<UtxoEntry>,
{
    validate_block_structure(block)?;

    // --- Header linkage ---

    if block.header.prev_hash != context.prev_hash {
        return Err(BlockError::MalformedHeader(
            "prev_hash does not match parent".into(),
        ));
    }
    if block.header.height != context.height {
        return Err(BlockError::WrongHeight {
            got: block.header.height,
            expected: context.height,
        });
    }

    // --- Difficulty ---

    if block.header.bits != context.expected_bits {
        return Err(BlockError::BadDifficulty {
            got: block.header.bits,
            expected: context.expected_bits,
        });
    }

    // --- Timestamp: strictly above MTP, bounded future drift ---

    if block.header.timestamp <= context.median_time_past {
        return Err(BlockError::BadTimestamp(format!(
            "{} not after median time past {}",
            block.header.timestamp, context.median_time_past
        )));
    }
    let max_time = context.current_time.saturating_add(MAX_FUTURE_DRIFT);
    if block.header.timestamp > max_time {
        return Err(BlockError::BadTimestamp(format!(
            "{} exceeds local time {} by more than the allowed drift",
            block.header.timestamp, context.current_time
        )));
    }

    // --- Transactions: overlay view, double-spend tracking, fees ---

    let mut created: HashMap<OutPoint, UtxoEntry> = HashMap::new();
    let mut block_spent: HashSet<OutPoint> = HashSet::new();
    let mut total_fees: u64 = 0;

    // Coinbase outputs join the overlay first; spending them in-block fails
    // the maturity check since they have zero confirmations here.
    add_outputs_to_overlay(&block.transactions[0], context.height, &mut created);

    for (i, tx) in block.transactions.iter().enumerate().skip(1) {
        if cancel.is_cancelled() {
            return Err(BlockError::Cancelled);
        }

        for input in &tx.inputs {
            if !block_spent.insert(input.previous_output.clone()) {
                return Err(BlockError::DoubleSpend(input.previous_output.to_string()));
            }
        }

        let lookup = |op: &OutPoint| -> Option<UtxoEntry> {
            created.get(op).cloned().or_else(|| get_utxo(op))
        };
        let validated = validation::validate_tx(tx, lookup, context.height)
            .map_err(|source| BlockError::Tx { index: i, source })?;

        total_fees = total_fees
            .checked_add(validated.fee)
            .ok_or(BlockError::Tx {
                index: i,
                source: TxError::ValueOverflow,
            })?;

        add_outputs_to_overlay(tx, context.height, &mut created);
    }

    // --- Coinbase value bound ---

    let coinbase_value = block.transactions[0]
        .total_output_value()
        .ok_or(BlockError::Tx {
            index: 0,
            source: TxError::ValueOverflow,
        })?;
    let allowed = context
        .subsidy
        .checked_add(total_fees)
        .ok_or(BlockError::Tx {
            index: 0,
            source: TxError::ValueOverflow,
        })?;
    if coinbase_value > allowed {
        return Err(BlockError::BadCoinbase {
            got: coinbase_value,
            allowed,
        });
    }

    Ok(ValidatedBlock {
        total_fees,
        coinbase_value,
    })
}

fn add_outputs_to_overlay(
    tx: &crate::types::Transaction,
    height: u64,
    created: &mut HashMap<OutPoint, UtxoEntry>,
) {
    let txid = tx.txid();
    let is_coinbase = tx.is_coinbase();
    for (index, output) in tx.outputs.iter().enumerate() {
        created.insert(
            OutPoint::new(txid, index as u32),
            UtxoEntry {
                output: output.clone(),
                height,
                is_coinbase,
            },
        );
    }
}
