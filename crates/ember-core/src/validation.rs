//! Transaction validation.
//!
//! Two levels:
//!
//! - **Stateless** ([`validate_tx_structure`]): format and internal
//!   consistency, no external state.
//! - **Stateful** ([`validate_tx`]): UTXO-aware checks — input existence,
//!   coinbase maturity, signature verification against the spent outputs'
//!   recipient addresses, and value conservation.
//!
//! Coinbase transactions are only structurally validated here; their value
//! bound (subsidy plus fees) is enforced during block validation.

use std::collections::HashSet;

use crate::constants::{MAX_INPUTS, MAX_MONEY, MAX_OUTPUTS, MAX_TX_SIZE};
use crate::crypto;
use crate::error::TxError;
use crate::types::{OutPoint, Transaction, UtxoEntry};

/// Summary of a successfully validated transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedTx {
    /// Total value of all spent inputs.
    pub total_input: u64,
    /// Total value of all created outputs.
    pub total_output: u64,
    /// Fee in embers (`total_input - total_output`).
    pub fee: u64,
}

/// Stateless transaction checks.
///
/// - Non-empty outputs; non-empty inputs unless coinbase
/// - Every output value in `(0, MAX_MONEY]` and the sum within `MAX_MONEY`
/// - Input/output counts and serialized size within limits
/// - No duplicate input outpoints
/// - Signature and public-key fields have the exact expected lengths
pub fn validate_tx_structure(tx: &Transaction) -> Result<(), TxError> {
    if tx.outputs.is_empty() {
        return Err(TxError::Malformed("no outputs".into()));
    }
    if tx.outputs.len() > MAX_OUTPUTS {
        return Err(TxError::Malformed(format!(
            "too many outputs: {}",
            tx.outputs.len()
        )));
    }
    if tx.inputs.len() > MAX_INPUTS {
        return Err(TxError::Malformed(format!(
            "too many inputs: {}",
            tx.inputs.len()
        )));
    }

    let mut total: u64 = 0;
    for (i, output) in tx.outputs.iter().enumerate() {
        if output.value == 0 {
            return Err(TxError::ZeroValueOutput(i));
        }
        if output.value > MAX_MONEY {
            return Err(TxError::ValueOutOfRange(i));
        }
        total = total.checked_add(output.value).ok_or(TxError::ValueOverflow)?;
    }
    if total > MAX_MONEY {
        return Err(TxError::ValueOverflow);
    }

    let size = tx.size();
    if size > MAX_TX_SIZE {
        return Err(TxError::Oversized {
            size,
            max: MAX_TX_SIZE,
        });
    }

    if tx.is_coinbase() {
        return Ok(());
    }

    let mut seen: HashSet<&OutPoint> = HashSet::with_capacity(tx.inputs.len());
    for (i, input) in tx.inputs.iter().enumerate() {
        if !seen.insert(&input.previous_output) {
            return Err(TxError::DuplicateInput(input.previous_output.to_string()));
        }
        if input.signature.len() != crypto::SIGNATURE_LEN
            || input.public_key.len() != crypto::PUBLIC_KEY_LEN
        {
            return Err(TxError::BadSignature { index: i });
        }
    }

    Ok(())
}

/// Stateful transaction validation against a UTXO view.
///
/// `get_utxo` resolves an outpoint to its unspent entry; callers supply the
/// appropriate view (the confirmed set for mempool admission, an in-block
/// overlay during block validation). `spend_height` is the height the
/// transaction would be confirmed at, used for coinbase maturity.
pub fn validate_tx<F>(
    tx: &Transaction,
    get_utxo: F,
    spend_height: u64,
) -> Result<ValidatedTx, TxError>
where
    F: Fn(&OutPoint) -> Option<UtxoEntry>,
{
    if tx.is_coinbase() {
        return Err(TxError::BadCoinbase(
            "coinbase has no inputs to validate standalone".into(),
        ));
    }

    validate_tx_structure(tx)?;

    let mut total_input: u64 = 0;
    for (i, input) in tx.inputs.iter().enumerate() {
        let utxo = get_utxo(&input.previous_output)
            .ok_or_else(|| TxError::MissingInput(input.previous_output.to_string()))?;

        if !utxo.is_mature(spend_height) {
            return Err(TxError::ImmatureCoinbase { index: i });
        }

        crypto::verify_input(tx, i, &utxo)
            .map_err(|_| TxError::BadSignature { index: i })?;

        total_input = total_input
            .checked_add(utxo.output.value)
            .ok_or(TxError::ValueOverflow)?;
    }

    let total_output = tx.total_output_value().ok_or(TxError::ValueOverflow)?;
    if total_input < total_output {
        return Err(TxError::InsufficientFunds {
            have: total_input,
            need: total_output,
        });
    }

    Ok(ValidatedTx {
        total_input,
        total_output,
        fee: total_input - total_output,
    })
}
