//! Core protocol types: transactions, blocks, UTXOs.
//!
//! All monetary values are in embers (1 EMBER = 10^8 embers).
//! Hashing uses SHA-256 throughout: txids over the signature-free canonical
//! encoding, block hashes as double SHA-256 over the fixed header layout.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::address::Address;
use crate::codec;
use crate::constants::COINBASE_MATURITY;

/// A 32-byte SHA-256 hash value.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes). Used for the genesis previous-hash.
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Single SHA-256 over a byte slice.
pub fn sha256(data: &[u8]) -> Hash256 {
    Hash256(Sha256::digest(data).into())
}

/// Double SHA-256 over a byte slice.
pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    Hash256(Sha256::digest(first).into())
}

/// Reference to a specific output of a previous transaction.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    /// Transaction ID containing the referenced output.
    pub txid: Hash256,
    /// Index of the output within the transaction.
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: Hash256, index: u32) -> Self {
        Self { txid, index }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// A transaction input, spending a previous output.
///
/// `signature` is a 64-byte compact ECDSA signature and `public_key` a
/// 33-byte compressed SEC1 point; both are empty until the input is signed.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TxInput {
    pub previous_output: OutPoint,
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
}

/// A transaction output, creating a new UTXO.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOutput {
    /// Value in embers.
    pub value: u64,
    /// The recipient address (network byte + SHA-256 of the public key).
    pub recipient: Address,
}

/// A transaction transferring value between addresses.
///
/// A coinbase transaction has no inputs; it mints the block subsidy plus
/// collected fees. The `nonce` is a sender-scoped anti-replay hint consulted
/// only by the mempool, never by consensus. `replaceable` is the
/// replace-by-fee opt-in flag, committed by the txid.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    /// Minimum block height (or unix time, above `LOCKTIME_THRESHOLD`)
    /// before mempool admission. Zero disables the lock.
    pub lock_time: u64,
    /// Sender-scoped monotonic counter. Zero means unset.
    pub nonce: u64,
    /// Opt-in to replacement by a higher-fee conflicting transaction.
    pub replaceable: bool,
}

impl Transaction {
    /// Compute the transaction ID: SHA-256 of the canonical encoding with
    /// all signature and public-key fields empty.
    ///
    /// Excluding witness data makes the txid non-malleable and lets the
    /// sighash reference it without circularity.
    pub fn txid(&self) -> Hash256 {
        sha256(&codec::tx_signing_bytes(self))
    }

    /// Whether this is a coinbase transaction (no inputs).
    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Sum of all output values. Returns None on overflow.
    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.value))
    }

    /// Serialized size in bytes of the canonical encoding.
    pub fn size(&self) -> usize {
        codec::tx_bytes(self).len()
    }
}

/// Block header containing the proof-of-work puzzle.
///
/// The header hash is double SHA-256 over the fixed 96-byte canonical
/// layout; `bits` is the Bitcoin-style compact encoding of the 256-bit
/// difficulty target.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    /// Hash of the previous block header. Zero for genesis.
    pub prev_hash: Hash256,
    /// SHA-256 merkle root over the block's transaction IDs.
    pub merkle_root: Hash256,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
    /// Compact difficulty target.
    pub bits: u32,
    /// Proof-of-work nonce.
    pub nonce: u64,
    /// Height of this block in its chain.
    pub height: u64,
}

impl BlockHeader {
    /// Compute the block header hash (double SHA-256 over the canonical layout).
    pub fn hash(&self) -> Hash256 {
        sha256d(&codec::header_bytes(self))
    }
}

/// A complete block: header plus transactions.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    /// Ordered list of transactions. `transactions[0]` must be coinbase.
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// The coinbase transaction, if the block is non-empty.
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }

    /// Serialized size in bytes of the canonical encoding.
    pub fn size(&self) -> usize {
        codec::block_bytes(self).len()
    }
}

/// An entry in the unspent transaction output set.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct UtxoEntry {
    /// The unspent output.
    pub output: TxOutput,
    /// Height of the block that created this UTXO.
    pub height: u64,
    /// Whether this output is from a coinbase transaction.
    pub is_coinbase: bool,
}

impl UtxoEntry {
    /// Check if this UTXO is spendable at `spend_height`.
    ///
    /// Coinbase outputs require [`COINBASE_MATURITY`] confirmations; a
    /// coinbase created at height `h` is spendable from `h + 100` exactly.
    pub fn is_mature(&self, spend_height: u64) -> bool {
        if !self.is_coinbase {
            return true;
        }
        spend_height.saturating_sub(self.height) >= COINBASE_MATURITY
    }
}
