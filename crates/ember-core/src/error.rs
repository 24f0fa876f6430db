//! Error types for the Ember protocol.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of input at offset {0}")] UnexpectedEof(usize),
    #[error("trailing bytes after decode: {0}")] TrailingBytes(usize),
    #[error("length prefix {len} exceeds remaining {remaining}")] LengthOutOfBounds { len: usize, remaining: usize },
    #[error("collection count {count} exceeds limit {max}")] CountOutOfBounds { count: usize, max: usize },
    #[error("invalid boolean byte: {0:#04x}")] InvalidBool(u8),
    #[error("unknown network byte: {0:#04x}")] UnknownNetwork(u8),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid public key bytes")] InvalidPublicKey,
    #[error("invalid signature bytes")] InvalidSignature,
    #[error("non-canonical signature (high-S)")] NonCanonicalSignature,
    #[error("signature verification failed")] VerificationFailed,
    #[error("public key does not hash to the recipient address")] AddressMismatch,
    #[error("address network {got:?} does not match {expected:?}")] WrongNetwork { got: u8, expected: u8 },
    #[error("input index out of bounds: {index} >= {len}")] InputIndexOutOfBounds { index: usize, len: usize },
    #[error("invalid secret key bytes")] InvalidSecretKey,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid base58: {0}")] InvalidBase58(String),
    #[error("invalid payload length: {0}")] InvalidLength(usize),
    #[error("checksum mismatch")] InvalidChecksum,
    #[error("unknown network byte: {0:#04x}")] UnknownNetwork(u8),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    #[error("malformed transaction: {0}")] Malformed(String),
    #[error("non-canonical encoding: {0}")] NonCanonical(#[from] CodecError),
    #[error("oversized: {size} > {max}")] Oversized { size: usize, max: usize },
    #[error("value out of range at output {0}")] ValueOutOfRange(usize),
    #[error("zero-value output at index {0}")] ZeroValueOutput(usize),
    #[error("value overflow")] ValueOverflow,
    #[error("duplicate input: {0}")] DuplicateInput(String),
    #[error("missing input: {0}")] MissingInput(String),
    #[error("bad signature on input {index}")] BadSignature { index: usize },
    #[error("immature coinbase spent by input {index}")] ImmatureCoinbase { index: usize },
    #[error("insufficient funds: have {have}, need {need}")] InsufficientFunds { have: u64, need: u64 },
    #[error("invalid coinbase: {0}")] BadCoinbase(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("malformed header: {0}")] MalformedHeader(String),
    #[error("merkle root does not match transactions")] BadMerkle,
    #[error("insufficient proof of work")] PowInsufficient,
    #[error("bad timestamp: {0}")] BadTimestamp(String),
    #[error("bad difficulty: got {got:#010x}, expected {expected:#010x}")] BadDifficulty { got: u32, expected: u32 },
    #[error("unknown parent: {0}")] UnknownParent(String),
    #[error("block has no coinbase")] CoinbaseMissing,
    #[error("unexpected coinbase at index {0}")] CoinbaseMisplaced(usize),
    #[error("wrong height: got {got}, expected {expected}")] WrongHeight { got: u64, expected: u64 },
    #[error("double spend of {0}")] DoubleSpend(String),
    #[error("invalid coinbase: claimed {got}, allowed {allowed}")] BadCoinbase { got: u64, allowed: u64 },
    #[error("duplicate txid: {0}")] DuplicateTxid(String),
    #[error("oversized: {size} > {max}")] OversizedBlock { size: usize, max: usize },
    #[error("duplicate block: {0}")] Duplicate(String),
    #[error("reorg depth {depth} exceeds limit {max}")] ReorgTooDeep { depth: u64, max: u64 },
    #[error("reorg would cross checkpoint at height {0}")] CheckpointViolation(u64),
    #[error("branch previously marked invalid: {0}")] KnownInvalid(String),
    #[error("validation cancelled")] Cancelled,
    #[error("tx error at index {index}: {source}")] Tx { index: usize, source: TxError },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("fee {fee} below minimum {minimum}")] FeeBelowMinimum { fee: u64, minimum: u64 },
    #[error("mempool full")] MempoolFull,
    #[error("replace-by-fee rejected: {0}")] RbfRejected(String),
    #[error("transaction already in pool: {0}")] AlreadyKnown(String),
    #[error("conflicts with pool tx {existing} on outpoint {outpoint}")] Conflict { existing: String, outpoint: String },
    #[error("nonce {nonce} already used by sender {sender}")] NonceReplayed { sender: String, nonce: u64 },
    #[error("transaction is not yet final (lock_time {0})")] NotYetFinal(u64),
    #[error("transaction rejected: {0}")] InvalidTx(#[from] TxError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainStateError {
    #[error("empty chain: no blocks connected")] EmptyChain,
    #[error("block not found: {0}")] BlockNotFound(String),
    #[error("delta missing for block: {0}")] MissingDelta(String),
    #[error("height mismatch: expected {expected}, got {got}")] HeightMismatch { expected: u64, got: u64 },
    #[error("duplicate block: {0}")] DuplicateBlock(String),
    #[error("missing utxo: {0}")] MissingUtxo(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store corrupt at key {key}: {detail}")] Corrupt { key: String, detail: String },
    #[error("io: {0}")] Io(String),
    #[error("not found: {0}")] NotFound(String),
}

#[derive(Error, Debug)]
pub enum EmberError {
    #[error(transparent)] Codec(#[from] CodecError),
    #[error(transparent)] Crypto(#[from] CryptoError),
    #[error(transparent)] Address(#[from] AddressError),
    #[error(transparent)] Tx(#[from] TxError),
    #[error(transparent)] Block(#[from] BlockError),
    #[error(transparent)] Mempool(#[from] MempoolError),
    #[error(transparent)] ChainState(#[from] ChainStateError),
    #[error(transparent)] Store(#[from] StoreError),
}
