//! Protocol constants. All monetary values in embers (1 EMBER = 10^8 embers).

pub const COIN: u64 = 100_000_000;

/// Hard cap on any single amount and on the total money supply.
pub const MAX_MONEY: u64 = 21_000_000 * COIN;

pub const INITIAL_REWARD: u64 = 50 * COIN;
pub const HALVING_INTERVAL: u64 = 210_000;

/// Target spacing between blocks, in seconds.
pub const TARGET_BLOCK_TIME: u64 = 600;
/// Difficulty retargets every this many blocks.
pub const RETARGET_INTERVAL: u64 = 2016;
/// Per-retarget adjustment is clamped to this factor in either direction.
pub const MAX_ADJUSTMENT_FACTOR: u64 = 4;

/// Number of ancestor timestamps used for the median-time-past check.
pub const MTP_WINDOW: usize = 11;
/// Maximum allowed drift of a block timestamp past local time, in seconds.
pub const MAX_FUTURE_DRIFT: u64 = 2 * 60 * 60;

pub const MAX_BLOCK_SIZE: usize = 1_048_576;
pub const MAX_TX_SIZE: usize = 100_000;
pub const MAX_INPUTS: usize = 1_000;
pub const MAX_OUTPUTS: usize = 1_000;

/// Coinbase outputs are spendable only after this many confirmations.
/// This is a consensus rule, not mempool policy.
pub const COINBASE_MATURITY: u64 = 100;

/// Minimum relay fee rate in milli-embers per byte (1 ember/byte).
pub const MIN_RELAY_FEE_RATE: u64 = 1_000;

pub const MEMPOOL_MAX_COUNT: usize = 5_000;
pub const MEMPOOL_MAX_BYTES: usize = 5 * 1024 * 1024;
pub const MEMPOOL_EXPIRY_SECS: u64 = 86_400;

/// `lock_time` values below this are block heights, at or above are unix seconds.
pub const LOCKTIME_THRESHOLD: u64 = 500_000_000;

pub const MAX_ORPHAN_BLOCKS: usize = 100;
pub const MAX_ORPHAN_AGE_SECS: u64 = 600;
/// Upper bound on orphans linked per parent arrival, to bound work per trigger.
pub const ORPHAN_WORK_BUDGET: usize = 32;

/// Reorgs deeper than this are refused regardless of cumulative work.
pub const MAX_REORG_DEPTH: u64 = 100;

/// Concurrent submissions above this return `Busy`.
pub const SUBMIT_QUEUE_MAX: usize = 256;
