//! Difficulty retargeting and median-time-past.
//!
//! The target adjusts once every [`RETARGET_INTERVAL`] blocks. A retarget
//! compares the actual time the previous window took against
//! `RETARGET_INTERVAL * TARGET_BLOCK_TIME` and scales the target
//! proportionally, with the observed time clamped to within a factor of
//! [`MAX_ADJUSTMENT_FACTOR`] of the expectation so timestamp games cannot
//! swing difficulty by more than 4x per window. Between retarget heights the
//! `bits` field must repeat the parent's value exactly.
//!
//! The genesis target is the difficulty floor: no retarget may produce an
//! easier target than genesis.

use crate::constants::{MAX_ADJUSTMENT_FACTOR, MTP_WINDOW, RETARGET_INTERVAL, TARGET_BLOCK_TIME};
use crate::pow::{self, U256};

/// Whether the block at `height` starts a new difficulty window.
pub fn is_retarget_height(height: u64) -> bool {
    height != 0 && height % RETARGET_INTERVAL == 0
}

/// Expected total time for one retarget window, in seconds.
pub const fn expected_window_time() -> u64 {
    RETARGET_INTERVAL * TARGET_BLOCK_TIME
}

/// Compute the bits for a retarget-height block.
///
/// `window_first_ts` is the timestamp of the first block in the closing
/// window (height `H - RETARGET_INTERVAL` where `H` is the retarget height)
/// and `window_last_ts` the parent's timestamp. The new target is
/// `old_target * clamped_actual / expected`, floored at the genesis target
/// and round-tripped through the compact encoding.
pub fn retarget(parent_bits: u32, window_first_ts: u64, window_last_ts: u64) -> u32 {
    let old_target = pow::compact_to_target(parent_bits).unwrap_or_else(pow::genesis_target);
    let expected = expected_window_time();

    let actual = window_last_ts
        .saturating_sub(window_first_ts)
        .clamp(expected / MAX_ADJUSTMENT_FACTOR, expected * MAX_ADJUSTMENT_FACTOR);

    let (scaled, overflow) = old_target.overflowing_mul(U256::from(actual));
    let mut new_target = if overflow {
        // Only reachable when the target is already near the floor and the
        // window ran slow; the floor clamp below takes over.
        pow::genesis_target()
    } else {
        scaled / U256::from(expected)
    };

    if new_target > pow::genesis_target() {
        new_target = pow::genesis_target();
    }
    if new_target.is_zero() {
        new_target = U256::one();
    }

    pow::target_to_compact(new_target)
}

/// The bits consensus expects for a block at `height`.
///
/// `parent_bits` belongs to the block at `height - 1`; `window_first_ts` and
/// `window_last_ts` are only consulted at retarget heights.
pub fn expected_bits(
    height: u64,
    parent_bits: u32,
    window_first_ts: u64,
    window_last_ts: u64,
) -> u32 {
    if height == 0 {
        return pow::GENESIS_BITS;
    }
    if is_retarget_height(height) {
        retarget(parent_bits, window_first_ts, window_last_ts)
    } else {
        parent_bits
    }
}

/// Median of up to [`MTP_WINDOW`] ancestor timestamps.
///
/// A new block's timestamp must be strictly greater than this value.
/// Returns 0 for an empty slice (genesis has no ancestors).
pub fn median_time_past(timestamps: &[u64]) -> u64 {
    if timestamps.is_empty() {
        return 0;
    }
    let mut sorted: Vec<u64> = timestamps.iter().copied().take(MTP_WINDOW).collect();
    sorted.sort_unstable();
    sorted[sorted.len() / 2]
}
