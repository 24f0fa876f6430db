//! Proof-of-work targets and chain work.
//!
//! The header's `bits` field is the Bitcoin-style compact encoding of a
//! 256-bit target: one exponent byte and three mantissa bytes. A header
//! satisfies proof-of-work when its double-SHA-256 hash, read as a
//! big-endian 256-bit integer, is at most the decoded target.
//!
//! Per-block work is `2^256 / (target + 1)`, computed as
//! `(!target / (target + 1)) + 1` to stay within 256 bits. Cumulative work
//! along an ancestry is the fork-choice metric.

use uint::construct_uint;

use crate::error::BlockError;
use crate::types::{BlockHeader, Hash256};

construct_uint! {
    /// Unsigned 256-bit integer (4 × 64-bit words).
    pub struct U256(4);
}

/// Compact bits of the genesis target (mantissa 0x7fffff, exponent 0x20).
///
/// This is also the minimum-difficulty floor: no retarget may produce an
/// easier target.
pub const GENESIS_BITS: u32 = 0x207f_ffff;

/// Decode a compact `bits` value into a 256-bit target.
///
/// Returns `None` for negative encodings (sign bit set with a non-zero
/// mantissa) and for encodings that overflow 256 bits.
pub fn compact_to_target(bits: u32) -> Option<U256> {
    let exponent = (bits >> 24) as usize;
    let mantissa = bits & 0x007f_ffff;
    if bits & 0x0080_0000 != 0 && mantissa != 0 {
        return None;
    }
    if mantissa == 0 {
        return Some(U256::zero());
    }
    // Overflow when the mantissa's significant bytes would shift past bit 256.
    let overflow = exponent > 34
        || (mantissa > 0xff && exponent > 33)
        || (mantissa > 0xffff && exponent > 32);
    if overflow {
        return None;
    }
    if exponent <= 3 {
        Some(U256::from(mantissa >> (8 * (3 - exponent))))
    } else {
        Some(U256::from(mantissa) << (8 * (exponent - 3)))
    }
}

/// Encode a 256-bit target into compact `bits` form.
///
/// Inverse of [`compact_to_target`] up to mantissa truncation (the compact
/// form keeps only the top three bytes of precision).
pub fn target_to_compact(target: U256) -> u32 {
    if target.is_zero() {
        return 0;
    }
    let mut size = (target.bits() + 7) / 8;
    let mut compact: u64 = if size <= 3 {
        target.low_u64() << (8 * (3 - size))
    } else {
        (target >> (8 * (size - 3))).low_u64()
    };
    // Avoid the sign bit: shift the mantissa down and bump the exponent.
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    (compact as u32 & 0x007f_ffff) | ((size as u32) << 24)
}

/// Interpret a hash as a big-endian 256-bit integer.
pub fn hash_to_u256(hash: &Hash256) -> U256 {
    U256::from_big_endian(hash.as_bytes())
}

/// Write a 256-bit integer as 32 big-endian bytes.
pub fn u256_to_bytes(value: U256) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    for (i, word) in value.0.iter().enumerate() {
        // Words are little-endian; lay them out most-significant first.
        bytes[32 - 8 * (i + 1)..32 - 8 * i].copy_from_slice(&word.to_be_bytes());
    }
    bytes
}

/// Read a 256-bit integer from 32 big-endian bytes.
pub fn u256_from_bytes(bytes: &[u8; 32]) -> U256 {
    U256::from_big_endian(bytes)
}

/// Per-block work contributed by a header with the given `bits`.
///
/// `work = 2^256 / (target + 1)`, so harder (smaller) targets contribute
/// more work. Invalid `bits` contribute zero.
pub fn block_work(bits: u32) -> U256 {
    let Some(target) = compact_to_target(bits) else {
        return U256::zero();
    };
    if target.is_zero() {
        // No hash satisfies a zero target; treat it as the maximum.
        return U256::MAX;
    }
    if target == U256::MAX {
        return U256::one();
    }
    (!target / (target + U256::one())) + U256::one()
}

/// Check that a header's hash satisfies its own claimed difficulty.
///
/// This is the stateless half of difficulty validation; whether `bits`
/// itself is the value consensus expects at this height is checked
/// contextually.
pub fn check_pow(header: &BlockHeader) -> Result<(), BlockError> {
    let target = compact_to_target(header.bits).ok_or_else(|| {
        BlockError::MalformedHeader(format!("invalid compact bits {:#010x}", header.bits))
    })?;
    if hash_to_u256(&header.hash()) <= target {
        Ok(())
    } else {
        Err(BlockError::PowInsufficient)
    }
}

/// The genesis target decoded from [`GENESIS_BITS`].
pub fn genesis_target() -> U256 {
    compact_to_target(GENESIS_BITS).expect("genesis bits are a valid compact encoding")
}
