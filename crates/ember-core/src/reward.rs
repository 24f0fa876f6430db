//! Block subsidy schedule and halving logic.
//!
//! The base subsidy starts at [`INITIAL_REWARD`] (50 EMBER) and halves every
//! [`HALVING_INTERVAL`] (210,000) blocks, reaching zero after 33 epochs.
//! A block's coinbase may claim at most the subsidy for its height plus the
//! fees of the transactions it includes.

use crate::constants::{HALVING_INTERVAL, INITIAL_REWARD};

/// The base subsidy (in embers) for a block at `height`.
///
/// `INITIAL_REWARD >> (height / HALVING_INTERVAL)`, clamped to zero. The
/// epoch guard avoids shift overflow for absurd heights.
pub fn block_subsidy(height: u64) -> u64 {
    epoch_subsidy(halving_epoch(height))
}

/// The subsidy for a given halving epoch.
pub fn epoch_subsidy(epoch: u64) -> u64 {
    if epoch >= 64 {
        return 0;
    }
    INITIAL_REWARD >> epoch
}

/// Which halving epoch a block height falls in.
pub fn halving_epoch(height: u64) -> u64 {
    height / HALVING_INTERVAL
}

/// Total subsidy issued from genesis through `height`, inclusive.
pub fn cumulative_subsidy(height: u64) -> u64 {
    let final_epoch = halving_epoch(height);
    let mut total: u64 = 0;
    for epoch in 0..=final_epoch {
        let subsidy = epoch_subsidy(epoch);
        if subsidy == 0 {
            break;
        }
        let start = epoch * HALVING_INTERVAL;
        let end = if epoch == final_epoch {
            height
        } else {
            (epoch + 1) * HALVING_INTERVAL - 1
        };
        total = total.saturating_add(subsidy.saturating_mul(end - start + 1));
    }
    total
}
