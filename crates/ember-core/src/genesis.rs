//! The compiled-in genesis block.
//!
//! Genesis is deterministic: a fixed timestamp, the genesis difficulty, and
//! a single coinbase paying the initial subsidy to an address with no known
//! key (the premine is unspendable). The proof-of-work nonce is searched on
//! first use and memoized; at the genesis target this takes a handful of
//! attempts.

use std::sync::OnceLock;

use crate::address::{Address, Network};
use crate::constants::INITIAL_REWARD;
use crate::merkle;
use crate::pow::{self, GENESIS_BITS};
use crate::types::{sha256, Block, BlockHeader, Hash256, Transaction, TxOutput};

/// Unix timestamp of the genesis block: 2024-01-01T00:00:00Z.
pub const GENESIS_TIMESTAMP: u64 = 1_704_067_200;

static GENESIS: OnceLock<Block> = OnceLock::new();

/// The address paid by the genesis coinbase. No private key hashes to it.
pub fn genesis_address() -> Address {
    Address::new(Network::Mainnet, sha256(b"ember genesis 2024"))
}

fn build_genesis() -> Block {
    let coinbase = Transaction {
        version: 1,
        inputs: vec![],
        outputs: vec![TxOutput {
            value: INITIAL_REWARD,
            recipient: genesis_address(),
        }],
        lock_time: 0,
        nonce: 0,
        replaceable: false,
    };
    let merkle_root = merkle::merkle_root(&[coinbase.txid()]);

    let mut header = BlockHeader {
        version: 1,
        prev_hash: Hash256::ZERO,
        merkle_root,
        timestamp: GENESIS_TIMESTAMP,
        bits: GENESIS_BITS,
        nonce: 0,
        height: 0,
    };
    while pow::check_pow(&header).is_err() {
        header.nonce += 1;
    }

    Block {
        header,
        transactions: vec![coinbase],
    }
}

/// The genesis block.
pub fn genesis_block() -> &'static Block {
    GENESIS.get_or_init(build_genesis)
}

/// The genesis block's header hash.
pub fn genesis_hash() -> Hash256 {
    genesis_block().hash()
}

/// The txid of the genesis coinbase.
pub fn genesis_coinbase_txid() -> Hash256 {
    genesis_block().transactions[0].txid()
}
