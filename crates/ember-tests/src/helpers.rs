//! Shared helpers for end-to-end and adversarial tests.

use ember_consensus::checkpoint::CheckpointSet;
use ember_consensus::engine::mine_block;
use ember_core::address::{Address, Network};
use ember_core::constants::{COINBASE_MATURITY, TARGET_BLOCK_TIME};
use ember_core::crypto::{self, KeyPair};
use ember_core::genesis;
use ember_core::types::{Block, Hash256, OutPoint, Transaction, TxInput, TxOutput};
use ember_node::{BlockOutcome, Node, NodeConfig, RocksStore};

/// A fixed "now" far enough past genesis that test chains never trip the
/// future-drift bound while their timestamps creep above the median.
pub fn test_now() -> u64 {
    genesis::GENESIS_TIMESTAMP + 100_000 * TARGET_BLOCK_TIME
}

/// Simple address from a seed byte.
pub fn addr(seed: u8) -> Address {
    Address::new(Network::Mainnet, Hash256([seed; 32]))
}

/// Boot a node over a temp directory with a fixed clock and no checkpoints.
///
/// Honors `RUST_LOG` so failing runs can be replayed with tracing output.
pub fn test_node() -> (Node, tempfile::TempDir) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let dir = tempfile::tempdir().unwrap();
    let store = RocksStore::open(dir.path().join("chaindata")).unwrap();
    let node = Node::with_clock(
        store,
        CheckpointSet::compiled_in(),
        NodeConfig::default(),
        test_now,
    );
    (node, dir)
}

/// Mine the next block on the node's tip, paying `miner`.
pub fn mine_next(node: &Node, miner: &Address) -> Block {
    let mut block = node.get_block_template(miner).unwrap();
    assert!(mine_block(&mut block, u64::MAX));
    block
}

/// Mine and submit `count` blocks paying `miner`, asserting each applies.
pub fn advance(node: &Node, count: u64, miner: &Address) {
    for _ in 0..count {
        let block = mine_next(node, miner);
        let outcome = node.submit_block(block).unwrap();
        assert!(
            matches!(outcome, BlockOutcome::Applied { .. }),
            "expected Applied, got {outcome:?}"
        );
    }
}

/// Mine a block paying `keypair`, then bury it to coinbase maturity.
///
/// Returns the outpoint of the matured coinbase output and its value.
pub fn fund_and_mature(node: &Node, keypair: &KeyPair) -> (OutPoint, u64) {
    let funding = mine_next(node, &keypair.address(Network::Mainnet));
    let coinbase = &funding.transactions[0];
    let outpoint = OutPoint::new(coinbase.txid(), 0);
    let value = coinbase.outputs[0].value;
    assert!(matches!(
        node.submit_block(funding.clone()).unwrap(),
        BlockOutcome::Applied { .. }
    ));
    advance(node, COINBASE_MATURITY, &addr(0xEE));
    (outpoint, value)
}

/// Build and sign a single-input transaction spending `outpoint`.
pub fn make_signed_spend(
    keypair: &KeyPair,
    outpoint: OutPoint,
    prev_value: u64,
    outputs: Vec<(u64, Address)>,
    replaceable: bool,
) -> Transaction {
    let mut tx = Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: outpoint,
            signature: vec![],
            public_key: vec![],
        }],
        outputs: outputs
            .into_iter()
            .map(|(value, recipient)| TxOutput { value, recipient })
            .collect(),
        lock_time: 0,
        nonce: 0,
        replaceable,
    };
    crypto::sign_input(&mut tx, 0, prev_value, keypair).unwrap();
    tx
}
