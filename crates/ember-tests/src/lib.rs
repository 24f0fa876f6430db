//! Integration test suite for the Ember consensus core.
//!
//! The `tests/` directory exercises the full coordinator — chain extension,
//! mempool policy, reorgs, checkpoints, and adversarial inputs — against the
//! RocksDB-backed store.

pub mod helpers;
