//! Checkpoint finality.
//!
//! A checkpoint pins a `(height, hash)` pair as irreversible: no reorg may
//! revert a block at or below the highest checkpoint height. Checkpoints
//! constrain fork choice only — they never substitute for proof-of-work
//! validation.
//!
//! The baseline list is compiled into the binary; operators may adopt
//! additional checkpoints (strictly increasing heights) or load them from a
//! human-readable `checkpoints.json`.

use serde::{Deserialize, Serialize};

use ember_core::error::BlockError;
use ember_core::types::Hash256;

/// Checkpoints shipped with this release. Heights strictly increasing.
pub const COMPILED_IN: &[(u64, [u8; 32])] = &[];

/// A single pinned block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub height: u64,
    pub hash: Hash256,
}

/// JSON wire form: the hash as a hex string.
#[derive(Serialize, Deserialize)]
struct CheckpointJson {
    height: u64,
    hash: String,
}

/// An ordered set of checkpoints with strictly increasing heights.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckpointSet {
    entries: Vec<Checkpoint>,
}

impl CheckpointSet {
    /// The checkpoints compiled into this release.
    pub fn compiled_in() -> Self {
        let entries = COMPILED_IN
            .iter()
            .map(|&(height, hash)| Checkpoint {
                height,
                hash: Hash256(hash),
            })
            .collect();
        Self { entries }
    }

    /// Build a set from entries, enforcing strictly increasing heights.
    pub fn from_entries(entries: Vec<Checkpoint>) -> Result<Self, BlockError> {
        for pair in entries.windows(2) {
            if pair[1].height <= pair[0].height {
                return Err(BlockError::MalformedHeader(format!(
                    "checkpoint heights not strictly increasing at {}",
                    pair[1].height
                )));
            }
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Checkpoint] {
        &self.entries
    }

    /// Height of the most recent checkpoint, or 0 if there are none.
    pub fn last_height(&self) -> u64 {
        self.entries.last().map(|cp| cp.height).unwrap_or(0)
    }

    /// Adopt a new checkpoint. Its height must exceed the current last.
    pub fn adopt(&mut self, checkpoint: Checkpoint) -> Result<(), BlockError> {
        if !self.entries.is_empty() && checkpoint.height <= self.last_height() {
            return Err(BlockError::MalformedHeader(format!(
                "checkpoint height {} not above last {}",
                checkpoint.height,
                self.last_height()
            )));
        }
        self.entries.push(checkpoint);
        Ok(())
    }

    /// Verify a block hash against the checkpoint at its height, if any.
    pub fn check(&self, height: u64, hash: &Hash256) -> Result<(), BlockError> {
        match self.entries.iter().find(|cp| cp.height == height) {
            Some(cp) if cp.hash != *hash => Err(BlockError::CheckpointViolation(height)),
            _ => Ok(()),
        }
    }

    /// Whether a reorg whose lowest common ancestor sits at `lca_height`
    /// would revert a checkpointed block.
    pub fn forbids_reorg_below(&self, lca_height: u64) -> bool {
        let last = self.last_height();
        !self.entries.is_empty() && lca_height < last
    }

    /// Parse a `checkpoints.json` document: an ordered list of
    /// `{ "height": .., "hash": "<64 hex chars>" }`.
    pub fn from_json(data: &str) -> Result<Self, BlockError> {
        let raw: Vec<CheckpointJson> = serde_json::from_str(data)
            .map_err(|e| BlockError::MalformedHeader(format!("checkpoints.json: {e}")))?;
        let mut entries = Vec::with_capacity(raw.len());
        for item in raw {
            let bytes = hex::decode(&item.hash)
                .map_err(|e| BlockError::MalformedHeader(format!("checkpoint hash: {e}")))?;
            let hash: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                BlockError::MalformedHeader("checkpoint hash must be 32 bytes".into())
            })?;
            entries.push(Checkpoint {
                height: item.height,
                hash: Hash256(hash),
            });
        }
        Self::from_entries(entries)
    }

    /// Render the set as a `checkpoints.json` document.
    pub fn to_json(&self) -> String {
        let raw: Vec<CheckpointJson> = self
            .entries
            .iter()
            .map(|cp| CheckpointJson {
                height: cp.height,
                hash: cp.hash.to_string(),
            })
            .collect();
        serde_json::to_string_pretty(&raw).expect("checkpoint serialization cannot fail")
    }
}
