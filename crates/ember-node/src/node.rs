//! The consensus coordinator.
//!
//! [`Node`] is the single serialization point for state changes: block and
//! transaction submission, fork tracking, reorgs, orphan management, mempool
//! reconciliation, and event emission. A single writer gate serializes every
//! mutation; readers take short read locks on the store and never contend
//! with each other.
//!
//! Locking discipline: the writer gate is acquired first and held for the
//! whole mutation (stateful validation included). Individual store
//! operations then take the storage `RwLock` briefly — writes for
//! connect/disconnect batches, reads for validation lookups — so `get_*`
//! readers are never blocked for the duration of a full validation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use ember_consensus::checkpoint::{Checkpoint, CheckpointSet};
use ember_consensus::engine::ConsensusEngine;
use ember_core::address::Address;
use ember_core::block_validation;
use ember_core::cancel::CancelFlag;
use ember_core::constants::{
    MAX_ORPHAN_AGE_SECS, MAX_ORPHAN_BLOCKS, MAX_REORG_DEPTH, ORPHAN_WORK_BUDGET, SUBMIT_QUEUE_MAX,
};
use ember_core::error::{BlockError, EmberError, MempoolError, StoreError, TxError};
use ember_core::mempool::{Mempool, MempoolConfig, TxSummary};
use ember_core::pow::{self, U256};
use ember_core::traits::{BlockProducer, ChainState};
use ember_core::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, UtxoEntry};
use ember_core::validation;

use crate::events::{ChainEvent, EvictReason};
use crate::storage::RocksStore;

/// Coordinator-level errors. Consensus and policy rejections are reported in
/// outcomes, not here; these are the retryable/system conditions.
#[derive(thiserror::Error, Debug)]
pub enum NodeError {
    #[error("submission queue full")]
    Busy,
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Chain(#[from] EmberError),
}

/// Result of submitting a block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Extended the active chain.
    Applied { hash: Hash256, height: u64 },
    /// Stored on a side branch with less cumulative work than the tip.
    SideBranch { hash: Hash256 },
    /// Parent unknown; held in the orphan pool.
    Orphan { hash: Hash256 },
    /// Triggered a chain reorganization onto the block's branch.
    Reorg {
        old_tip: Hash256,
        new_tip: Hash256,
        depth: u64,
    },
    Rejected { hash: Hash256, reason: BlockError },
}

/// Result of submitting a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxOutcome {
    Admitted {
        txid: Hash256,
    },
    /// Admitted by replacing conflicting pool transactions.
    Replaced {
        old_txids: Vec<Hash256>,
        new_txid: Hash256,
    },
    Rejected {
        txid: Hash256,
        reason: MempoolError,
    },
}

/// A consistent view of the active tip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TipInfo {
    pub hash: Hash256,
    pub height: u64,
    pub cumulative_work: U256,
    pub timestamp: u64,
}

/// Coordinator tuning parameters.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub mempool: MempoolConfig,
    /// Event broadcast buffer; slow subscribers past this observe `Lagged`.
    pub event_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            mempool: MempoolConfig::default(),
            event_capacity: 1024,
        }
    }
}

/// Orphan blocks keyed by their missing parent, bounded by count and age.
struct OrphanPool {
    by_parent: HashMap<Hash256, Vec<(Block, Instant)>>,
    hashes: HashSet<Hash256>,
}

impl OrphanPool {
    fn new() -> Self {
        Self {
            by_parent: HashMap::new(),
            hashes: HashSet::new(),
        }
    }

    fn len(&self) -> usize {
        self.hashes.len()
    }

    fn prune_expired(&mut self, now: Instant) {
        self.by_parent.retain(|_, entries| {
            entries.retain(|(block, stored_at)| {
                let keep = now.duration_since(*stored_at).as_secs() < MAX_ORPHAN_AGE_SECS;
                if !keep {
                    self.hashes.remove(&block.hash());
                }
                keep
            });
            !entries.is_empty()
        });
    }

    /// Insert an orphan, evicting the oldest entry when at capacity.
    fn insert(&mut self, block: Block, now: Instant) {
        self.prune_expired(now);
        let hash = block.hash();
        if self.hashes.contains(&hash) {
            return;
        }
        while self.len() >= MAX_ORPHAN_BLOCKS {
            let oldest = self
                .by_parent
                .iter()
                .filter_map(|(parent, entries)| {
                    entries
                        .iter()
                        .map(|(b, at)| (*parent, b.hash(), *at))
                        .min_by_key(|(_, _, at)| *at)
                })
                .min_by_key(|(_, _, at)| *at);
            let Some((parent, victim, _)) = oldest else {
                break;
            };
            if let Some(entries) = self.by_parent.get_mut(&parent) {
                entries.retain(|(b, _)| b.hash() != victim);
                if entries.is_empty() {
                    self.by_parent.remove(&parent);
                }
            }
            self.hashes.remove(&victim);
        }
        self.hashes.insert(hash);
        self.by_parent
            .entry(block.header.prev_hash)
            .or_default()
            .push((block, now));
    }

    /// Remove and return all orphans waiting on `parent`.
    fn take_children(&mut self, parent: &Hash256) -> Vec<Block> {
        let Some(entries) = self.by_parent.remove(parent) else {
            return Vec::new();
        };
        entries
            .into_iter()
            .map(|(block, _)| {
                self.hashes.remove(&block.hash());
                block
            })
            .collect()
    }
}

/// Read-only [`ChainState`] adapter over the shared store.
///
/// Store corruption surfaced on a read path raises the coordinator's poison
/// flag; the coordinator refuses further block acceptance until an operator
/// intervenes.
pub struct NodeChainState {
    storage: Arc<RwLock<RocksStore>>,
    poisoned: Arc<AtomicBool>,
    corrupt_key: Arc<Mutex<Option<String>>>,
    events: broadcast::Sender<ChainEvent>,
}

impl NodeChainState {
    fn note_error(&self, error: &StoreError) {
        if let StoreError::Corrupt { key, .. } = error {
            warn!(%key, "store corruption detected on read");
            if !self.poisoned.swap(true, Ordering::SeqCst) {
                *self.corrupt_key.lock() = Some(key.clone());
                let _ = self.events.send(ChainEvent::CorruptionDetected { key: key.clone() });
            }
        }
    }

    fn read<T>(&self, op: impl FnOnce(&RocksStore) -> Result<T, StoreError>) -> Option<T> {
        match op(&self.storage.read()) {
            Ok(value) => Some(value),
            Err(e) => {
                self.note_error(&e);
                None
            }
        }
    }
}

impl ChainState for NodeChainState {
    fn get_utxo(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        self.read(|s| s.get_utxo(outpoint)).flatten()
    }

    fn chain_tip(&self) -> (u64, Hash256) {
        self.read(|s| s.chain_tip()).unwrap_or((0, Hash256::ZERO))
    }

    fn get_block_header(&self, hash: &Hash256) -> Option<BlockHeader> {
        self.read(|s| s.get_header(hash)).flatten()
    }

    fn get_block(&self, hash: &Hash256) -> Option<Block> {
        self.read(|s| s.get_block(hash)).flatten()
    }

    fn get_block_hash(&self, height: u64) -> Option<Hash256> {
        self.read(|s| s.get_hash_at_height(height)).flatten()
    }
}

/// Decrements the in-flight counter on drop.
struct SubmitPermit<'a>(&'a AtomicUsize);

impl Drop for SubmitPermit<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A consistent read snapshot: holds the store read lock, so every lookup
/// made through it observes the same committed state.
pub struct ChainSnapshot<'a> {
    guard: RwLockReadGuard<'a, RocksStore>,
}

impl ChainSnapshot<'_> {
    pub fn tip(&self) -> Result<TipInfo, StoreError> {
        let (height, hash) = self.guard.chain_tip()?;
        let timestamp = self
            .guard
            .get_header(&hash)?
            .map(|h| h.timestamp)
            .unwrap_or_default();
        Ok(TipInfo {
            hash,
            height,
            cumulative_work: self.guard.tip_work()?,
            timestamp,
        })
    }

    pub fn header(&self, hash: &Hash256) -> Result<Option<BlockHeader>, StoreError> {
        self.guard.get_header(hash)
    }

    pub fn block(&self, hash: &Hash256) -> Result<Option<Block>, StoreError> {
        self.guard.get_block(hash)
    }

    pub fn utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, StoreError> {
        self.guard.get_utxo(outpoint)
    }

    pub fn hash_at_height(&self, height: u64) -> Result<Option<Hash256>, StoreError> {
        self.guard.get_hash_at_height(height)
    }
}

/// The consensus coordinator.
pub struct Node {
    storage: Arc<RwLock<RocksStore>>,
    /// The single writer lock. Every state mutation runs under it.
    write_gate: Mutex<()>,
    mempool: Mutex<Mempool>,
    engine: ConsensusEngine,
    checkpoints: RwLock<CheckpointSet>,
    orphans: Mutex<OrphanPool>,
    /// Blocks that failed stateful validation; never reconsidered.
    invalid: Mutex<HashSet<Hash256>>,
    events: broadcast::Sender<ChainEvent>,
    in_flight: AtomicUsize,
    poisoned: Arc<AtomicBool>,
    corrupt_key: Arc<Mutex<Option<String>>>,
    clock: Arc<dyn Fn() -> u64 + Send + Sync>,
    /// Where adopted checkpoints are persisted, when opened over a data dir.
    checkpoint_path: Option<std::path::PathBuf>,
}

impl Node {
    /// Open a node over a data directory.
    ///
    /// Reads `checkpoints.json` from the directory when present; otherwise
    /// the compiled-in checkpoint list applies.
    pub fn open(data_dir: impl AsRef<Path>, config: NodeConfig) -> Result<Self, EmberError> {
        let data_dir = data_dir.as_ref();
        let store = RocksStore::open(data_dir.join("chaindata"))?;

        let checkpoint_file = data_dir.join("checkpoints.json");
        let checkpoints = if checkpoint_file.exists() {
            let data = std::fs::read_to_string(&checkpoint_file)
                .map_err(|e| EmberError::Store(StoreError::Io(e.to_string())))?;
            CheckpointSet::from_json(&data)?
        } else {
            CheckpointSet::compiled_in()
        };

        let mut node = Self::assemble(store, checkpoints, config, Arc::new(system_time));
        node.checkpoint_path = Some(checkpoint_file);
        Ok(node)
    }

    /// Build a node with an injected clock, for tests.
    pub fn with_clock(
        store: RocksStore,
        checkpoints: CheckpointSet,
        config: NodeConfig,
        clock: impl Fn() -> u64 + Send + Sync + 'static,
    ) -> Self {
        Self::assemble(store, checkpoints, config, Arc::new(clock))
    }

    fn assemble(
        store: RocksStore,
        checkpoints: CheckpointSet,
        config: NodeConfig,
        clock: Arc<dyn Fn() -> u64 + Send + Sync>,
    ) -> Self {
        let storage = Arc::new(RwLock::new(store));
        let (events, _) = broadcast::channel(config.event_capacity);
        let poisoned = Arc::new(AtomicBool::new(false));
        let corrupt_key = Arc::new(Mutex::new(None));

        let chain_state = Arc::new(NodeChainState {
            storage: Arc::clone(&storage),
            poisoned: Arc::clone(&poisoned),
            corrupt_key: Arc::clone(&corrupt_key),
            events: events.clone(),
        });
        let engine_clock = Arc::clone(&clock);
        let engine = ConsensusEngine::with_clock(chain_state, move || engine_clock());

        Self {
            storage,
            write_gate: Mutex::new(()),
            mempool: Mutex::new(Mempool::new(config.mempool)),
            engine,
            checkpoints: RwLock::new(checkpoints),
            orphans: Mutex::new(OrphanPool::new()),
            invalid: Mutex::new(HashSet::new()),
            events,
            in_flight: AtomicUsize::new(0),
            poisoned,
            corrupt_key,
            clock,
            checkpoint_path: None,
        }
    }

    fn now(&self) -> u64 {
        (self.clock)()
    }

    fn emit(&self, event: ChainEvent) {
        let _ = self.events.send(event);
    }

    fn ensure_healthy(&self) -> Result<(), NodeError> {
        if self.poisoned.load(Ordering::SeqCst) {
            let key = self.corrupt_key.lock().clone().unwrap_or_default();
            return Err(NodeError::Store(StoreError::Corrupt {
                key,
                detail: "store corruption; coordinator halted".into(),
            }));
        }
        Ok(())
    }

    fn acquire_permit(&self) -> Result<SubmitPermit<'_>, NodeError> {
        let previous = self.in_flight.fetch_add(1, Ordering::SeqCst);
        if previous >= SUBMIT_QUEUE_MAX {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(NodeError::Busy);
        }
        Ok(SubmitPermit(&self.in_flight))
    }

    fn note_store_error(&self, error: &EmberError) {
        if let EmberError::Store(StoreError::Corrupt { key, .. }) = error {
            warn!(%key, "store corruption during mutation");
            if !self.poisoned.swap(true, Ordering::SeqCst) {
                *self.corrupt_key.lock() = Some(key.clone());
                self.emit(ChainEvent::CorruptionDetected { key: key.clone() });
            }
        }
    }

    // -----------------------------------------------------------------
    // Submission API
    // -----------------------------------------------------------------

    /// Submit a block for validation and acceptance.
    pub fn submit_block(&self, block: Block) -> Result<BlockOutcome, NodeError> {
        self.submit_block_cancellable(block, &CancelFlag::new())
    }

    /// Like [`submit_block`](Self::submit_block), honoring a cancellation
    /// flag during signature-heavy validation. A cancelled submission leaves
    /// all state untouched.
    pub fn submit_block_cancellable(
        &self,
        block: Block,
        cancel: &CancelFlag,
    ) -> Result<BlockOutcome, NodeError> {
        self.ensure_healthy()?;
        let _permit = self.acquire_permit()?;
        let hash = block.hash();

        // Stateless validation runs before the writer gate so concurrent
        // submitters do structural work in parallel.
        if let Err(reason) = block_validation::validate_block_structure(&block) {
            self.emit(ChainEvent::BlockRejected {
                hash,
                reason: reason.clone(),
            });
            return Ok(BlockOutcome::Rejected { hash, reason });
        }

        let _writer = self.write_gate.lock();
        let outcome = self.process_block(block, cancel)?;

        // A newly linked block may be the parent some orphans were waiting
        // for; re-evaluate breadth-first within a bounded work budget.
        if let Some(accepted) = accepted_hash(&outcome) {
            self.link_orphans(accepted, cancel)?;
        }
        Ok(outcome)
    }

    /// Process orphans now linkable under `root`, breadth-first.
    fn link_orphans(&self, root: Hash256, cancel: &CancelFlag) -> Result<(), NodeError> {
        let mut queue: VecDeque<Hash256> = VecDeque::from([root]);
        let mut budget = ORPHAN_WORK_BUDGET;
        while let Some(parent) = queue.pop_front() {
            let children = self.orphans.lock().take_children(&parent);
            for child in children {
                if budget == 0 {
                    // Over budget: put the child back for a later trigger.
                    self.orphans.lock().insert(child, Instant::now());
                    continue;
                }
                budget -= 1;
                let child_hash = child.hash();
                match self.process_block(child, cancel)? {
                    outcome if accepted_hash(&outcome).is_some() => {
                        debug!(hash = %child_hash, "linked orphan");
                        queue.push_back(child_hash);
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Core block path. Caller holds the writer gate and has already done
    /// stateless validation.
    fn process_block(&self, block: Block, cancel: &CancelFlag) -> Result<BlockOutcome, NodeError> {
        let hash = block.hash();

        if self.invalid.lock().contains(&hash) {
            let reason = BlockError::KnownInvalid(hash.to_string());
            return Ok(BlockOutcome::Rejected { hash, reason });
        }
        if self
            .storage
            .read()
            .get_work(&hash)
            .map_err(|e| self.fail_store(e))?
            .is_some()
        {
            let reason = BlockError::Duplicate(hash.to_string());
            return Ok(BlockOutcome::Rejected { hash, reason });
        }
        if let Err(reason) = self.checkpoints.read().check(block.header.height, &hash) {
            self.emit(ChainEvent::BlockRejected {
                hash,
                reason: reason.clone(),
            });
            return Ok(BlockOutcome::Rejected { hash, reason });
        }

        // Parent resolution: unknown parents go to the orphan pool, never a
        // hard reject.
        let parent = self
            .storage
            .read()
            .get_header(&block.header.prev_hash)
            .map_err(|e| self.fail_store(e))?;
        let Some(parent) = parent else {
            debug!(hash = %hash, parent = %block.header.prev_hash, "orphan block");
            self.orphans.lock().insert(block, Instant::now());
            return Ok(BlockOutcome::Orphan { hash });
        };

        if block.header.height != parent.height + 1 {
            let reason = BlockError::WrongHeight {
                got: block.header.height,
                expected: parent.height + 1,
            };
            self.emit(ChainEvent::BlockRejected {
                hash,
                reason: reason.clone(),
            });
            return Ok(BlockOutcome::Rejected { hash, reason });
        }

        let parent_work = self
            .storage
            .read()
            .get_work(&parent.hash())
            .map_err(|e| self.fail_store(e))?
            .ok_or_else(|| {
                NodeError::Store(StoreError::Corrupt {
                    key: parent.hash().to_string(),
                    detail: "header present without work entry".into(),
                })
            })?;
        let work = parent_work + pow::block_work(block.header.bits);
        let (_, tip_hash) = self
            .storage
            .read()
            .chain_tip()
            .map_err(NodeError::Store)?;

        if block.header.prev_hash == tip_hash {
            return self.apply_to_tip(block, cancel);
        }

        // Side branch: a block must pass full stateful validation against
        // its own parent's UTXO view before it is stored or classified —
        // never on the strength of stateless checks alone. Forks too deep
        // to ever activate are refused here, which also bounds the work an
        // attacker can force with cheap self-claimed difficulty.
        let context = match self.engine.context_for_child(&parent) {
            Ok(context) => context,
            Err(reason) => {
                self.emit(ChainEvent::BlockRejected {
                    hash,
                    reason: reason.clone(),
                });
                return Ok(BlockOutcome::Rejected { hash, reason });
            }
        };
        let view = match self.parent_utxo_view(&parent)? {
            Ok(view) => view,
            Err(reason) => {
                // Fork-choice policy, not block validity: no invalid mark.
                self.emit(ChainEvent::BlockRejected {
                    hash,
                    reason: reason.clone(),
                });
                return Ok(BlockOutcome::Rejected { hash, reason });
            }
        };
        let validation = {
            let storage = self.storage.read();
            block_validation::validate_block_with_cancel(
                &block,
                &context,
                |outpoint: &OutPoint| match view.get(outpoint) {
                    Some(slot) => slot.clone(),
                    None => storage.get_utxo(outpoint).ok().flatten(),
                },
                cancel,
            )
        };
        match validation {
            Ok(_) => {}
            Err(BlockError::Cancelled) => return Err(NodeError::Cancelled),
            Err(reason) => {
                self.invalid.lock().insert(hash);
                self.emit(ChainEvent::BlockRejected {
                    hash,
                    reason: reason.clone(),
                });
                return Ok(BlockOutcome::Rejected { hash, reason });
            }
        }

        // Persist the now-validated block and decide whether its branch
        // carries strictly more work than the active chain.
        self.storage
            .write()
            .put_side_block(&block, work)
            .map_err(NodeError::Store)?;

        let tip_work = self.storage.read().tip_work().map_err(NodeError::Store)?;
        if work > tip_work {
            match self.attempt_reorg(hash, cancel)? {
                Ok((old_tip, new_tip, depth)) => Ok(BlockOutcome::Reorg {
                    old_tip,
                    new_tip,
                    depth,
                }),
                Err(reason) => {
                    self.emit(ChainEvent::BlockRejected {
                        hash,
                        reason: reason.clone(),
                    });
                    Ok(BlockOutcome::Rejected { hash, reason })
                }
            }
        } else {
            info!(hash = %hash, height = block.header.height, "stored side-branch block");
            self.emit(ChainEvent::BlockAccepted {
                hash,
                height: block.header.height,
                fork: true,
            });
            Ok(BlockOutcome::SideBranch { hash })
        }
    }

    /// Validate and connect a block extending the active tip.
    fn apply_to_tip(&self, block: Block, cancel: &CancelFlag) -> Result<BlockOutcome, NodeError> {
        let hash = block.hash();
        let height = block.header.height;

        match self.engine.validate_block_with_cancel(&block, cancel) {
            Ok(_) => {}
            Err(BlockError::Cancelled) => return Err(NodeError::Cancelled),
            Err(reason) => {
                self.invalid.lock().insert(hash);
                self.emit(ChainEvent::BlockRejected {
                    hash,
                    reason: reason.clone(),
                });
                return Ok(BlockOutcome::Rejected { hash, reason });
            }
        }

        self.storage
            .write()
            .connect_block(&block, height)
            .map_err(|e| self.fail_chain(e))?;

        // Mempool reconciliation precedes the tip event so subscribers see
        // evictions before (or with) the advance they belong to.
        let (_, conflicted) = self.mempool.lock().remove_confirmed_block(&block);
        for txid in conflicted {
            self.emit(ChainEvent::TxEvicted {
                txid,
                reason: EvictReason::BlockConflict,
            });
        }

        info!(height, hash = %hash, "block connected");
        self.emit(ChainEvent::BlockAccepted {
            hash,
            height,
            fork: false,
        });
        self.emit(ChainEvent::TipAdvanced {
            new_tip: hash,
            height,
            reorg_depth: 0,
        });
        Ok(BlockOutcome::Applied { hash, height })
    }

    /// Build the UTXO view as of `parent` for validating a child on its
    /// branch.
    ///
    /// Active-chain blocks above the fork point are reverted through their
    /// persisted deltas, then the branch blocks up to `parent` are replayed
    /// on top. The overlay maps touched outpoints to `Some` (live in the
    /// parent view) or `None` (spent or never existed there); untouched
    /// outpoints fall through to the store.
    ///
    /// Returns `Ok(Err(ReorgTooDeep))` when the fork point lies deeper
    /// below the tip than a reorg may ever unwind — such a branch can
    /// never activate, so its blocks are refused instead of stored.
    #[allow(clippy::type_complexity)]
    fn parent_utxo_view(
        &self,
        parent: &BlockHeader,
    ) -> Result<Result<HashMap<OutPoint, Option<UtxoEntry>>, BlockError>, NodeError> {
        let storage = self.storage.read();
        let (tip_height, _) = storage.chain_tip().map_err(NodeError::Store)?;

        // Walk back to the fork point, collecting branch blocks newest-first.
        let mut branch: Vec<Block> = Vec::new();
        let mut cursor = parent.clone();
        let lca_height = loop {
            if storage
                .get_hash_at_height(cursor.height)
                .map_err(NodeError::Store)?
                == Some(cursor.hash())
            {
                break cursor.height;
            }
            let block = storage
                .get_block(&cursor.hash())
                .map_err(NodeError::Store)?
                .ok_or_else(|| NodeError::Store(StoreError::NotFound(cursor.hash().to_string())))?;
            let prev = block.header.prev_hash;
            branch.push(block);
            cursor = storage
                .get_header(&prev)
                .map_err(NodeError::Store)?
                .ok_or_else(|| NodeError::Store(StoreError::NotFound(prev.to_string())))?;
        };

        let fork_depth = tip_height - lca_height;
        if fork_depth > MAX_REORG_DEPTH {
            return Ok(Err(BlockError::ReorgTooDeep {
                depth: fork_depth,
                max: MAX_REORG_DEPTH,
            }));
        }
        branch.reverse();

        let mut overlay: HashMap<OutPoint, Option<UtxoEntry>> = HashMap::new();

        // Revert the active chain down to the fork point, newest first.
        for height in ((lca_height + 1)..=tip_height).rev() {
            let hash = storage
                .get_hash_at_height(height)
                .map_err(NodeError::Store)?
                .ok_or_else(|| {
                    NodeError::Store(StoreError::Corrupt {
                        key: height.to_string(),
                        detail: "height index gap below tip".into(),
                    })
                })?;
            let delta = storage
                .get_delta(&hash)
                .map_err(NodeError::Store)?
                .ok_or_else(|| {
                    NodeError::Store(StoreError::Corrupt {
                        key: hash.to_string(),
                        detail: "connected block has no delta".into(),
                    })
                })?;
            for (outpoint, entry) in &delta.spent {
                overlay.insert(outpoint.clone(), Some(entry.clone()));
            }
            for outpoint in &delta.created {
                overlay.insert(outpoint.clone(), None);
            }
        }

        // Replay the branch up to the parent. Branch blocks were validated
        // statefully when stored, so a missing input here means the store
        // and fork state disagree.
        for block in &branch {
            for tx in &block.transactions {
                for input in &tx.inputs {
                    let present = match overlay.get(&input.previous_output) {
                        Some(slot) => slot.is_some(),
                        None => storage
                            .get_utxo(&input.previous_output)
                            .map_err(NodeError::Store)?
                            .is_some(),
                    };
                    if !present {
                        return Err(NodeError::Store(StoreError::Corrupt {
                            key: block.hash().to_string(),
                            detail: "side branch spends an unknown utxo".into(),
                        }));
                    }
                    overlay.insert(input.previous_output.clone(), None);
                }
                let txid = tx.txid();
                let is_coinbase = tx.is_coinbase();
                for (index, output) in tx.outputs.iter().enumerate() {
                    overlay.insert(
                        OutPoint::new(txid, index as u32),
                        Some(UtxoEntry {
                            output: output.clone(),
                            height: block.header.height,
                            is_coinbase,
                        }),
                    );
                }
            }
        }

        Ok(Ok(overlay))
    }

    /// Attempt to reorganize onto the branch ending at `new_tip_hash`.
    ///
    /// Returns `Ok(Ok(..))` on success, `Ok(Err(reason))` when the reorg is
    /// refused or the branch proves invalid (state fully rolled back), and
    /// `Err` only for system failures.
    #[allow(clippy::type_complexity)]
    fn attempt_reorg(
        &self,
        new_tip_hash: Hash256,
        cancel: &CancelFlag,
    ) -> Result<Result<(Hash256, Hash256, u64), BlockError>, NodeError> {
        // Walk the branch back to the lowest common ancestor with the
        // active chain, collecting full branch blocks newest-first.
        let mut branch: Vec<Block> = Vec::new();
        let lca = {
            let storage = self.storage.read();
            let mut cursor = new_tip_hash;
            loop {
                let header = storage
                    .get_header(&cursor)
                    .map_err(NodeError::Store)?
                    .ok_or_else(|| {
                        NodeError::Store(StoreError::NotFound(cursor.to_string()))
                    })?;
                if storage
                    .get_hash_at_height(header.height)
                    .map_err(NodeError::Store)?
                    == Some(cursor)
                {
                    break header;
                }
                let block = storage
                    .get_block(&cursor)
                    .map_err(NodeError::Store)?
                    .ok_or_else(|| {
                        NodeError::Store(StoreError::NotFound(cursor.to_string()))
                    })?;
                cursor = block.header.prev_hash;
                branch.push(block);
            }
        };
        branch.reverse();

        let (tip_height, old_tip) = self
            .storage
            .read()
            .chain_tip()
            .map_err(NodeError::Store)?;
        let depth = tip_height - lca.height;

        if depth > MAX_REORG_DEPTH {
            return Ok(Err(BlockError::ReorgTooDeep {
                depth,
                max: MAX_REORG_DEPTH,
            }));
        }
        {
            let checkpoints = self.checkpoints.read();
            if checkpoints.forbids_reorg_below(lca.height) {
                return Ok(Err(BlockError::CheckpointViolation(
                    checkpoints.last_height(),
                )));
            }
        }

        info!(
            old_tip = %old_tip,
            new_tip = %new_tip_hash,
            lca_height = lca.height,
            depth,
            "reorganizing chain"
        );

        // Revert to the common ancestor, newest block first.
        let mut disconnected: Vec<Block> = Vec::new();
        for _ in 0..depth {
            let block = self
                .storage
                .write()
                .disconnect_tip()
                .map_err(|e| self.fail_chain(e))?;
            disconnected.push(block);
        }

        // Apply the branch in forward order, validating each block against
        // the evolving state.
        let mut connected = 0usize;
        let mut failure: Option<BlockError> = None;
        for block in &branch {
            match self.engine.validate_block_with_cancel(block, cancel) {
                Ok(_) => {
                    self.storage
                        .write()
                        .connect_block(block, block.header.height)
                        .map_err(|e| self.fail_chain(e))?;
                    connected += 1;
                }
                Err(reason) => {
                    failure = Some(reason);
                    break;
                }
            }
        }

        if let Some(reason) = failure {
            // Roll the whole reorg back and restore the original chain.
            for _ in 0..connected {
                self.storage
                    .write()
                    .disconnect_tip()
                    .map_err(|e| self.fail_chain(e))?;
            }
            for block in disconnected.iter().rev() {
                self.storage
                    .write()
                    .connect_block(block, block.header.height)
                    .map_err(|e| self.fail_chain(e))?;
            }
            if reason == BlockError::Cancelled {
                return Err(NodeError::Cancelled);
            }
            // The failing block and everything built on it are dead.
            let mut invalid = self.invalid.lock();
            for block in &branch[connected..] {
                invalid.insert(block.hash());
            }
            warn!(new_tip = %new_tip_hash, %reason, "reorg rolled back: branch invalid");
            return Ok(Err(reason));
        }

        // Reconcile the mempool: drop transactions confirmed or conflicted
        // by the new branch, then re-admit still-valid transactions from the
        // disconnected blocks.
        let mut evicted: Vec<Hash256> = Vec::new();
        {
            let mut pool = self.mempool.lock();
            for block in &branch {
                let (_, conflicted) = pool.remove_confirmed_block(block);
                evicted.extend(conflicted);
            }
        }
        for block in disconnected.iter().rev() {
            for tx in block.transactions.iter().skip(1) {
                // Best-effort: transactions invalidated by the new chain are
                // silently dropped.
                let _ = self.admit_transaction_locked(tx.clone());
            }
        }

        for txid in evicted {
            self.emit(ChainEvent::TxEvicted {
                txid,
                reason: EvictReason::BlockConflict,
            });
        }
        for block in &branch {
            self.emit(ChainEvent::BlockAccepted {
                hash: block.hash(),
                height: block.header.height,
                fork: false,
            });
        }
        let new_height = lca.height + branch.len() as u64;
        self.emit(ChainEvent::TipAdvanced {
            new_tip: new_tip_hash,
            height: new_height,
            reorg_depth: depth,
        });

        Ok(Ok((old_tip, new_tip_hash, depth)))
    }

    /// Submit a transaction for mempool admission.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<TxOutcome, NodeError> {
        self.ensure_healthy()?;
        let _permit = self.acquire_permit()?;
        let txid = tx.txid();

        if tx.is_coinbase() {
            return Ok(TxOutcome::Rejected {
                txid,
                reason: MempoolError::InvalidTx(TxError::BadCoinbase(
                    "coinbase cannot be submitted".into(),
                )),
            });
        }
        if let Err(reason) = validation::validate_tx_structure(&tx) {
            return Ok(TxOutcome::Rejected {
                txid,
                reason: MempoolError::InvalidTx(reason),
            });
        }

        let _writer = self.write_gate.lock();
        let outcome = self.admit_transaction_locked(tx)?;
        match &outcome {
            TxOutcome::Admitted { txid } => self.emit(ChainEvent::TxAdmitted { txid: *txid }),
            TxOutcome::Replaced { old_txids, new_txid } => {
                for old in old_txids {
                    self.emit(ChainEvent::TxReplaced {
                        old_txid: *old,
                        new_txid: *new_txid,
                    });
                }
                self.emit(ChainEvent::TxAdmitted { txid: *new_txid });
            }
            TxOutcome::Rejected { .. } => {}
        }
        Ok(outcome)
    }

    /// Validate a transaction against the confirmed set plus unspent in-pool
    /// outputs, then run mempool admission. Caller holds the writer gate.
    fn admit_transaction_locked(&self, tx: Transaction) -> Result<TxOutcome, NodeError> {
        let txid = tx.txid();
        let (tip_height, _) = self
            .storage
            .read()
            .chain_tip()
            .map_err(NodeError::Store)?;
        let next_height = tip_height + 1;
        let now = self.now();

        let mut pool = self.mempool.lock();
        let fee = {
            let storage = self.storage.read();
            let lookup = |op: &OutPoint| -> Option<UtxoEntry> {
                if let Ok(Some(entry)) = storage.get_utxo(op) {
                    return Some(entry);
                }
                // Unconfirmed parent: an output of a pool transaction.
                let parent = pool.get(&op.txid)?;
                let output = parent.tx.outputs.get(op.index as usize)?;
                Some(UtxoEntry {
                    output: output.clone(),
                    height: next_height,
                    is_coinbase: false,
                })
            };
            match validation::validate_tx(&tx, lookup, next_height) {
                Ok(validated) => validated.fee,
                Err(reason) => {
                    return Ok(TxOutcome::Rejected {
                        txid,
                        reason: MempoolError::InvalidTx(reason),
                    });
                }
            }
        };

        match pool.insert(tx, fee, now, next_height) {
            Ok(outcome) => {
                for txid in &outcome.evicted {
                    self.emit(ChainEvent::TxEvicted {
                        txid: *txid,
                        reason: EvictReason::CapacityPressure,
                    });
                }
                if outcome.replaced.is_empty() {
                    Ok(TxOutcome::Admitted { txid: outcome.txid })
                } else {
                    Ok(TxOutcome::Replaced {
                        old_txids: outcome.replaced,
                        new_txid: outcome.txid,
                    })
                }
            }
            Err(reason) => Ok(TxOutcome::Rejected { txid, reason }),
        }
    }

    // -----------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------

    /// The active tip: hash, height, cumulative work, and timestamp, read
    /// under one snapshot.
    pub fn get_tip(&self) -> Result<TipInfo, NodeError> {
        Ok(self.snapshot().tip()?)
    }

    /// A consistent read view over the store. Lookups through the snapshot
    /// all observe the same committed state.
    pub fn snapshot(&self) -> ChainSnapshot<'_> {
        ChainSnapshot {
            guard: self.storage.read(),
        }
    }

    pub fn get_header(&self, hash: &Hash256) -> Result<Option<BlockHeader>, NodeError> {
        Ok(self.storage.read().get_header(hash)?)
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, NodeError> {
        Ok(self.storage.read().get_block(hash)?)
    }

    pub fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, NodeError> {
        Ok(self.storage.read().get_utxo(outpoint)?)
    }

    /// Total unspent value owned by an address.
    pub fn get_balance(&self, address: &Address) -> Result<u64, NodeError> {
        Ok(self.storage.read().balance_of(&address.pubkey_hash)?)
    }

    /// Fee-rate-descending view of up to `limit` mempool entries.
    pub fn get_mempool_snapshot(&self, limit: usize) -> Vec<TxSummary> {
        self.mempool.lock().snapshot(limit)
    }

    pub fn mempool_len(&self) -> usize {
        self.mempool.lock().len()
    }

    /// Assemble a block template paying `miner` from current mempool
    /// contents, with bits from the difficulty engine.
    pub fn get_block_template(&self, miner: &Address) -> Result<Block, NodeError> {
        let _writer = self.write_gate.lock();
        let candidates: Vec<Transaction> = {
            let pool = self.mempool.lock();
            let storage = self.storage.read();
            let is_confirmed =
                |op: &OutPoint| matches!(storage.get_utxo(op), Ok(Some(_)));
            pool.select_transactions(ember_core::constants::MAX_BLOCK_SIZE, is_confirmed)
                .into_iter()
                .map(|entry| entry.tx.clone())
                .collect()
        };
        self.engine
            .create_block_template(miner, self.now(), &candidates)
            .map_err(|e| NodeError::Chain(EmberError::Block(e)))
    }

    /// Subscribe to committed chain events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    /// Drop mempool entries older than the configured expiry.
    pub fn evict_expired_transactions(&self) -> usize {
        let _writer = self.write_gate.lock();
        let expired = self.mempool.lock().evict_expired(self.now());
        for txid in &expired {
            self.emit(ChainEvent::TxEvicted {
                txid: *txid,
                reason: EvictReason::Expired,
            });
        }
        expired.len()
    }

    /// Adopt a checkpoint by operator action. The checkpoint must agree
    /// with the active chain where it overlaps.
    pub fn adopt_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), NodeError> {
        let _writer = self.write_gate.lock();
        if let Some(active) = self
            .storage
            .read()
            .get_hash_at_height(checkpoint.height)
            .map_err(NodeError::Store)?
        {
            if active != checkpoint.hash {
                return Err(NodeError::Chain(EmberError::Block(
                    BlockError::CheckpointViolation(checkpoint.height),
                )));
            }
        }
        let mut checkpoints = self.checkpoints.write();
        checkpoints
            .adopt(checkpoint)
            .map_err(|e| NodeError::Chain(EmberError::Block(e)))?;
        if let Some(path) = &self.checkpoint_path {
            std::fs::write(path, checkpoints.to_json())
                .map_err(|e| NodeError::Store(StoreError::Io(e.to_string())))?;
        }
        Ok(())
    }

    /// Number of orphans currently held.
    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().len()
    }

    // -----------------------------------------------------------------
    // Error plumbing
    // -----------------------------------------------------------------

    fn fail_store(&self, error: StoreError) -> NodeError {
        self.note_store_error(&EmberError::Store(error.clone()));
        NodeError::Store(error)
    }

    fn fail_chain(&self, error: EmberError) -> NodeError {
        self.note_store_error(&error);
        NodeError::Chain(error)
    }
}

fn accepted_hash(outcome: &BlockOutcome) -> Option<Hash256> {
    match outcome {
        BlockOutcome::Applied { hash, .. } | BlockOutcome::SideBranch { hash } => Some(*hash),
        BlockOutcome::Reorg { new_tip, .. } => Some(*new_tip),
        BlockOutcome::Orphan { .. } | BlockOutcome::Rejected { .. } => None,
    }
}

fn system_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_consensus::engine::mine_block;
    use ember_core::address::Network;
    use ember_core::constants::{INITIAL_REWARD, TARGET_BLOCK_TIME};
    use ember_core::genesis;

    fn addr(seed: u8) -> Address {
        Address::new(Network::Mainnet, Hash256([seed; 32]))
    }

    fn test_node() -> (Node, tempfile::TempDir) {
        test_node_with_checkpoints(CheckpointSet::compiled_in())
    }

    fn test_node_with_checkpoints(checkpoints: CheckpointSet) -> (Node, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path().join("chaindata")).unwrap();
        let node = Node::with_clock(store, checkpoints, NodeConfig::default(), || {
            // Far enough ahead that test chains never hit the future-drift bound.
            genesis::GENESIS_TIMESTAMP + 100_000 * TARGET_BLOCK_TIME
        });
        (node, dir)
    }

    /// Mine the next block on the node's active tip.
    fn mine_next(node: &Node, miner: &Address) -> Block {
        let mut block = node.get_block_template(miner).unwrap();
        assert!(mine_block(&mut block, u64::MAX));
        block
    }

    #[test]
    fn node_starts_at_genesis() {
        let (node, _dir) = test_node();
        let tip = node.get_tip().unwrap();
        assert_eq!(tip.height, 0);
        assert_eq!(tip.hash, genesis::genesis_hash());
        assert_eq!(tip.timestamp, genesis::GENESIS_TIMESTAMP);
        assert!(tip.cumulative_work > U256::zero());
    }

    #[test]
    fn linear_extension_advances_tip() {
        let (node, _dir) = test_node();
        let mut events = node.subscribe();

        let block = mine_next(&node, &addr(0xBB));
        let hash = block.hash();
        let outcome = node.submit_block(block).unwrap();
        assert_eq!(outcome, BlockOutcome::Applied { hash, height: 1 });

        let tip = node.get_tip().unwrap();
        assert_eq!(tip.height, 1);
        assert_eq!(tip.hash, hash);

        assert_eq!(
            events.try_recv().unwrap(),
            ChainEvent::BlockAccepted {
                hash,
                height: 1,
                fork: false
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            ChainEvent::TipAdvanced {
                new_tip: hash,
                height: 1,
                reorg_depth: 0
            }
        );
    }

    #[test]
    fn duplicate_block_rejected() {
        let (node, _dir) = test_node();
        let block = mine_next(&node, &addr(0xBB));
        node.submit_block(block.clone()).unwrap();
        let outcome = node.submit_block(block).unwrap();
        assert!(matches!(
            outcome,
            BlockOutcome::Rejected {
                reason: BlockError::Duplicate(_),
                ..
            }
        ));
    }

    #[test]
    fn miner_balance_equals_subsidy() {
        let (node, _dir) = test_node();
        let miner = addr(0xBB);
        let block = mine_next(&node, &miner);
        node.submit_block(block).unwrap();
        assert_eq!(node.get_balance(&miner).unwrap(), INITIAL_REWARD);
        assert_eq!(node.get_balance(&addr(0xCC)).unwrap(), 0);
    }

    #[test]
    fn orphan_held_then_linked() {
        let (node, _dir) = test_node();
        let miner = addr(0xBB);

        let block1 = mine_next(&node, &miner);
        // Build block2 on top of block1 without submitting block1 yet: use a
        // second node as a scratch chain.
        let (scratch, _dir2) = test_node();
        scratch.submit_block(block1.clone()).unwrap();
        let block2 = mine_next(&scratch, &miner);
        let hash2 = block2.hash();

        // Child first: orphaned.
        let outcome = node.submit_block(block2).unwrap();
        assert_eq!(outcome, BlockOutcome::Orphan { hash: hash2 });
        assert_eq!(node.orphan_count(), 1);
        assert_eq!(node.get_tip().unwrap().height, 0);

        // Parent arrives: both connect.
        node.submit_block(block1).unwrap();
        assert_eq!(node.orphan_count(), 0);
        let tip = node.get_tip().unwrap();
        assert_eq!(tip.height, 2);
        assert_eq!(tip.hash, hash2);
    }

    #[test]
    fn equal_work_branch_stays_side() {
        let (node, _dir) = test_node();
        let block_a = mine_next(&node, &addr(0xAA));
        node.submit_block(block_a).unwrap();

        // A competing block at the same height with equal cumulative work.
        let (scratch, _dir2) = test_node();
        let block_b = {
            let mut block = scratch.get_block_template(&addr(0xBB)).unwrap();
            assert!(mine_block(&mut block, u64::MAX));
            block
        };
        let hash_b = block_b.hash();
        let tip_before = node.get_tip().unwrap();
        let outcome = node.submit_block(block_b).unwrap();
        assert_eq!(outcome, BlockOutcome::SideBranch { hash: hash_b });
        // First seen wins: the tip did not move.
        assert_eq!(node.get_tip().unwrap(), tip_before);
    }

    #[test]
    fn side_branch_block_must_pass_stateful_checks() {
        let (node, _dir) = test_node();
        let block_a = mine_next(&node, &addr(0xAA));
        node.submit_block(block_a).unwrap();

        // A competing height-1 block claiming trivially easy bits satisfies
        // its own proof-of-work but not the difficulty consensus expects;
        // it must be rejected, not stored as a side branch.
        let (scratch, _dir2) = test_node();
        let mut fork = scratch.get_block_template(&addr(0xBB)).unwrap();
        fork.header.bits = 0x2100_ffff;
        assert!(mine_block(&mut fork, u64::MAX));

        let outcome = node.submit_block(fork.clone()).unwrap();
        assert!(matches!(
            outcome,
            BlockOutcome::Rejected {
                reason: BlockError::BadDifficulty { .. },
                ..
            }
        ));
        assert!(node.get_block(&fork.hash()).unwrap().is_none());
    }

    #[test]
    fn heavier_branch_triggers_reorg() {
        let (node, _dir) = test_node();
        let old_tip_block = mine_next(&node, &addr(0xAA));
        let old_tip = old_tip_block.hash();
        node.submit_block(old_tip_block).unwrap();

        // Build a two-block branch from genesis on a scratch node.
        let (scratch, _dir2) = test_node();
        let branch1 = mine_next(&scratch, &addr(0xBB));
        scratch.submit_block(branch1.clone()).unwrap();
        let branch2 = mine_next(&scratch, &addr(0xBB));
        scratch.submit_block(branch2.clone()).unwrap();

        let mut events = node.subscribe();
        assert_eq!(
            node.submit_block(branch1.clone()).unwrap(),
            BlockOutcome::SideBranch {
                hash: branch1.hash()
            }
        );
        let outcome = node.submit_block(branch2.clone()).unwrap();
        assert_eq!(
            outcome,
            BlockOutcome::Reorg {
                old_tip,
                new_tip: branch2.hash(),
                depth: 1,
            }
        );
        let tip = node.get_tip().unwrap();
        assert_eq!(tip.height, 2);
        assert_eq!(tip.hash, branch2.hash());

        // Events: side-branch acceptance, then the reorg's accepted blocks
        // in commit order, then a single TipAdvanced carrying the depth.
        let mut saw_tip_advance = false;
        while let Ok(event) = events.try_recv() {
            if let ChainEvent::TipAdvanced {
                new_tip,
                height,
                reorg_depth,
            } = event
            {
                assert_eq!(new_tip, branch2.hash());
                assert_eq!(height, 2);
                assert_eq!(reorg_depth, 1);
                saw_tip_advance = true;
            }
        }
        assert!(saw_tip_advance);
    }

    #[test]
    fn checkpoint_blocks_reorg_across_pinned_height() {
        let (node, _dir) = test_node();
        let block1 = mine_next(&node, &addr(0xAA));
        node.submit_block(block1.clone()).unwrap();

        // A competing branch from genesis lands as a side branch first.
        let (scratch, _dir2) = test_node();
        let alt1 = mine_next(&scratch, &addr(0xBB));
        scratch.submit_block(alt1.clone()).unwrap();
        let alt2 = mine_next(&scratch, &addr(0xBB));
        scratch.submit_block(alt2.clone()).unwrap();
        assert_eq!(
            node.submit_block(alt1.clone()).unwrap(),
            BlockOutcome::SideBranch { hash: alt1.hash() }
        );

        // Now pin height 1: the heavier branch would fork below it.
        node.adopt_checkpoint(Checkpoint {
            height: 1,
            hash: block1.hash(),
        })
        .unwrap();

        let outcome = node.submit_block(alt2).unwrap();
        assert!(matches!(
            outcome,
            BlockOutcome::Rejected {
                reason: BlockError::CheckpointViolation(1),
                ..
            }
        ));
        // Active tip unchanged regardless of the branch's work.
        assert_eq!(node.get_tip().unwrap().hash, block1.hash());
    }

    #[test]
    fn alternate_block_at_pinned_height_rejected_outright() {
        let (node, _dir) = test_node();
        let block1 = mine_next(&node, &addr(0xAA));
        node.submit_block(block1.clone()).unwrap();
        node.adopt_checkpoint(Checkpoint {
            height: 1,
            hash: block1.hash(),
        })
        .unwrap();

        let (scratch, _dir2) = test_node();
        let alt1 = mine_next(&scratch, &addr(0xBB));
        let outcome = node.submit_block(alt1).unwrap();
        assert!(matches!(
            outcome,
            BlockOutcome::Rejected {
                reason: BlockError::CheckpointViolation(1),
                ..
            }
        ));
    }

    #[test]
    fn adopt_checkpoint_must_match_active_chain() {
        let (node, _dir) = test_node();
        let block1 = mine_next(&node, &addr(0xAA));
        node.submit_block(block1).unwrap();
        let err = node
            .adopt_checkpoint(Checkpoint {
                height: 1,
                hash: Hash256([0xEE; 32]),
            })
            .unwrap_err();
        assert!(matches!(
            err,
            NodeError::Chain(EmberError::Block(BlockError::CheckpointViolation(1)))
        ));
    }

    #[test]
    fn structurally_invalid_block_rejected() {
        let (node, _dir) = test_node();
        let mut block = mine_next(&node, &addr(0xBB));
        block.transactions.clear();
        let outcome = node.submit_block(block).unwrap();
        assert!(matches!(
            outcome,
            BlockOutcome::Rejected {
                reason: BlockError::CoinbaseMissing,
                ..
            }
        ));
    }

    #[test]
    fn coinbase_submission_rejected() {
        let (node, _dir) = test_node();
        let coinbase = genesis::genesis_block().transactions[0].clone();
        let outcome = node.submit_transaction(coinbase).unwrap();
        assert!(matches!(
            outcome,
            TxOutcome::Rejected {
                reason: MempoolError::InvalidTx(TxError::BadCoinbase(_)),
                ..
            }
        ));
    }

    #[test]
    fn snapshot_is_internally_consistent() {
        let (node, _dir) = test_node();
        let block = mine_next(&node, &addr(0xBB));
        node.submit_block(block).unwrap();

        let snapshot = node.snapshot();
        let tip = snapshot.tip().unwrap();
        let header = snapshot.header(&tip.hash).unwrap().unwrap();
        assert_eq!(header.height, tip.height);
        assert_eq!(header.timestamp, tip.timestamp);
        assert_eq!(snapshot.hash_at_height(tip.height).unwrap(), Some(tip.hash));
    }
}
