//! In-memory pool of unconfirmed transactions.
//!
//! The mempool stores validated transactions awaiting inclusion in blocks.
//! It provides:
//! - O(1) lookup by txid and O(1) conflict detection via a spent-outpoint index
//! - fee-rate-ordered selection (ties broken by arrival order) for block
//!   templates and snapshots
//! - replace-by-fee with BIP-125-style rules, slightly stricter: a
//!   replacement must beat the replaced set on both absolute fee and fee rate
//! - size-bounded storage with lowest-fee-rate eviction, plus age expiry
//! - per-sender nonce duplicate suppression (a policy hint, never consensus)
//!
//! Transactions must be validated against the UTXO set by the caller before
//! insertion; the pool itself only enforces policy.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::constants::{
    LOCKTIME_THRESHOLD, MEMPOOL_EXPIRY_SECS, MEMPOOL_MAX_BYTES, MEMPOOL_MAX_COUNT,
    MIN_RELAY_FEE_RATE,
};
use crate::error::MempoolError;
use crate::types::{sha256, Block, Hash256, OutPoint, Transaction};

/// Fee-rate precision: rates are stored in milli-embers per byte.
const FEE_RATE_PRECISION: u128 = 1_000;

/// Compute a fee rate in milli-embers per byte.
fn compute_fee_rate(fee: u64, size: usize) -> u64 {
    if size == 0 {
        return u64::MAX;
    }
    let rate = (fee as u128) * FEE_RATE_PRECISION / (size as u128);
    rate.min(u64::MAX as u128) as u64
}

/// Minimum fee for a transaction of `size` bytes at `rate` milli-embers/byte.
fn required_fee(rate: u64, size: usize) -> u64 {
    let fee = (rate as u128) * (size as u128) / FEE_RATE_PRECISION;
    let fee = if (rate as u128) * (size as u128) % FEE_RATE_PRECISION != 0 {
        fee + 1
    } else {
        fee
    };
    fee.min(u64::MAX as u128) as u64
}

/// Replace-by-fee policy knob.
///
/// Consensus block acceptance never consults this; it only shapes which
/// mempool conflicts are replaceable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RbfPolicy {
    /// Only transactions that signalled `replaceable` may be replaced.
    #[default]
    OptIn,
    /// Any conflicting transaction may be replaced.
    Full,
}

/// Mempool tuning parameters.
#[derive(Clone, Debug)]
pub struct MempoolConfig {
    pub max_count: usize,
    pub max_bytes: usize,
    pub expiry_secs: u64,
    /// Minimum relay fee rate in milli-embers per byte.
    pub min_fee_rate: u64,
    pub rbf_policy: RbfPolicy,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_count: MEMPOOL_MAX_COUNT,
            max_bytes: MEMPOOL_MAX_BYTES,
            expiry_secs: MEMPOOL_EXPIRY_SECS,
            min_fee_rate: MIN_RELAY_FEE_RATE,
            rbf_policy: RbfPolicy::default(),
        }
    }
}

/// A transaction stored in the mempool with precomputed metadata.
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub txid: Hash256,
    /// Fee in embers.
    pub fee: u64,
    /// Canonical serialized size in bytes.
    pub size: usize,
    /// Unix time the entry was admitted.
    pub inserted_at: u64,
    fee_rate: u64,
    /// Arrival sequence; earlier arrivals win fee-rate ties.
    seq: u64,
    /// Pubkey hash of the first input's signer, when the tx carries a nonce.
    sender: Option<Hash256>,
}

impl MempoolEntry {
    /// Fee rate in milli-embers per byte.
    pub fn fee_rate(&self) -> u64 {
        self.fee_rate
    }
}

/// Compact per-transaction view for mempool snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxSummary {
    pub txid: Hash256,
    pub fee: u64,
    pub size: usize,
    pub fee_rate: u64,
}

/// Result of a successful mempool admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmitOutcome {
    pub txid: Hash256,
    /// Conflicting transactions (and their descendants) displaced by RBF.
    pub replaced: Vec<Hash256>,
    /// Transactions evicted to make room under capacity pressure.
    pub evicted: Vec<Hash256>,
}

/// Whether a transaction's locktime allows admission now.
///
/// `lock_time` below [`LOCKTIME_THRESHOLD`] is a minimum block height,
/// otherwise a minimum unix time. Zero disables the lock.
pub fn is_final(tx: &Transaction, next_height: u64, now: u64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    if tx.lock_time < LOCKTIME_THRESHOLD {
        tx.lock_time <= next_height
    } else {
        tx.lock_time <= now
    }
}

/// In-memory pool of unconfirmed transactions.
///
/// Not thread-safe — the coordinator wraps it in a `Mutex`.
pub struct Mempool {
    config: MempoolConfig,
    /// Primary storage: txid → entry.
    entries: HashMap<Hash256, MempoolEntry>,
    /// Spent outpoint → txid of the pool transaction that spends it.
    by_outpoint: HashMap<OutPoint, Hash256>,
    /// Ordering index: ascending `(fee_rate, Reverse(seq), txid)`, so reverse
    /// iteration yields fee-rate descending with arrival-order tiebreak.
    by_fee: BTreeSet<(u64, Reverse<u64>, Hash256)>,
    /// `(sender, nonce)` → txid, for duplicate suppression.
    by_nonce: HashMap<(Hash256, u64), Hash256>,
    next_seq: u64,
    total_bytes: usize,
}

impl Mempool {
    pub fn new(config: MempoolConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            by_outpoint: HashMap::new(),
            by_fee: BTreeSet::new(),
            by_nonce: HashMap::new(),
            next_seq: 0,
            total_bytes: 0,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(MempoolConfig::default())
    }

    pub fn config(&self) -> &MempoolConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    /// Whether any input of `tx` is already spent by a pool transaction.
    pub fn has_conflict(&self, tx: &Transaction) -> bool {
        tx.inputs
            .iter()
            .any(|input| self.by_outpoint.contains_key(&input.previous_output))
    }

    /// Deduplicated txids of pool entries whose inputs overlap with `tx`.
    pub fn conflicting_txids(&self, tx: &Transaction) -> Vec<Hash256> {
        let mut seen = HashSet::new();
        tx.inputs
            .iter()
            .filter_map(|input| self.by_outpoint.get(&input.previous_output).copied())
            .filter(|txid| seen.insert(*txid))
            .collect()
    }

    /// Admit a validated transaction.
    ///
    /// `fee` comes from stateful validation against the UTXO view (which must
    /// include in-pool parent outputs). `next_height` is the height the next
    /// block will have, for locktime finality. On conflicts the RBF path is
    /// taken; on capacity pressure the lowest-fee-rate entries are evicted if
    /// the newcomer pays a strictly higher rate.
    pub fn insert(
        &mut self,
        tx: Transaction,
        fee: u64,
        now: u64,
        next_height: u64,
    ) -> Result<AdmitOutcome, MempoolError> {
        if !is_final(&tx, next_height, now) {
            return Err(MempoolError::NotYetFinal(tx.lock_time));
        }

        let txid = tx.txid();
        if self.entries.contains_key(&txid) {
            return Err(MempoolError::AlreadyKnown(txid.to_string()));
        }

        let size = tx.size();
        let minimum = required_fee(self.config.min_fee_rate, size);
        if fee < minimum {
            return Err(MempoolError::FeeBelowMinimum { fee, minimum });
        }
        let fee_rate = compute_fee_rate(fee, size);

        // --- Conflict handling: reject or replace-by-fee ---

        let conflicts = self.conflicting_txids(&tx);
        let replaced = if conflicts.is_empty() {
            Vec::new()
        } else {
            self.check_rbf(&tx, txid, fee, fee_rate, size, &conflicts)?
        };

        // --- Nonce duplicate suppression (policy hint, not consensus) ---

        let sender = self.sender_of(&tx);
        if let (Some(sender), true) = (sender, tx.nonce > 0) {
            if let Some(holder) = self.by_nonce.get(&(sender, tx.nonce)) {
                // The holder may be about to be displaced by this very RBF.
                if !replaced.contains(holder) {
                    return Err(MempoolError::NonceReplayed {
                        sender: sender.to_string(),
                        nonce: tx.nonce,
                    });
                }
            }
        }

        for victim in &replaced {
            self.remove_entry(*victim);
        }

        // --- Capacity: evict strictly-lower fee rates, else refuse ---

        let mut evicted = Vec::new();
        while (self.entries.len() >= self.config.max_count
            || self.total_bytes + size > self.config.max_bytes)
            && !self.entries.is_empty()
        {
            let &(lowest_rate, _, lowest_txid) = self
                .by_fee
                .iter()
                .next()
                .expect("by_fee is non-empty while entries is non-empty");
            if lowest_rate >= fee_rate {
                return Err(MempoolError::MempoolFull);
            }
            self.remove_entry(lowest_txid);
            evicted.push(lowest_txid);
        }
        if self.entries.len() >= self.config.max_count
            || self.total_bytes + size > self.config.max_bytes
        {
            return Err(MempoolError::MempoolFull);
        }

        // --- Insert into all indices ---

        for input in &tx.inputs {
            self.by_outpoint.insert(input.previous_output.clone(), txid);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_fee.insert((fee_rate, Reverse(seq), txid));
        if let (Some(sender), true) = (sender, tx.nonce > 0) {
            self.by_nonce.insert((sender, tx.nonce), txid);
        }
        self.total_bytes += size;
        self.entries.insert(
            txid,
            MempoolEntry {
                tx,
                txid,
                fee,
                size,
                inserted_at: now,
                fee_rate,
                seq,
                sender,
            },
        );

        Ok(AdmitOutcome {
            txid,
            replaced,
            evicted,
        })
    }

    /// Validate the RBF rules for `tx` against its direct conflicts.
    ///
    /// Returns the full replacement set (conflicts plus their in-pool
    /// descendants) when all rules pass:
    /// (a) every direct conflict signalled replaceability (unless full-RBF),
    /// (b) the new fee covers the replaced fees plus the relay increment,
    /// (c) the new fee rate strictly exceeds every replaced fee rate,
    /// (d) the replacement introduces no new unconfirmed parents and does not
    ///     spend an output of a transaction it replaces.
    fn check_rbf(
        &self,
        tx: &Transaction,
        new_txid: Hash256,
        fee: u64,
        fee_rate: u64,
        size: usize,
        conflicts: &[Hash256],
    ) -> Result<Vec<Hash256>, MempoolError> {
        if self.config.rbf_policy == RbfPolicy::OptIn {
            for conflict in conflicts {
                let entry = &self.entries[conflict];
                if !entry.tx.replaceable {
                    return Err(MempoolError::Conflict {
                        existing: conflict.to_string(),
                        outpoint: tx
                            .inputs
                            .iter()
                            .find(|i| self.by_outpoint.get(&i.previous_output) == Some(conflict))
                            .map(|i| i.previous_output.to_string())
                            .unwrap_or_default(),
                    });
                }
            }
        }

        let replacement_set = self.with_descendants(conflicts);
        let replacement_lookup: HashSet<Hash256> = replacement_set.iter().copied().collect();
        if replacement_lookup.contains(&new_txid) {
            return Err(MempoolError::RbfRejected(
                "replacement conflicts with itself".into(),
            ));
        }

        // Rule (d): parents. Spending an output of a replaced tx would orphan
        // the replacement; a parent that no replaced tx had is a new
        // unconfirmed dependency.
        let mut replaced_parents: HashSet<Hash256> = HashSet::new();
        for victim in &replacement_set {
            for input in &self.entries[victim].tx.inputs {
                let parent = input.previous_output.txid;
                if self.entries.contains_key(&parent) {
                    replaced_parents.insert(parent);
                }
            }
        }
        for input in &tx.inputs {
            let parent = input.previous_output.txid;
            if replacement_lookup.contains(&parent) {
                return Err(MempoolError::RbfRejected(
                    "replacement spends an output of a replaced transaction".into(),
                ));
            }
            if self.entries.contains_key(&parent) && !replaced_parents.contains(&parent) {
                return Err(MempoolError::RbfRejected(
                    "replacement introduces a new unconfirmed parent".into(),
                ));
            }
        }

        // Rules (b) and (c): absolute fee and fee rate.
        let mut replaced_fees: u64 = 0;
        for victim in &replacement_set {
            let entry = &self.entries[victim];
            replaced_fees = replaced_fees.saturating_add(entry.fee);
            if fee_rate <= entry.fee_rate {
                return Err(MempoolError::RbfRejected(format!(
                    "fee rate {fee_rate} does not exceed replaced rate {}",
                    entry.fee_rate
                )));
            }
        }
        let increment = required_fee(self.config.min_fee_rate, size);
        let floor = replaced_fees.saturating_add(increment);
        if fee < floor {
            return Err(MempoolError::RbfRejected(format!(
                "fee {fee} below replaced total {replaced_fees} plus increment {increment}"
            )));
        }

        Ok(replacement_set)
    }

    /// `roots` plus every in-pool descendant, deduplicated, roots first.
    fn with_descendants(&self, roots: &[Hash256]) -> Vec<Hash256> {
        let mut seen: HashSet<Hash256> = HashSet::new();
        let mut queue: VecDeque<Hash256> = VecDeque::new();
        let mut result = Vec::new();
        for root in roots {
            if seen.insert(*root) {
                queue.push_back(*root);
            }
        }
        while let Some(txid) = queue.pop_front() {
            result.push(txid);
            let Some(entry) = self.entries.get(&txid) else {
                continue;
            };
            for index in 0..entry.tx.outputs.len() {
                let outpoint = OutPoint::new(txid, index as u32);
                if let Some(child) = self.by_outpoint.get(&outpoint) {
                    if seen.insert(*child) {
                        queue.push_back(*child);
                    }
                }
            }
        }
        result
    }

    /// The sender identity used for nonce suppression: the pubkey hash of
    /// the first input's public key. Coinbase and unsigned inputs have none.
    fn sender_of(&self, tx: &Transaction) -> Option<Hash256> {
        let first = tx.inputs.first()?;
        if first.public_key.is_empty() {
            return None;
        }
        Some(sha256(&first.public_key))
    }

    /// Remove an entry and clean every index. Returns the removed entry.
    fn remove_entry(&mut self, txid: Hash256) -> Option<MempoolEntry> {
        let entry = self.entries.remove(&txid)?;
        for input in &entry.tx.inputs {
            self.by_outpoint.remove(&input.previous_output);
        }
        self.by_fee.remove(&(entry.fee_rate, Reverse(entry.seq), txid));
        if let Some(sender) = entry.sender {
            if entry.tx.nonce > 0 {
                if let Some(holder) = self.by_nonce.get(&(sender, entry.tx.nonce)) {
                    if *holder == txid {
                        self.by_nonce.remove(&(sender, entry.tx.nonce));
                    }
                }
            }
        }
        self.total_bytes -= entry.size;
        Some(entry)
    }

    /// Remove a transaction by txid.
    pub fn remove(&mut self, txid: &Hash256) -> Option<MempoolEntry> {
        self.remove_entry(*txid)
    }

    /// Remove entries older than the configured expiry. Returns their txids.
    pub fn evict_expired(&mut self, now: u64) -> Vec<Hash256> {
        let cutoff = now.saturating_sub(self.config.expiry_secs);
        let expired: Vec<Hash256> = self
            .entries
            .values()
            .filter(|e| e.inserted_at < cutoff)
            .map(|e| e.txid)
            .collect();
        for txid in &expired {
            self.remove_entry(*txid);
        }
        expired
    }

    /// Select transactions for a block template.
    ///
    /// Greedy by fee rate (arrival order on ties) within `max_bytes`,
    /// honoring in-pool dependencies: a transaction spending another pool
    /// transaction's output is selected only after its parent. `is_confirmed`
    /// reports whether an outpoint exists in the confirmed UTXO set.
    pub fn select_transactions<F>(&self, max_bytes: usize, is_confirmed: F) -> Vec<&MempoolEntry>
    where
        F: Fn(&OutPoint) -> bool,
    {
        let mut selected: Vec<&MempoolEntry> = Vec::new();
        let mut selected_ids: HashSet<Hash256> = HashSet::new();
        let mut remaining = max_bytes;

        loop {
            let mut progress = false;
            for &(_, _, txid) in self.by_fee.iter().rev() {
                if selected_ids.contains(&txid) {
                    continue;
                }
                let entry = &self.entries[&txid];
                if entry.size > remaining {
                    continue;
                }
                let deps_met = entry.tx.inputs.iter().all(|input| {
                    is_confirmed(&input.previous_output)
                        || selected_ids.contains(&input.previous_output.txid)
                });
                if !deps_met {
                    continue;
                }
                selected.push(entry);
                selected_ids.insert(txid);
                remaining -= entry.size;
                progress = true;
            }
            if !progress {
                break;
            }
        }

        selected
    }

    /// Fee-rate-descending snapshot of up to `limit` entries.
    pub fn snapshot(&self, limit: usize) -> Vec<TxSummary> {
        self.by_fee
            .iter()
            .rev()
            .take(limit)
            .map(|&(_, _, txid)| {
                let entry = &self.entries[&txid];
                TxSummary {
                    txid,
                    fee: entry.fee,
                    size: entry.size,
                    fee_rate: entry.fee_rate,
                }
            })
            .collect()
    }

    /// Reconcile with a newly connected block.
    ///
    /// Removes transactions confirmed by the block and pool transactions
    /// whose inputs the block spent out from under them. Returns
    /// `(confirmed, conflicted)` txid lists.
    pub fn remove_confirmed_block(&mut self, block: &Block) -> (Vec<Hash256>, Vec<Hash256>) {
        let mut confirmed = Vec::new();
        let mut spent: HashSet<OutPoint> = HashSet::new();

        for tx in &block.transactions {
            let txid = tx.txid();
            if self.remove_entry(txid).is_some() {
                confirmed.push(txid);
            }
            for input in &tx.inputs {
                spent.insert(input.previous_output.clone());
            }
        }

        let conflicting: Vec<Hash256> = spent
            .iter()
            .filter_map(|op| self.by_outpoint.get(op).copied())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        // A conflicted tx takes its descendants with it; their inputs
        // reference outputs that will never confirm.
        let conflicted = self.with_descendants(&conflicting);
        for txid in &conflicted {
            self.remove_entry(*txid);
        }

        (confirmed, conflicted)
    }

    /// All txids currently in the pool (arbitrary order).
    pub fn txids(&self) -> Vec<Hash256> {
        self.entries.keys().copied().collect()
    }
}
