//! RocksDB-backed persistent chain storage.
//!
//! Column families hold blocks (canonical bytes), headers, per-block deltas,
//! the UTXO set, the active-chain height index, cumulative work per header,
//! an address index for balance queries, and tip metadata. Every
//! connect/disconnect is a single atomic [`WriteBatch`] covering the block
//! body, header, delta, UTXO pages, indices, and the tip pointer — after a
//! crash either the whole batch is visible or none of it.
//!
//! Integrity: block and header values must re-hash to their key, and a
//! rolling XOR-of-SHA-256 digest of the UTXO set is maintained in metadata.
//! A digest mismatch on open triggers reconstruction by replaying the active
//! chain from genesis.
//!
//! On first open, the genesis block is connected automatically.

use std::path::Path;

use rocksdb::{ColumnFamilyDescriptor, Options, SliceTransform, WriteBatch, DB};

use ember_core::codec;
use ember_core::error::{ChainStateError, EmberError, StoreError};
use ember_core::genesis;
use ember_core::pow::{self, U256};
use ember_core::types::{sha256, Block, BlockHeader, Hash256, OutPoint, UtxoEntry};
use ember_core::utxo::BlockDelta;

const CF_BLOCKS: &str = "blocks";
const CF_HEADERS: &str = "headers";
const CF_DELTAS: &str = "deltas";
const CF_UTXOS: &str = "utxos";
const CF_HEIGHT_INDEX: &str = "height_index";
const CF_WORK: &str = "work";
const CF_ADDRESS_INDEX: &str = "address_index";
const CF_METADATA: &str = "metadata";

const ALL_CFS: &[&str] = &[
    CF_BLOCKS,
    CF_HEADERS,
    CF_DELTAS,
    CF_UTXOS,
    CF_HEIGHT_INDEX,
    CF_WORK,
    CF_ADDRESS_INDEX,
    CF_METADATA,
];

const META_TIP_HEIGHT: &[u8] = b"tip_height";
const META_TIP_HASH: &[u8] = b"tip_hash";
const META_TIP_WORK: &[u8] = b"tip_work";
const META_UTXO_COUNT: &[u8] = b"utxo_count";
const META_UTXO_DIGEST: &[u8] = b"utxo_digest";

/// Address-index key: pubkey hash (32) + txid (32) + output index (4, BE).
const ADDR_KEY_LEN: usize = 68;

fn io_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Io(e.to_string())
}

fn corrupt(key: impl std::fmt::Display, detail: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        key: key.to_string(),
        detail: detail.into(),
    }
}

/// Order-independent digest contribution of one UTXO key/value pair.
fn entry_digest(key: &[u8], value: &[u8]) -> [u8; 32] {
    let mut data = Vec::with_capacity(key.len() + value.len());
    data.extend_from_slice(key);
    data.extend_from_slice(value);
    sha256(&data).0
}

fn xor_into(acc: &mut [u8; 32], digest: &[u8; 32]) {
    for (a, d) in acc.iter_mut().zip(digest) {
        *a ^= d;
    }
}

/// RocksDB-backed chain store.
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    /// Open or create the database, connect genesis if empty, and verify the
    /// UTXO digest (rebuilding the set from blocks on mismatch).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EmberError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| {
                let mut opts = Options::default();
                if *name == CF_ADDRESS_INDEX {
                    opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(32));
                }
                ColumnFamilyDescriptor::new(*name, opts)
            })
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(|e| EmberError::Store(io_err(e)))?;

        let mut store = Self { db };

        if store.is_empty()? {
            store.connect_block(genesis::genesis_block(), 0)?;
        }

        if !store.verify_utxo_digest()? {
            tracing::warn!("utxo digest mismatch on open; rebuilding utxo set from blocks");
            store.rebuild_utxo_state()?;
            if !store.verify_utxo_digest()? {
                return Err(EmberError::Store(corrupt(
                    "utxo_digest",
                    "digest mismatch persists after rebuild",
                )));
            }
        }

        Ok(store)
    }

    // --- Internal helpers ---

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| io_err(format!("missing column family: {name}")))
    }

    fn encode_outpoint(outpoint: &OutPoint) -> Result<Vec<u8>, StoreError> {
        bincode::encode_to_vec(outpoint, bincode::config::standard()).map_err(io_err)
    }

    fn encode_entry(entry: &UtxoEntry) -> Result<Vec<u8>, StoreError> {
        bincode::encode_to_vec(entry, bincode::config::standard()).map_err(io_err)
    }

    fn height_key(height: u64) -> [u8; 8] {
        height.to_be_bytes()
    }

    fn addr_key(pubkey_hash: &Hash256, outpoint: &OutPoint) -> [u8; ADDR_KEY_LEN] {
        let mut key = [0u8; ADDR_KEY_LEN];
        key[0..32].copy_from_slice(pubkey_hash.as_bytes());
        key[32..64].copy_from_slice(outpoint.txid.as_bytes());
        key[64..68].copy_from_slice(&outpoint.index.to_be_bytes());
        key
    }

    fn get_meta_u64(&self, key: &[u8]) -> Result<u64, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, key).map_err(io_err)? {
            Some(bytes) if bytes.len() == 8 => Ok(u64::from_le_bytes(bytes.try_into().unwrap())),
            Some(_) => Err(corrupt(
                String::from_utf8_lossy(key),
                "invalid metadata length",
            )),
            None => Ok(0),
        }
    }

    fn get_meta_hash(&self, key: &[u8]) -> Result<Hash256, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, key).map_err(io_err)? {
            Some(bytes) if bytes.len() == 32 => Ok(Hash256(bytes.try_into().unwrap())),
            Some(_) => Err(corrupt(
                String::from_utf8_lossy(key),
                "invalid metadata length",
            )),
            None => Ok(Hash256::ZERO),
        }
    }

    // --- Tip and aggregates ---

    /// Current chain tip as `(height, block_hash)`; `(0, ZERO)` when empty.
    pub fn chain_tip(&self) -> Result<(u64, Hash256), StoreError> {
        let hash = self.get_meta_hash(META_TIP_HASH)?;
        if hash.is_zero() {
            return Ok((0, Hash256::ZERO));
        }
        Ok((self.get_meta_u64(META_TIP_HEIGHT)?, hash))
    }

    /// Cumulative work of the active tip.
    pub fn tip_work(&self) -> Result<U256, StoreError> {
        Ok(pow::u256_from_bytes(
            self.get_meta_hash(META_TIP_WORK)?.as_bytes(),
        ))
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.get_meta_hash(META_TIP_HASH)?.is_zero())
    }

    pub fn utxo_count(&self) -> Result<u64, StoreError> {
        self.get_meta_u64(META_UTXO_COUNT)
    }

    /// Flush all in-memory buffers to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(io_err)
    }

    // --- Lookups (integrity-checked) ---

    /// Get a full block by hash. The stored bytes must re-hash to the key.
    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, StoreError> {
        let cf = self.cf(CF_BLOCKS)?;
        let Some(bytes) = self.db.get_cf(&cf, hash.as_bytes()).map_err(io_err)? else {
            return Ok(None);
        };
        let block =
            codec::decode_block(&bytes).map_err(|e| corrupt(hash, format!("block: {e}")))?;
        if block.hash() != *hash {
            return Err(corrupt(hash, "block bytes do not hash to key"));
        }
        Ok(Some(block))
    }

    /// Get a header by hash, side branches included.
    pub fn get_header(&self, hash: &Hash256) -> Result<Option<BlockHeader>, StoreError> {
        let cf = self.cf(CF_HEADERS)?;
        let Some(bytes) = self.db.get_cf(&cf, hash.as_bytes()).map_err(io_err)? else {
            return Ok(None);
        };
        let header =
            codec::decode_header(&bytes).map_err(|e| corrupt(hash, format!("header: {e}")))?;
        if header.hash() != *hash {
            return Err(corrupt(hash, "header bytes do not hash to key"));
        }
        Ok(Some(header))
    }

    /// The active-chain block hash at `height`.
    pub fn get_hash_at_height(&self, height: u64) -> Result<Option<Hash256>, StoreError> {
        let cf = self.cf(CF_HEIGHT_INDEX)?;
        match self
            .db
            .get_cf(&cf, Self::height_key(height))
            .map_err(io_err)?
        {
            Some(bytes) if bytes.len() == 32 => Ok(Some(Hash256(bytes.try_into().unwrap()))),
            Some(_) => Err(corrupt(height, "invalid height index value")),
            None => Ok(None),
        }
    }

    /// The persisted delta for a connected block.
    pub fn get_delta(&self, hash: &Hash256) -> Result<Option<BlockDelta>, StoreError> {
        let cf = self.cf(CF_DELTAS)?;
        let Some(bytes) = self.db.get_cf(&cf, hash.as_bytes()).map_err(io_err)? else {
            return Ok(None);
        };
        let (delta, _): (BlockDelta, _) =
            bincode::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| corrupt(hash, format!("delta: {e}")))?;
        Ok(Some(delta))
    }

    /// Cumulative work recorded for a header, side branches included.
    pub fn get_work(&self, hash: &Hash256) -> Result<Option<U256>, StoreError> {
        let cf = self.cf(CF_WORK)?;
        match self.db.get_cf(&cf, hash.as_bytes()).map_err(io_err)? {
            Some(bytes) if bytes.len() == 32 => {
                Ok(Some(pow::u256_from_bytes(&bytes.try_into().unwrap())))
            }
            Some(_) => Err(corrupt(hash, "invalid work value")),
            None => Ok(None),
        }
    }

    pub fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, StoreError> {
        let cf = self.cf(CF_UTXOS)?;
        let key = Self::encode_outpoint(outpoint)?;
        let Some(bytes) = self.db.get_cf(&cf, &key).map_err(io_err)? else {
            return Ok(None);
        };
        let (entry, _): (UtxoEntry, _) =
            bincode::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| corrupt(outpoint, format!("utxo: {e}")))?;
        Ok(Some(entry))
    }

    /// All UTXOs owned by `pubkey_hash`, via prefix iteration over the
    /// address index.
    pub fn get_utxos_by_address(
        &self,
        pubkey_hash: &Hash256,
    ) -> Result<Vec<(OutPoint, UtxoEntry)>, StoreError> {
        let cf_addr = self.cf(CF_ADDRESS_INDEX)?;
        let prefix = pubkey_hash.as_bytes();

        let mut result = Vec::new();
        for item in self.db.prefix_iterator_cf(&cf_addr, prefix) {
            let (key, _) = item.map_err(io_err)?;
            // The prefix iterator may overshoot into the next prefix.
            if key.len() != ADDR_KEY_LEN || &key[0..32] != prefix {
                break;
            }
            let mut txid = [0u8; 32];
            txid.copy_from_slice(&key[32..64]);
            let index = u32::from_be_bytes(key[64..68].try_into().unwrap());
            let outpoint = OutPoint::new(Hash256(txid), index);
            if let Some(entry) = self.get_utxo(&outpoint)? {
                result.push((outpoint, entry));
            }
        }
        Ok(result)
    }

    /// Sum of UTXO values owned by `pubkey_hash`.
    pub fn balance_of(&self, pubkey_hash: &Hash256) -> Result<u64, StoreError> {
        Ok(self
            .get_utxos_by_address(pubkey_hash)?
            .iter()
            .map(|(_, e)| e.output.value)
            .sum())
    }

    // --- Side-branch storage ---

    /// Store a block, its header, and its cumulative work without touching
    /// the UTXO set, height index, or tip. Used for side branches and
    /// reorg candidates.
    pub fn put_side_block(&mut self, block: &Block, cumulative_work: U256) -> Result<(), StoreError> {
        let hash = block.hash();
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_BLOCKS)?, hash.as_bytes(), codec::block_bytes(block));
        batch.put_cf(
            self.cf(CF_HEADERS)?,
            hash.as_bytes(),
            codec::header_bytes(&block.header),
        );
        batch.put_cf(
            self.cf(CF_WORK)?,
            hash.as_bytes(),
            pow::u256_to_bytes(cumulative_work),
        );
        self.db.write(batch).map_err(io_err)
    }

    // --- Connect / disconnect ---

    /// Connect a validated block at the tip. One atomic batch covers the
    /// block body, header, delta, UTXO pages, indices, and the tip pointer.
    pub fn connect_block(&mut self, block: &Block, height: u64) -> Result<BlockDelta, EmberError> {
        let (tip_height, tip_hash) = self.chain_tip()?;
        let parent_work = if tip_hash.is_zero() {
            if height != 0 {
                return Err(ChainStateError::HeightMismatch {
                    expected: 0,
                    got: height,
                }
                .into());
            }
            U256::zero()
        } else {
            if height != tip_height + 1 {
                return Err(ChainStateError::HeightMismatch {
                    expected: tip_height + 1,
                    got: height,
                }
                .into());
            }
            self.get_work(&tip_hash)?
                .ok_or_else(|| corrupt(tip_hash, "tip has no work entry"))?
        };

        let block_hash = block.hash();
        if block_hash == tip_hash {
            return Err(ChainStateError::DuplicateBlock(block_hash.to_string()).into());
        }

        let cumulative_work = parent_work + pow::block_work(block.header.bits);

        let mut digest = self.get_meta_hash(META_UTXO_DIGEST)?.0;
        let mut delta = BlockDelta::default();
        let mut batch = WriteBatch::default();

        // Outputs created by this block that have not (yet) been consumed by
        // a later transaction in the same block. Only the survivors reach
        // the database; in-block pairs cancel out entirely.
        let mut pending: std::collections::HashMap<OutPoint, UtxoEntry> =
            std::collections::HashMap::new();

        for tx in &block.transactions {
            // Spend inputs: outputs of earlier in-block transactions resolve
            // from the overlay, everything else from the UTXO pages.
            for input in &tx.inputs {
                if let Some(entry) = pending.remove(&input.previous_output) {
                    delta.spent.push((input.previous_output.clone(), entry));
                    continue;
                }
                let key = Self::encode_outpoint(&input.previous_output)?;
                let value = self
                    .db
                    .get_cf(self.cf(CF_UTXOS)?, &key)
                    .map_err(io_err)?
                    .ok_or_else(|| {
                        EmberError::ChainState(ChainStateError::MissingUtxo(
                            input.previous_output.to_string(),
                        ))
                    })?;
                let (entry, _): (UtxoEntry, _) =
                    bincode::decode_from_slice(&value, bincode::config::standard())
                        .map_err(|e| corrupt(&input.previous_output, format!("utxo: {e}")))?;

                batch.delete_cf(self.cf(CF_UTXOS)?, &key);
                batch.delete_cf(
                    self.cf(CF_ADDRESS_INDEX)?,
                    Self::addr_key(&entry.output.recipient.pubkey_hash, &input.previous_output),
                );
                xor_into(&mut digest, &entry_digest(&key, &value));
                delta.spent.push((input.previous_output.clone(), entry));
            }

            // Create outputs into the overlay.
            let txid = tx.txid();
            let is_coinbase = tx.is_coinbase();
            for (index, output) in tx.outputs.iter().enumerate() {
                let outpoint = OutPoint::new(txid, index as u32);
                pending.insert(
                    outpoint.clone(),
                    UtxoEntry {
                        output: output.clone(),
                        height,
                        is_coinbase,
                    },
                );
                delta.created.push(outpoint);
            }
        }

        // Persist the creations that survived the block.
        for (outpoint, entry) in &pending {
            let key = Self::encode_outpoint(outpoint)?;
            let value = Self::encode_entry(entry)?;
            batch.put_cf(self.cf(CF_UTXOS)?, &key, &value);
            batch.put_cf(
                self.cf(CF_ADDRESS_INDEX)?,
                Self::addr_key(&entry.output.recipient.pubkey_hash, outpoint),
                [],
            );
            xor_into(&mut digest, &entry_digest(&key, &value));
        }

        // Block body, header, delta, indices.
        batch.put_cf(self.cf(CF_BLOCKS)?, block_hash.as_bytes(), codec::block_bytes(block));
        batch.put_cf(
            self.cf(CF_HEADERS)?,
            block_hash.as_bytes(),
            codec::header_bytes(&block.header),
        );
        let delta_bytes =
            bincode::encode_to_vec(&delta, bincode::config::standard()).map_err(io_err)?;
        batch.put_cf(self.cf(CF_DELTAS)?, block_hash.as_bytes(), &delta_bytes);
        batch.put_cf(
            self.cf(CF_HEIGHT_INDEX)?,
            Self::height_key(height),
            block_hash.as_bytes(),
        );
        batch.put_cf(
            self.cf(CF_WORK)?,
            block_hash.as_bytes(),
            pow::u256_to_bytes(cumulative_work),
        );

        // Tip pointer and aggregates. Written in the same batch, so a crash
        // leaves either the old tip or the fully connected new one.
        let utxo_count = self.get_meta_u64(META_UTXO_COUNT)?
            + delta.created.len() as u64
            - delta.spent.len() as u64;
        let cf_meta = self.cf(CF_METADATA)?;
        batch.put_cf(cf_meta, META_TIP_HEIGHT, height.to_le_bytes());
        batch.put_cf(cf_meta, META_TIP_HASH, block_hash.as_bytes());
        batch.put_cf(cf_meta, META_TIP_WORK, pow::u256_to_bytes(cumulative_work));
        batch.put_cf(cf_meta, META_UTXO_COUNT, utxo_count.to_le_bytes());
        batch.put_cf(cf_meta, META_UTXO_DIGEST, digest);

        self.db.write(batch).map_err(io_err)?;
        tracing::debug!(height, hash = %block_hash, "connected block");
        Ok(delta)
    }

    /// Disconnect the tip using its persisted delta, atomically. Returns the
    /// disconnected block.
    pub fn disconnect_tip(&mut self) -> Result<Block, EmberError> {
        let (tip_height, tip_hash) = self.chain_tip()?;
        if tip_hash.is_zero() {
            return Err(ChainStateError::EmptyChain.into());
        }

        let block = self
            .get_block(&tip_hash)?
            .ok_or_else(|| ChainStateError::BlockNotFound(tip_hash.to_string()))?;
        let delta = self
            .get_delta(&tip_hash)?
            .ok_or_else(|| ChainStateError::MissingDelta(tip_hash.to_string()))?;

        let mut digest = self.get_meta_hash(META_UTXO_DIGEST)?.0;
        let mut batch = WriteBatch::default();

        // Outputs both created and consumed within this block never reached
        // the database; skip them on both sides of the reversal.
        let created_here: std::collections::HashSet<&OutPoint> = delta.created.iter().collect();
        let consumed_here: std::collections::HashSet<&OutPoint> = delta
            .spent
            .iter()
            .map(|(outpoint, _)| outpoint)
            .filter(|outpoint| created_here.contains(outpoint))
            .collect();

        // Remove surviving created UTXOs; entry contents are recomputed
        // exactly as they were stored at connect time.
        for tx in &block.transactions {
            let txid = tx.txid();
            let is_coinbase = tx.is_coinbase();
            for (index, output) in tx.outputs.iter().enumerate() {
                let outpoint = OutPoint::new(txid, index as u32);
                if consumed_here.contains(&outpoint) {
                    continue;
                }
                let entry = UtxoEntry {
                    output: output.clone(),
                    height: tip_height,
                    is_coinbase,
                };
                let key = Self::encode_outpoint(&outpoint)?;
                let value = Self::encode_entry(&entry)?;
                batch.delete_cf(self.cf(CF_UTXOS)?, &key);
                batch.delete_cf(
                    self.cf(CF_ADDRESS_INDEX)?,
                    Self::addr_key(&output.recipient.pubkey_hash, &outpoint),
                );
                xor_into(&mut digest, &entry_digest(&key, &value));
            }
        }

        // Restore UTXOs the block spent out of the prior state.
        for (outpoint, entry) in &delta.spent {
            if created_here.contains(outpoint) {
                continue;
            }
            let key = Self::encode_outpoint(outpoint)?;
            let value = Self::encode_entry(entry)?;
            batch.put_cf(self.cf(CF_UTXOS)?, &key, &value);
            batch.put_cf(
                self.cf(CF_ADDRESS_INDEX)?,
                Self::addr_key(&entry.output.recipient.pubkey_hash, outpoint),
                [],
            );
            xor_into(&mut digest, &entry_digest(&key, &value));
        }

        batch.delete_cf(self.cf(CF_DELTAS)?, tip_hash.as_bytes());
        batch.delete_cf(self.cf(CF_HEIGHT_INDEX)?, Self::height_key(tip_height));

        let utxo_count = self.get_meta_u64(META_UTXO_COUNT)? + delta.spent.len() as u64
            - delta.created.len() as u64;
        let cf_meta = self.cf(CF_METADATA)?;
        if tip_height == 0 {
            batch.put_cf(cf_meta, META_TIP_HEIGHT, 0u64.to_le_bytes());
            batch.put_cf(cf_meta, META_TIP_HASH, Hash256::ZERO.as_bytes());
            batch.put_cf(cf_meta, META_TIP_WORK, [0u8; 32]);
        } else {
            let parent = block.header.prev_hash;
            let parent_work = self
                .get_work(&parent)?
                .ok_or_else(|| corrupt(parent, "parent has no work entry"))?;
            batch.put_cf(cf_meta, META_TIP_HEIGHT, (tip_height - 1).to_le_bytes());
            batch.put_cf(cf_meta, META_TIP_HASH, parent.as_bytes());
            batch.put_cf(cf_meta, META_TIP_WORK, pow::u256_to_bytes(parent_work));
        }
        batch.put_cf(cf_meta, META_UTXO_COUNT, utxo_count.to_le_bytes());
        batch.put_cf(cf_meta, META_UTXO_DIGEST, digest);

        self.db.write(batch).map_err(io_err)?;
        tracing::debug!(height = tip_height, hash = %tip_hash, "disconnected block");
        Ok(block)
    }

    // --- Integrity ---

    /// Recompute the UTXO digest by scanning the set and compare it to the
    /// stored value.
    pub fn verify_utxo_digest(&self) -> Result<bool, StoreError> {
        let cf = self.cf(CF_UTXOS)?;
        let mut digest = [0u8; 32];
        let mut count: u64 = 0;
        for item in self.db.iterator_cf(&cf, rocksdb::IteratorMode::Start) {
            let (key, value) = item.map_err(io_err)?;
            xor_into(&mut digest, &entry_digest(&key, &value));
            count += 1;
        }
        Ok(digest == self.get_meta_hash(META_UTXO_DIGEST)?.0
            && count == self.get_meta_u64(META_UTXO_COUNT)?)
    }

    /// Rebuild the UTXO set, address index, count, and digest by replaying
    /// every active-chain block from genesis. Blocks themselves are trusted
    /// (they were validated before being connected).
    pub fn rebuild_utxo_state(&mut self) -> Result<(), EmberError> {
        let (tip_height, tip_hash) = self.chain_tip()?;
        if tip_hash.is_zero() {
            return Ok(());
        }

        // Clear the UTXO set and address index.
        let mut batch = WriteBatch::default();
        for cf_name in [CF_UTXOS, CF_ADDRESS_INDEX] {
            let cf = self.cf(cf_name)?;
            for item in self.db.iterator_cf(&cf, rocksdb::IteratorMode::Start) {
                let (key, _) = item.map_err(io_err)?;
                batch.delete_cf(&cf, key);
            }
        }
        self.db.write(batch).map_err(io_err)?;

        let mut live: std::collections::HashMap<OutPoint, UtxoEntry> =
            std::collections::HashMap::new();
        for height in 0..=tip_height {
            let hash = self
                .get_hash_at_height(height)?
                .ok_or_else(|| corrupt(height, "height index gap during rebuild"))?;
            let block = self
                .get_block(&hash)?
                .ok_or_else(|| ChainStateError::BlockNotFound(hash.to_string()))?;
            for tx in &block.transactions {
                for input in &tx.inputs {
                    live.remove(&input.previous_output).ok_or_else(|| {
                        corrupt(&input.previous_output, "spend of unknown utxo during rebuild")
                    })?;
                }
                let txid = tx.txid();
                let is_coinbase = tx.is_coinbase();
                for (index, output) in tx.outputs.iter().enumerate() {
                    live.insert(
                        OutPoint::new(txid, index as u32),
                        UtxoEntry {
                            output: output.clone(),
                            height,
                            is_coinbase,
                        },
                    );
                }
            }
        }

        let mut digest = [0u8; 32];
        let mut batch = WriteBatch::default();
        let count = live.len() as u64;
        for (outpoint, entry) in live {
            let key = Self::encode_outpoint(&outpoint)?;
            let value = Self::encode_entry(&entry)?;
            batch.put_cf(self.cf(CF_UTXOS)?, &key, &value);
            batch.put_cf(
                self.cf(CF_ADDRESS_INDEX)?,
                Self::addr_key(&entry.output.recipient.pubkey_hash, &outpoint),
                [],
            );
            xor_into(&mut digest, &entry_digest(&key, &value));
        }
        let cf_meta = self.cf(CF_METADATA)?;
        batch.put_cf(cf_meta, META_UTXO_COUNT, count.to_le_bytes());
        batch.put_cf(cf_meta, META_UTXO_DIGEST, digest);
        self.db.write(batch).map_err(io_err)?;

        tracing::info!(utxos = count, "utxo set rebuilt from blocks");
        Ok(())
    }

    #[cfg(test)]
    fn corrupt_block_bytes(&mut self, hash: &Hash256) {
        let cf = self.db.cf_handle(CF_BLOCKS).unwrap();
        self.db.put_cf(&cf, hash.as_bytes(), b"garbage").unwrap();
    }

    #[cfg(test)]
    fn tamper_utxo_digest(&mut self) {
        let cf = self.db.cf_handle(CF_METADATA).unwrap();
        self.db.put_cf(&cf, META_UTXO_DIGEST, [0xEE; 32]).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::address::{Address, Network};
    use ember_core::constants::{COIN, INITIAL_REWARD};
    use ember_core::merkle;
    use ember_core::types::{Transaction, TxInput, TxOutput};

    fn addr(seed: u8) -> Address {
        Address::new(Network::Mainnet, Hash256([seed; 32]))
    }

    fn temp_store() -> (RocksStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path().join("chaindata")).unwrap();
        (store, dir)
    }

    fn make_coinbase(value: u64, height: u64, recipient: Address) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![],
            outputs: vec![TxOutput { value, recipient }],
            lock_time: height,
            nonce: height,
            replaceable: false,
        }
    }

    fn make_tx(ops: &[OutPoint], value: u64, recipient: Address) -> Transaction {
        Transaction {
            version: 1,
            inputs: ops
                .iter()
                .map(|op| TxInput {
                    previous_output: op.clone(),
                    signature: vec![0; 64],
                    public_key: vec![0x02; 33],
                })
                .collect(),
            outputs: vec![TxOutput { value, recipient }],
            lock_time: 0,
            nonce: 0,
            replaceable: false,
        }
    }

    fn make_block(prev: Hash256, height: u64, timestamp: u64, txs: Vec<Transaction>) -> Block {
        let txids: Vec<Hash256> = txs.iter().map(|t| t.txid()).collect();
        Block {
            header: ember_core::types::BlockHeader {
                version: 1,
                prev_hash: prev,
                merkle_root: merkle::merkle_root(&txids),
                timestamp,
                bits: pow::GENESIS_BITS,
                nonce: 0,
                height,
            },
            transactions: txs,
        }
    }

    #[test]
    fn open_auto_connects_genesis() {
        let (store, _dir) = temp_store();
        assert!(!store.is_empty().unwrap());
        let (height, hash) = store.chain_tip().unwrap();
        assert_eq!(height, 0);
        assert_eq!(hash, genesis::genesis_hash());
        assert_eq!(store.utxo_count().unwrap(), 1);
        assert_eq!(
            store.tip_work().unwrap(),
            pow::block_work(pow::GENESIS_BITS)
        );
    }

    #[test]
    fn genesis_utxo_and_balance_present() {
        let (store, _dir) = temp_store();
        let coinbase_txid = genesis::genesis_coinbase_txid();
        let entry = store
            .get_utxo(&OutPoint::new(coinbase_txid, 0))
            .unwrap()
            .unwrap();
        assert_eq!(entry.output.value, INITIAL_REWARD);
        assert!(entry.is_coinbase);

        let pkh = genesis::genesis_address().pubkey_hash;
        assert_eq!(store.balance_of(&pkh).unwrap(), INITIAL_REWARD);
    }

    #[test]
    fn connect_accumulates_work() {
        let (mut store, _dir) = temp_store();
        let b1 = make_block(
            genesis::genesis_hash(),
            1,
            genesis::GENESIS_TIMESTAMP + 600,
            vec![make_coinbase(50 * COIN, 1, addr(0xBB))],
        );
        store.connect_block(&b1, 1).unwrap();
        assert_eq!(
            store.tip_work().unwrap(),
            pow::block_work(pow::GENESIS_BITS) * 2u64
        );
        assert_eq!(store.get_work(&b1.hash()).unwrap().unwrap(), store.tip_work().unwrap());
    }

    #[test]
    fn connect_rejects_wrong_height() {
        let (mut store, _dir) = temp_store();
        let b1 = make_block(
            genesis::genesis_hash(),
            1,
            genesis::GENESIS_TIMESTAMP + 600,
            vec![make_coinbase(50 * COIN, 1, addr(0xBB))],
        );
        assert!(matches!(
            store.connect_block(&b1, 5).unwrap_err(),
            EmberError::ChainState(ChainStateError::HeightMismatch { .. })
        ));
    }

    #[test]
    fn connect_spend_and_disconnect_roundtrip() {
        let (mut store, _dir) = temp_store();
        let coinbase_txid = genesis::genesis_coinbase_txid();
        let genesis_pkh = genesis::genesis_address().pubkey_hash;

        let spend = make_tx(
            &[OutPoint::new(coinbase_txid, 0)],
            INITIAL_REWARD - COIN,
            addr(0xCC),
        );
        let b1 = make_block(
            genesis::genesis_hash(),
            1,
            genesis::GENESIS_TIMESTAMP + 600,
            vec![make_coinbase(50 * COIN, 1, addr(0xBB)), spend],
        );
        let delta = store.connect_block(&b1, 1).unwrap();
        assert_eq!(delta.spent.len(), 1);
        assert_eq!(delta.created.len(), 2);
        assert!(store
            .get_utxo(&OutPoint::new(coinbase_txid, 0))
            .unwrap()
            .is_none());
        assert_eq!(store.balance_of(&genesis_pkh).unwrap(), 0);
        assert_eq!(store.utxo_count().unwrap(), 2);
        assert!(store.verify_utxo_digest().unwrap());

        let disconnected = store.disconnect_tip().unwrap();
        assert_eq!(disconnected, b1);
        let (height, hash) = store.chain_tip().unwrap();
        assert_eq!(height, 0);
        assert_eq!(hash, genesis::genesis_hash());
        assert_eq!(store.balance_of(&genesis_pkh).unwrap(), INITIAL_REWARD);
        assert_eq!(store.utxo_count().unwrap(), 1);
        assert!(store.verify_utxo_digest().unwrap());
        // The delta is gone; the block itself remains for fork bookkeeping.
        assert!(store.get_delta(&b1.hash()).unwrap().is_none());
        assert!(store.get_block(&b1.hash()).unwrap().is_some());
    }

    #[test]
    fn in_block_chain_connects_and_reverts_cleanly() {
        let (mut store, _dir) = temp_store();
        let coinbase_txid = genesis::genesis_coinbase_txid();

        // tx_a spends the genesis coinbase; tx_b spends tx_a within the
        // same block. Only tx_b's output survives to the UTXO set.
        let tx_a = make_tx(
            &[OutPoint::new(coinbase_txid, 0)],
            INITIAL_REWARD - COIN,
            addr(0xC1),
        );
        let tx_a_out = OutPoint::new(tx_a.txid(), 0);
        let tx_b = make_tx(&[tx_a_out.clone()], INITIAL_REWARD - 2 * COIN, addr(0xC2));
        let tx_b_out = OutPoint::new(tx_b.txid(), 0);

        let b1 = make_block(
            genesis::genesis_hash(),
            1,
            genesis::GENESIS_TIMESTAMP + 600,
            vec![make_coinbase(50 * COIN, 1, addr(0xBB)), tx_a, tx_b],
        );
        let delta = store.connect_block(&b1, 1).unwrap();
        assert_eq!(delta.spent.len(), 2);
        assert_eq!(delta.created.len(), 3);

        assert!(store.get_utxo(&tx_a_out).unwrap().is_none());
        assert!(store.get_utxo(&tx_b_out).unwrap().is_some());
        assert_eq!(store.utxo_count().unwrap(), 2); // block-1 coinbase + tx_b
        assert!(store.verify_utxo_digest().unwrap());

        store.disconnect_tip().unwrap();
        assert!(store.get_utxo(&tx_a_out).unwrap().is_none());
        assert!(store.get_utxo(&tx_b_out).unwrap().is_none());
        assert!(store
            .get_utxo(&OutPoint::new(coinbase_txid, 0))
            .unwrap()
            .is_some());
        assert_eq!(store.utxo_count().unwrap(), 1);
        assert!(store.verify_utxo_digest().unwrap());
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chaindata");
        let b1 = make_block(
            genesis::genesis_hash(),
            1,
            genesis::GENESIS_TIMESTAMP + 600,
            vec![make_coinbase(50 * COIN, 1, addr(0xBB))],
        );
        {
            let mut store = RocksStore::open(&path).unwrap();
            store.connect_block(&b1, 1).unwrap();
        }
        let store = RocksStore::open(&path).unwrap();
        let (height, hash) = store.chain_tip().unwrap();
        assert_eq!(height, 1);
        assert_eq!(hash, b1.hash());
        assert_eq!(store.utxo_count().unwrap(), 2);
        assert!(store.verify_utxo_digest().unwrap());
    }

    #[test]
    fn side_blocks_do_not_touch_tip_or_utxos() {
        let (mut store, _dir) = temp_store();
        let side = make_block(
            genesis::genesis_hash(),
            1,
            genesis::GENESIS_TIMESTAMP + 700,
            vec![make_coinbase(50 * COIN, 1, addr(0xDD))],
        );
        let work = pow::block_work(pow::GENESIS_BITS) * 2u64;
        store.put_side_block(&side, work).unwrap();

        let (height, hash) = store.chain_tip().unwrap();
        assert_eq!(height, 0);
        assert_eq!(hash, genesis::genesis_hash());
        assert_eq!(store.utxo_count().unwrap(), 1);
        assert_eq!(store.get_work(&side.hash()).unwrap().unwrap(), work);
        assert!(store.get_header(&side.hash()).unwrap().is_some());
        assert!(store.get_block(&side.hash()).unwrap().is_some());
        assert!(store.get_hash_at_height(1).unwrap().is_none());
    }

    #[test]
    fn corrupt_block_read_raises_typed_error() {
        let (mut store, _dir) = temp_store();
        store.corrupt_block_bytes(&genesis::genesis_hash());
        assert!(matches!(
            store.get_block(&genesis::genesis_hash()).unwrap_err(),
            StoreError::Corrupt { .. }
        ));
    }

    #[test]
    fn digest_mismatch_detected_and_rebuilt_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chaindata");
        {
            let mut store = RocksStore::open(&path).unwrap();
            let b1 = make_block(
                genesis::genesis_hash(),
                1,
                genesis::GENESIS_TIMESTAMP + 600,
                vec![make_coinbase(50 * COIN, 1, addr(0xBB))],
            );
            store.connect_block(&b1, 1).unwrap();
            store.tamper_utxo_digest();
            assert!(!store.verify_utxo_digest().unwrap());
        }
        // Reopen: the digest mismatch triggers a rebuild from blocks.
        let store = RocksStore::open(&path).unwrap();
        assert!(store.verify_utxo_digest().unwrap());
        assert_eq!(store.utxo_count().unwrap(), 2);
    }

    #[test]
    fn missing_input_rejected_on_connect() {
        let (mut store, _dir) = temp_store();
        let bogus = make_tx(&[OutPoint::new(Hash256([0xEE; 32]), 0)], COIN, addr(0xCC));
        let b1 = make_block(
            genesis::genesis_hash(),
            1,
            genesis::GENESIS_TIMESTAMP + 600,
            vec![make_coinbase(50 * COIN, 1, addr(0xBB)), bogus],
        );
        assert!(matches!(
            store.connect_block(&b1, 1).unwrap_err(),
            EmberError::ChainState(ChainStateError::MissingUtxo(_))
        ));
        // The failed connect wrote nothing.
        assert_eq!(store.chain_tip().unwrap().0, 0);
        assert!(store.verify_utxo_digest().unwrap());
    }
}
