//! Canonical wire encoding for protocol structures.
//!
//! The canonical form is what gets hashed, measured against size limits, and
//! persisted for blocks: fixed field order, big-endian integers, and
//! `u32`-length-prefixed variable fields. Decoding is strict — trailing
//! bytes, out-of-bounds lengths, and non-0/1 booleans are rejected, so a
//! given structure has exactly one accepted encoding.

use crate::address::{Address, Network};
use crate::constants::{MAX_INPUTS, MAX_OUTPUTS};
use crate::error::CodecError;
use crate::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxInput, TxOutput};

/// Canonical header size in bytes: 4 + 32 + 32 + 8 + 4 + 8 + 8.
pub const HEADER_SIZE: usize = 96;

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn put_var_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn put_address(out: &mut Vec<u8>, address: &Address) {
    out.push(address.network.version_byte());
    out.extend_from_slice(address.pubkey_hash.as_bytes());
}

fn put_output(out: &mut Vec<u8>, output: &TxOutput) {
    out.extend_from_slice(&output.value.to_be_bytes());
    put_address(out, &output.recipient);
}

fn put_tx(out: &mut Vec<u8>, tx: &Transaction, with_witness: bool) {
    out.extend_from_slice(&tx.version.to_be_bytes());
    out.extend_from_slice(&(tx.inputs.len() as u32).to_be_bytes());
    for input in &tx.inputs {
        out.extend_from_slice(input.previous_output.txid.as_bytes());
        out.extend_from_slice(&input.previous_output.index.to_be_bytes());
        if with_witness {
            put_var_bytes(out, &input.signature);
            put_var_bytes(out, &input.public_key);
        } else {
            put_var_bytes(out, &[]);
            put_var_bytes(out, &[]);
        }
    }
    out.extend_from_slice(&(tx.outputs.len() as u32).to_be_bytes());
    for output in &tx.outputs {
        put_output(out, output);
    }
    out.extend_from_slice(&tx.lock_time.to_be_bytes());
    out.extend_from_slice(&tx.nonce.to_be_bytes());
    out.push(tx.replaceable as u8);
}

/// Full canonical transaction encoding, including signatures and public keys.
pub fn tx_bytes(tx: &Transaction) -> Vec<u8> {
    let mut out = Vec::new();
    put_tx(&mut out, tx, true);
    out
}

/// Canonical transaction encoding with every signature and public-key field
/// empty. This is the preimage of the txid and the base of every sighash.
pub fn tx_signing_bytes(tx: &Transaction) -> Vec<u8> {
    let mut out = Vec::new();
    put_tx(&mut out, tx, false);
    out
}

/// Canonical fixed-layout header encoding ([`HEADER_SIZE`] bytes).
pub fn header_bytes(header: &BlockHeader) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE);
    out.extend_from_slice(&header.version.to_be_bytes());
    out.extend_from_slice(header.prev_hash.as_bytes());
    out.extend_from_slice(header.merkle_root.as_bytes());
    out.extend_from_slice(&header.timestamp.to_be_bytes());
    out.extend_from_slice(&header.bits.to_be_bytes());
    out.extend_from_slice(&header.nonce.to_be_bytes());
    out.extend_from_slice(&header.height.to_be_bytes());
    out
}

/// Canonical block encoding: header, transaction count, transactions.
pub fn block_bytes(block: &Block) -> Vec<u8> {
    let mut out = header_bytes(&block.header);
    out.extend_from_slice(&(block.transactions.len() as u32).to_be_bytes());
    for tx in &block.transactions {
        put_tx(&mut out, tx, true);
    }
    out
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEof(self.pos));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn bool(&mut self) -> Result<bool, CodecError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidBool(other)),
        }
    }

    fn hash(&mut self) -> Result<Hash256, CodecError> {
        Ok(Hash256(self.take(32)?.try_into().unwrap()))
    }

    fn var_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.u32()? as usize;
        if len > self.remaining() {
            return Err(CodecError::LengthOutOfBounds {
                len,
                remaining: self.remaining(),
            });
        }
        Ok(self.take(len)?.to_vec())
    }

    fn count(&mut self, max: usize) -> Result<usize, CodecError> {
        let count = self.u32()? as usize;
        if count > max {
            return Err(CodecError::CountOutOfBounds { count, max });
        }
        Ok(count)
    }

    fn address(&mut self) -> Result<Address, CodecError> {
        let byte = self.u8()?;
        let network = Network::from_version_byte(byte)
            .map_err(|_| CodecError::UnknownNetwork(byte))?;
        let pubkey_hash = self.hash()?;
        Ok(Address::new(network, pubkey_hash))
    }

    fn transaction(&mut self) -> Result<Transaction, CodecError> {
        let version = self.u32()?;
        let input_count = self.count(MAX_INPUTS)?;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            let txid = self.hash()?;
            let index = self.u32()?;
            let signature = self.var_bytes()?;
            let public_key = self.var_bytes()?;
            inputs.push(TxInput {
                previous_output: OutPoint::new(txid, index),
                signature,
                public_key,
            });
        }
        let output_count = self.count(MAX_OUTPUTS)?;
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            let value = self.u64()?;
            let recipient = self.address()?;
            outputs.push(TxOutput { value, recipient });
        }
        let lock_time = self.u64()?;
        let nonce = self.u64()?;
        let replaceable = self.bool()?;
        Ok(Transaction {
            version,
            inputs,
            outputs,
            lock_time,
            nonce,
            replaceable,
        })
    }

    fn header(&mut self) -> Result<BlockHeader, CodecError> {
        Ok(BlockHeader {
            version: self.u32()?,
            prev_hash: self.hash()?,
            merkle_root: self.hash()?,
            timestamp: self.u64()?,
            bits: self.u32()?,
            nonce: self.u64()?,
            height: self.u64()?,
        })
    }

    fn finish(self) -> Result<(), CodecError> {
        if self.remaining() != 0 {
            return Err(CodecError::TrailingBytes(self.remaining()));
        }
        Ok(())
    }
}

/// Decode a canonical transaction, rejecting trailing bytes.
pub fn decode_tx(data: &[u8]) -> Result<Transaction, CodecError> {
    let mut reader = Reader::new(data);
    let tx = reader.transaction()?;
    reader.finish()?;
    Ok(tx)
}

/// Decode a canonical header, rejecting trailing bytes.
pub fn decode_header(data: &[u8]) -> Result<BlockHeader, CodecError> {
    let mut reader = Reader::new(data);
    let header = reader.header()?;
    reader.finish()?;
    Ok(header)
}

/// Decode a canonical block, rejecting trailing bytes.
///
/// The transaction count is bounded by the remaining byte length, so a
/// hostile length prefix cannot force a huge allocation.
pub fn decode_block(data: &[u8]) -> Result<Block, CodecError> {
    let mut reader = Reader::new(data);
    let header = reader.header()?;
    let tx_count = reader.count(reader.remaining())?;
    let mut transactions = Vec::with_capacity(tx_count.min(1024));
    for _ in 0..tx_count {
        transactions.push(reader.transaction()?);
    }
    reader.finish()?;
    Ok(Block {
        header,
        transactions,
    })
}
