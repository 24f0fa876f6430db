//! Base58Check addresses.
//!
//! An address is the SHA-256 hash of a compressed public key prefixed with a
//! network version byte. The string form is Base58Check: version byte, the
//! 32-byte hash, and a 4-byte double-SHA-256 checksum. Mainnet and testnet
//! are distinguished by the version byte, so an address pasted into the
//! wrong network fails to parse rather than silently misdirecting funds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AddressError;
use crate::types::{sha256d, Hash256};

/// Which network an address belongs to, encoded as the leading version byte.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    /// The version byte placed in front of the pubkey hash.
    pub fn version_byte(self) -> u8 {
        match self {
            Network::Mainnet => 0x37,
            Network::Testnet => 0x7f,
        }
    }

    pub fn from_version_byte(byte: u8) -> Result<Self, AddressError> {
        match byte {
            0x37 => Ok(Network::Mainnet),
            0x7f => Ok(Network::Testnet),
            other => Err(AddressError::UnknownNetwork(other)),
        }
    }
}

/// A recipient address: network byte plus SHA-256 of the public key.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub struct Address {
    pub network: Network,
    pub pubkey_hash: Hash256,
}

impl Address {
    pub fn new(network: Network, pubkey_hash: Hash256) -> Self {
        Self { network, pubkey_hash }
    }

    /// Encode as Base58Check: `base58(version || hash || checksum4)`.
    pub fn encode(&self) -> String {
        let mut payload = Vec::with_capacity(37);
        payload.push(self.network.version_byte());
        payload.extend_from_slice(self.pubkey_hash.as_bytes());
        let checksum = sha256d(&payload);
        payload.extend_from_slice(&checksum.as_bytes()[0..4]);
        bs58::encode(payload).into_string()
    }

    /// Decode from Base58Check, verifying length, checksum, and network byte.
    pub fn decode(s: &str) -> Result<Self, AddressError> {
        let payload = bs58::decode(s)
            .into_vec()
            .map_err(|e| AddressError::InvalidBase58(e.to_string()))?;
        if payload.len() != 37 {
            return Err(AddressError::InvalidLength(payload.len()));
        }
        let (body, checksum) = payload.split_at(33);
        let expected = sha256d(body);
        if checksum != &expected.as_bytes()[0..4] {
            return Err(AddressError::InvalidChecksum);
        }
        let network = Network::from_version_byte(body[0])?;
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&body[1..33]);
        Ok(Self {
            network,
            pubkey_hash: Hash256(hash),
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}
