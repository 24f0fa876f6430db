//! ECDSA (secp256k1) operations for the Ember protocol.
//!
//! Key generation, per-input transaction signing, and signature
//! verification, built on `k256` with RFC6979 deterministic nonces.
//!
//! # Signing scheme
//!
//! Each input signs a **sighash** of
//! `SHA-256(canonical_tx_without_signatures || input_index || prev_amount)`.
//! Committing the input index binds the signature to its position; committing
//! the spent output's amount prevents value-tampering replay. Signatures and
//! public keys are excluded from the preimage so inputs can be signed
//! independently in any order.
//!
//! Only low-S signatures are accepted; a high-S encoding of an otherwise
//! valid signature is rejected as non-canonical.

use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use std::fmt;

use crate::address::{Address, Network};
use crate::codec;
use crate::error::CryptoError;
use crate::types::{sha256, Hash256, Transaction, UtxoEntry};

/// Length of a compressed SEC1 public key.
pub const PUBLIC_KEY_LEN: usize = 33;
/// Length of a compact ECDSA signature.
pub const SIGNATURE_LEN: usize = 64;

/// secp256k1 keypair for signing transaction inputs.
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a random keypair using the OS cryptographic RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut rand::rngs::OsRng),
        }
    }

    /// Create a keypair from 32-byte secret scalar material.
    ///
    /// Fails for the zero scalar and values at or above the curve order.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let signing_key =
            SigningKey::from_slice(bytes).map_err(|_| CryptoError::InvalidSecretKey)?;
        Ok(Self { signing_key })
    }

    /// The raw secret scalar bytes. Handle with care.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes().into()
    }

    /// Derive the public key for this keypair.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            verifying_key: *self.signing_key.verifying_key(),
        }
    }

    /// The address of this keypair on the given network.
    pub fn address(&self, network: Network) -> Address {
        self.public_key().address(network)
    }

    /// Sign a 32-byte digest, returning a 64-byte compact low-S signature.
    pub fn sign_digest(&self, digest: &Hash256) -> [u8; 64] {
        let signature: Signature = self
            .signing_key
            .sign_prehash(digest.as_bytes())
            .expect("prehash signing of 32 bytes is infallible");
        let signature = signature.normalize_s().unwrap_or(signature);
        signature.to_bytes().into()
    }
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        Self {
            signing_key: self.signing_key.clone(),
        }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// secp256k1 public key for verifying signatures and deriving addresses.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    verifying_key: VerifyingKey,
}

impl PublicKey {
    /// Parse a compressed SEC1 public key (33 bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != PUBLIC_KEY_LEN {
            return Err(CryptoError::InvalidPublicKey);
        }
        let verifying_key =
            VerifyingKey::from_sec1_bytes(bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self { verifying_key })
    }

    /// The compressed SEC1 encoding (33 bytes).
    pub fn to_bytes(&self) -> [u8; 33] {
        self.verifying_key
            .to_encoded_point(true)
            .as_bytes()
            .try_into()
            .expect("compressed SEC1 point is 33 bytes")
    }

    /// SHA-256 of the compressed public key; the payload of an [`Address`].
    pub fn pubkey_hash(&self) -> Hash256 {
        sha256(&self.to_bytes())
    }

    /// The address of this key on the given network.
    pub fn address(&self, network: Network) -> Address {
        Address::new(network, self.pubkey_hash())
    }

    /// Verify a compact signature over a 32-byte digest.
    pub fn verify_digest(&self, digest: &Hash256, signature: &[u8; 64]) -> Result<(), CryptoError> {
        let signature =
            Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
        if signature.normalize_s().is_some() {
            return Err(CryptoError::NonCanonicalSignature);
        }
        self.verifying_key
            .verify_prehash(digest.as_bytes(), &signature)
            .map_err(|_| CryptoError::VerificationFailed)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.to_bytes()))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

/// Compute the sighash for one input of a transaction.
///
/// `prev_amount` is the value of the output being spent. The preimage is
/// the signature-free canonical transaction encoding followed by the input
/// index (u32 BE) and the amount (u64 BE).
pub fn sighash(
    tx: &Transaction,
    input_index: usize,
    prev_amount: u64,
) -> Result<Hash256, CryptoError> {
    if input_index >= tx.inputs.len() {
        return Err(CryptoError::InputIndexOutOfBounds {
            index: input_index,
            len: tx.inputs.len(),
        });
    }
    let mut data = codec::tx_signing_bytes(tx);
    data.extend_from_slice(&(input_index as u32).to_be_bytes());
    data.extend_from_slice(&prev_amount.to_be_bytes());
    Ok(sha256(&data))
}

/// Sign a transaction input in place.
///
/// Computes the sighash for the input, signs it, and writes the signature
/// and compressed public key into the input.
pub fn sign_input(
    tx: &mut Transaction,
    input_index: usize,
    prev_amount: u64,
    keypair: &KeyPair,
) -> Result<(), CryptoError> {
    let digest = sighash(tx, input_index, prev_amount)?;
    let signature = keypair.sign_digest(&digest);
    tx.inputs[input_index].signature = signature.to_vec();
    tx.inputs[input_index].public_key = keypair.public_key().to_bytes().to_vec();
    Ok(())
}

/// Verify a transaction input against the UTXO it spends.
///
/// Checks, in order:
/// 1. the input carries a 33-byte public key that parses as a curve point,
/// 2. the key hashes to the UTXO's recipient address,
/// 3. the 64-byte compact signature is canonical (low-S) and verifies
///    against the sighash bound to this input's position and the UTXO value.
pub fn verify_input(
    tx: &Transaction,
    input_index: usize,
    utxo: &UtxoEntry,
) -> Result<(), CryptoError> {
    if input_index >= tx.inputs.len() {
        return Err(CryptoError::InputIndexOutOfBounds {
            index: input_index,
            len: tx.inputs.len(),
        });
    }
    let input = &tx.inputs[input_index];

    let public_key = PublicKey::from_bytes(&input.public_key)?;
    if public_key.pubkey_hash() != utxo.output.recipient.pubkey_hash {
        return Err(CryptoError::AddressMismatch);
    }

    let signature: [u8; 64] = input
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidSignature)?;

    let digest = sighash(tx, input_index, utxo.output.value)?;
    public_key.verify_digest(&digest, &signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::COIN;
    use crate::types::{OutPoint, TxInput, TxOutput};

    fn unsigned_tx(recipient: Address) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::new(Hash256([0x11; 32]), 0),
                signature: vec![],
                public_key: vec![],
            }],
            outputs: vec![TxOutput {
                value: 49 * COIN,
                recipient,
            }],
            lock_time: 0,
            nonce: 0,
            replaceable: false,
        }
    }

    fn utxo_for(kp: &KeyPair, value: u64) -> UtxoEntry {
        UtxoEntry {
            output: TxOutput {
                value,
                recipient: kp.address(Network::Mainnet),
            },
            height: 0,
            is_coinbase: false,
        }
    }

    // --- KeyPair ---

    #[test]
    fn generate_unique_keys() {
        let kp1 = KeyPair::generate();
        let kp2 = KeyPair::generate();
        assert_ne!(kp1.public_key().to_bytes(), kp2.public_key().to_bytes());
    }

    #[test]
    fn from_secret_deterministic() {
        let kp1 = KeyPair::from_secret_bytes(&[7u8; 32]).unwrap();
        let kp2 = KeyPair::from_secret_bytes(&[7u8; 32]).unwrap();
        assert_eq!(kp1.public_key(), kp2.public_key());
        assert_eq!(kp1.secret_bytes(), kp2.secret_bytes());
    }

    #[test]
    fn zero_secret_rejected() {
        assert_eq!(
            KeyPair::from_secret_bytes(&[0u8; 32]).unwrap_err(),
            CryptoError::InvalidSecretKey
        );
    }

    #[test]
    fn debug_hides_secret() {
        let kp = KeyPair::generate();
        let debug = format!("{kp:?}");
        assert!(!debug.contains(&hex::encode(kp.secret_bytes())));
    }

    // --- PublicKey ---

    #[test]
    fn pubkey_roundtrip() {
        let kp = KeyPair::generate();
        let pk = kp.public_key();
        let parsed = PublicKey::from_bytes(&pk.to_bytes()).unwrap();
        assert_eq!(parsed, pk);
    }

    #[test]
    fn pubkey_wrong_length_rejected() {
        assert_eq!(
            PublicKey::from_bytes(&[2u8; 32]).unwrap_err(),
            CryptoError::InvalidPublicKey
        );
    }

    #[test]
    fn pubkey_invalid_point_rejected() {
        // 0x02 prefix with an x coordinate that is not on the curve.
        let mut bytes = [0xFFu8; 33];
        bytes[0] = 0x02;
        assert_eq!(
            PublicKey::from_bytes(&bytes).unwrap_err(),
            CryptoError::InvalidPublicKey
        );
    }

    #[test]
    fn address_embeds_pubkey_hash() {
        let kp = KeyPair::generate();
        let addr = kp.address(Network::Mainnet);
        assert_eq!(addr.pubkey_hash, kp.public_key().pubkey_hash());
    }

    // --- sighash ---

    #[test]
    fn sighash_deterministic() {
        let kp = KeyPair::generate();
        let tx = unsigned_tx(kp.address(Network::Mainnet));
        assert_eq!(
            sighash(&tx, 0, 50 * COIN).unwrap(),
            sighash(&tx, 0, 50 * COIN).unwrap()
        );
    }

    #[test]
    fn sighash_commits_prev_amount() {
        let kp = KeyPair::generate();
        let tx = unsigned_tx(kp.address(Network::Mainnet));
        assert_ne!(
            sighash(&tx, 0, 50 * COIN).unwrap(),
            sighash(&tx, 0, 50 * COIN + 1).unwrap()
        );
    }

    #[test]
    fn sighash_commits_input_index() {
        let kp = KeyPair::generate();
        let mut tx = unsigned_tx(kp.address(Network::Mainnet));
        tx.inputs.push(TxInput {
            previous_output: OutPoint::new(Hash256([0x22; 32]), 1),
            signature: vec![],
            public_key: vec![],
        });
        assert_ne!(
            sighash(&tx, 0, 50 * COIN).unwrap(),
            sighash(&tx, 1, 50 * COIN).unwrap()
        );
    }

    #[test]
    fn sighash_ignores_existing_signatures() {
        let kp = KeyPair::generate();
        let tx1 = unsigned_tx(kp.address(Network::Mainnet));
        let mut tx2 = tx1.clone();
        tx2.inputs[0].signature = vec![0xAA; 64];
        tx2.inputs[0].public_key = vec![0xBB; 33];
        assert_eq!(
            sighash(&tx1, 0, 50 * COIN).unwrap(),
            sighash(&tx2, 0, 50 * COIN).unwrap()
        );
    }

    #[test]
    fn sighash_out_of_bounds() {
        let kp = KeyPair::generate();
        let tx = unsigned_tx(kp.address(Network::Mainnet));
        assert_eq!(
            sighash(&tx, 1, 0).unwrap_err(),
            CryptoError::InputIndexOutOfBounds { index: 1, len: 1 }
        );
    }

    // --- sign / verify ---

    #[test]
    fn sign_verify_roundtrip() {
        let kp = KeyPair::generate();
        let mut tx = unsigned_tx(kp.address(Network::Mainnet));
        sign_input(&mut tx, 0, 50 * COIN, &kp).unwrap();

        assert_eq!(tx.inputs[0].signature.len(), SIGNATURE_LEN);
        assert_eq!(tx.inputs[0].public_key.len(), PUBLIC_KEY_LEN);
        assert!(verify_input(&tx, 0, &utxo_for(&kp, 50 * COIN)).is_ok());
    }

    #[test]
    fn verify_rejects_wrong_owner() {
        let kp_signer = KeyPair::generate();
        let kp_owner = KeyPair::generate();
        let mut tx = unsigned_tx(kp_signer.address(Network::Mainnet));
        sign_input(&mut tx, 0, 50 * COIN, &kp_signer).unwrap();

        assert_eq!(
            verify_input(&tx, 0, &utxo_for(&kp_owner, 50 * COIN)).unwrap_err(),
            CryptoError::AddressMismatch
        );
    }

    #[test]
    fn verify_rejects_tampered_output() {
        let kp = KeyPair::generate();
        let mut tx = unsigned_tx(kp.address(Network::Mainnet));
        sign_input(&mut tx, 0, 50 * COIN, &kp).unwrap();
        tx.outputs[0].value += 1;

        assert_eq!(
            verify_input(&tx, 0, &utxo_for(&kp, 50 * COIN)).unwrap_err(),
            CryptoError::VerificationFailed
        );
    }

    #[test]
    fn verify_rejects_tampered_prev_amount() {
        let kp = KeyPair::generate();
        let mut tx = unsigned_tx(kp.address(Network::Mainnet));
        sign_input(&mut tx, 0, 50 * COIN, &kp).unwrap();

        // The UTXO claims a different value than the one signed.
        assert_eq!(
            verify_input(&tx, 0, &utxo_for(&kp, 50 * COIN + 1)).unwrap_err(),
            CryptoError::VerificationFailed
        );
    }

    #[test]
    fn verify_rejects_tampered_outpoint() {
        let kp = KeyPair::generate();
        let mut tx = unsigned_tx(kp.address(Network::Mainnet));
        sign_input(&mut tx, 0, 50 * COIN, &kp).unwrap();
        tx.inputs[0].previous_output.index = 99;

        assert_eq!(
            verify_input(&tx, 0, &utxo_for(&kp, 50 * COIN)).unwrap_err(),
            CryptoError::VerificationFailed
        );
    }

    #[test]
    fn verify_rejects_bit_flipped_signature() {
        let kp = KeyPair::generate();
        let mut tx = unsigned_tx(kp.address(Network::Mainnet));
        sign_input(&mut tx, 0, 50 * COIN, &kp).unwrap();
        tx.inputs[0].signature[10] ^= 0x01;

        let err = verify_input(&tx, 0, &utxo_for(&kp, 50 * COIN)).unwrap_err();
        assert!(matches!(
            err,
            CryptoError::VerificationFailed | CryptoError::InvalidSignature
        ));
    }

    #[test]
    fn verify_rejects_short_signature() {
        let kp = KeyPair::generate();
        let mut tx = unsigned_tx(kp.address(Network::Mainnet));
        sign_input(&mut tx, 0, 50 * COIN, &kp).unwrap();
        tx.inputs[0].signature.truncate(63);

        assert_eq!(
            verify_input(&tx, 0, &utxo_for(&kp, 50 * COIN)).unwrap_err(),
            CryptoError::InvalidSignature
        );
    }

    #[test]
    fn sign_multiple_inputs_any_order() {
        let kp1 = KeyPair::generate();
        let kp2 = KeyPair::generate();
        let mut tx = Transaction {
            version: 1,
            inputs: vec![
                TxInput {
                    previous_output: OutPoint::new(Hash256([0x11; 32]), 0),
                    signature: vec![],
                    public_key: vec![],
                },
                TxInput {
                    previous_output: OutPoint::new(Hash256([0x22; 32]), 1),
                    signature: vec![],
                    public_key: vec![],
                },
            ],
            outputs: vec![TxOutput {
                value: 90 * COIN,
                recipient: kp1.address(Network::Mainnet),
            }],
            lock_time: 0,
            nonce: 0,
            replaceable: false,
        };

        sign_input(&mut tx, 1, 50 * COIN, &kp2).unwrap();
        sign_input(&mut tx, 0, 50 * COIN, &kp1).unwrap();

        assert!(verify_input(&tx, 0, &utxo_for(&kp1, 50 * COIN)).is_ok());
        assert!(verify_input(&tx, 1, &utxo_for(&kp2, 50 * COIN)).is_ok());
    }
}
