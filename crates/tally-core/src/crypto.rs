//! Ed25519 keys and input signatures.
//!
//! A [`PrivateKey`] is a reduced scalar with a nonce prefix derived from it,
//! not a 32-byte seed. HD children in [`crate::hd`] are produced by adding
//! tweaks to the scalar, and the `hazmat` signer accepts them as is.
//!
//! Each input signs its own digest: a BLAKE3 `derive_key` hash under
//! [`SIGHASH_CONTEXT`] of the version, every prevout with its sequence,
//! every output, the lock time and the position of the input. Input
//! signatures and public keys stay out of the digest, so a wallet can sign
//! its inputs one at a time.

use curve25519_dalek::scalar::Scalar;
use ed25519_dalek::hazmat::{ExpandedSecretKey, raw_sign};
use ed25519_dalek::{Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha512;
use std::fmt;
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::types::{Hash256, Transaction};

/// BLAKE3 context deriving the signing nonce prefix from a scalar.
const NONCE_PREFIX_CONTEXT: &str = "tally 2024-06 ed25519 nonce prefix";

/// BLAKE3 context of the per-input signature digest.
pub const SIGHASH_CONTEXT: &str = "tally 2024-06 input sighash";

/// Ed25519 private key: a reduced scalar and a nonce prefix.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey {
    scalar: [u8; 32],
    prefix: [u8; 32],
}

impl PrivateKey {
    /// Build a key from scalar bytes, reducing modulo the group order.
    pub fn from_scalar(scalar: Scalar) -> Self {
        let bytes = scalar.to_bytes();
        Self {
            prefix: blake3::derive_key(NONCE_PREFIX_CONTEXT, &bytes),
            scalar: bytes,
        }
    }

    /// Parse a canonical 32-byte scalar.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidPrivateKey)?;
        let scalar: Option<Scalar> = Scalar::from_canonical_bytes(arr).into();
        match scalar {
            Some(s) if s != Scalar::ZERO => Ok(Self::from_scalar(s)),
            _ => Err(CryptoError::InvalidPrivateKey),
        }
    }

    /// Generate a random key using the OS cryptographic RNG.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut wide = [0u8; 64];
        rand::rngs::OsRng.fill_bytes(&mut wide);
        let key = Self::from_scalar(Scalar::from_bytes_mod_order_wide(&wide));
        wide.zeroize();
        key
    }

    /// Raw scalar bytes. Handle with care.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.scalar
    }

    fn expanded(&self) -> ExpandedSecretKey {
        ExpandedSecretKey {
            scalar: Scalar::from_bytes_mod_order(self.scalar),
            hash_prefix: self.prefix,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            verifying_key: VerifyingKey::from(&self.expanded()),
        }
    }

    /// Sign a message, returning the raw 64-byte Ed25519 signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        let esk = self.expanded();
        let vk = VerifyingKey::from(&esk);
        raw_sign::<Sha512>(&esk, message, &vk).to_bytes()
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Verifying half of a [`PrivateKey`]. Outputs pay to its
/// [`pubkey_hash`](Self::pubkey_hash); serde and `Display` use lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey {
    verifying_key: VerifyingKey,
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        VerifyingKey::from_bytes(bytes)
            .map(|verifying_key| Self { verifying_key })
            .map_err(|_| CryptoError::InvalidPublicKey)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    pub fn pubkey_hash(&self) -> Hash256 {
        pubkey_hash(&self.to_bytes())
    }

    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> Result<(), CryptoError> {
        self.verifying_key
            .verify(message, &ed25519_dalek::Signature::from_bytes(signature))
            .map_err(|_| CryptoError::VerificationFailed)
    }
}

impl FromStr for PublicKey {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.to_bytes()))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({self})")
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer)?
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

/// Address hash of a raw public key: plain BLAKE3.
pub fn pubkey_hash(pubkey_bytes: &[u8; 32]) -> Hash256 {
    Hash256(blake3::hash(pubkey_bytes).into())
}

fn check_index(tx: &Transaction, index: usize) -> Result<(), CryptoError> {
    if index < tx.inputs.len() {
        Ok(())
    } else {
        Err(CryptoError::InputIndexOutOfBounds {
            index,
            len: tx.inputs.len(),
        })
    }
}

/// Digest signed by input `input_index`. Counts are written as u64 LE.
pub fn signing_hash(tx: &Transaction, input_index: usize) -> Result<Hash256, CryptoError> {
    check_index(tx, input_index)?;
    let mut h = blake3::Hasher::new_derive_key(SIGHASH_CONTEXT);
    h.update(&tx.version.to_le_bytes());
    h.update(&(tx.inputs.len() as u64).to_le_bytes());
    for input in &tx.inputs {
        h.update(&input.previous_output.to_key());
        h.update(&input.sequence.to_le_bytes());
    }
    h.update(&(tx.outputs.len() as u64).to_le_bytes());
    for output in &tx.outputs {
        h.update(&output.value.to_le_bytes());
        h.update(output.pubkey_hash.as_bytes());
    }
    h.update(&tx.lock_time.to_le_bytes());
    h.update(&(input_index as u64).to_le_bytes());
    Ok(Hash256(h.finalize().into()))
}

/// Fill in the signature and public key of input `input_index`.
pub fn sign_transaction_input(
    tx: &mut Transaction,
    input_index: usize,
    key: &PrivateKey,
) -> Result<(), CryptoError> {
    let digest = signing_hash(tx, input_index)?;
    let input = &mut tx.inputs[input_index];
    input.signature = key.sign(digest.as_bytes()).to_vec();
    input.public_key = key.public_key().to_bytes().to_vec();
    Ok(())
}

/// Check that input `input_index` carries a key hashing to `owner` and a
/// valid signature by it.
pub fn verify_transaction_input(
    tx: &Transaction,
    input_index: usize,
    owner: &Hash256,
) -> Result<(), CryptoError> {
    check_index(tx, input_index)?;
    let input = &tx.inputs[input_index];
    let key_bytes: &[u8; 32] = input
        .public_key
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    let key = PublicKey::from_bytes(key_bytes)?;
    if key.pubkey_hash() != *owner {
        return Err(CryptoError::PubkeyHashMismatch);
    }
    let signature: &[u8; 64] = input
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidSignature)?;
    key.verify(signing_hash(tx, input_index)?.as_bytes(), signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OutPoint, TxInput, TxOutput};

    fn unsigned_tx(n_inputs: usize) -> Transaction {
        Transaction {
            version: 1,
            inputs: (0..n_inputs)
                .map(|i| TxInput::unsigned(OutPoint::new(Hash256([i as u8 + 1; 32]), 0)))
                .collect(),
            outputs: vec![TxOutput {
                value: 1_000,
                pubkey_hash: Hash256([0xCC; 32]),
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn sign_and_verify_message() {
        let key = PrivateKey::generate();
        let sig = key.sign(b"hello");
        assert!(key.public_key().verify(b"hello", &sig).is_ok());
        assert_eq!(
            key.public_key().verify(b"other", &sig),
            Err(CryptoError::VerificationFailed)
        );
    }

    #[test]
    fn private_key_bytes_roundtrip() {
        let key = PrivateKey::generate();
        let back = PrivateKey::from_bytes(&key.to_bytes()).unwrap();
        assert_eq!(back.public_key(), key.public_key());
        assert!(PrivateKey::from_bytes(&[0u8; 32]).is_err());
        assert!(PrivateKey::from_bytes(&[0xff; 32]).is_err());
        assert!(PrivateKey::from_bytes(&[1u8; 16]).is_err());
    }

    #[test]
    fn signing_is_deterministic() {
        let key = PrivateKey::generate();
        assert_eq!(key.sign(b"m"), key.sign(b"m"));
    }

    #[test]
    fn sign_transaction_inputs_any_order() {
        let k0 = PrivateKey::generate();
        let k1 = PrivateKey::generate();
        let mut tx = unsigned_tx(2);
        sign_transaction_input(&mut tx, 1, &k1).unwrap();
        sign_transaction_input(&mut tx, 0, &k0).unwrap();
        verify_transaction_input(&tx, 0, &k0.public_key().pubkey_hash()).unwrap();
        verify_transaction_input(&tx, 1, &k1.public_key().pubkey_hash()).unwrap();
    }

    #[test]
    fn verify_rejects_wrong_owner() {
        let key = PrivateKey::generate();
        let mut tx = unsigned_tx(1);
        sign_transaction_input(&mut tx, 0, &key).unwrap();
        assert_eq!(
            verify_transaction_input(&tx, 0, &Hash256([9; 32])),
            Err(CryptoError::PubkeyHashMismatch)
        );
    }

    #[test]
    fn verify_rejects_tampered_output() {
        let key = PrivateKey::generate();
        let mut tx = unsigned_tx(1);
        sign_transaction_input(&mut tx, 0, &key).unwrap();
        tx.outputs[0].value += 1;
        assert_eq!(
            verify_transaction_input(&tx, 0, &key.public_key().pubkey_hash()),
            Err(CryptoError::VerificationFailed)
        );
    }

    #[test]
    fn signing_hash_out_of_bounds() {
        let tx = unsigned_tx(1);
        assert_eq!(
            signing_hash(&tx, 3),
            Err(CryptoError::InputIndexOutOfBounds { index: 3, len: 1 })
        );
    }

    #[test]
    fn public_key_serde_hex() {
        let pk = PrivateKey::generate().public_key();
        let json = serde_json::to_string(&pk).unwrap();
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pk);
        assert_eq!(json, format!("\"{pk}\""));
        assert!(serde_json::from_str::<PublicKey>("\"abcd\"").is_err());
        assert_eq!("zz".parse::<PublicKey>(), Err(CryptoError::InvalidPublicKey));
    }

    #[test]
    fn digest_commits_to_sequence_not_witness() {
        let key = PrivateKey::generate();
        let mut tx = unsigned_tx(2);
        let before = signing_hash(&tx, 0).unwrap();
        sign_transaction_input(&mut tx, 1, &key).unwrap();
        assert_eq!(signing_hash(&tx, 0).unwrap(), before);
        assert_ne!(signing_hash(&tx, 1).unwrap(), before);

        tx.inputs[1].sequence = 7;
        assert_ne!(signing_hash(&tx, 0).unwrap(), before);
        assert_eq!(
            verify_transaction_input(&tx, 1, &key.public_key().pubkey_hash()),
            Err(CryptoError::VerificationFailed)
        );
    }
}
