//! Hierarchical deterministic keys over Ed25519.
//!
//! Normal (non-hardened) children are derived additively so that a public
//! parent can derive the same child public keys as its private counterpart:
//!
//! ```text
//! (t, c') = BLAKE3-XOF(ctx_normal, chain || A || index)
//! child private = a + t        child public = A + t·G
//! ```
//!
//! Hardened children (index >= [`HARDENED`]) mix in the private scalar and are
//! only derivable from a private parent.

use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{PrivateKey, PublicKey};
use crate::error::CryptoError;
use crate::types::Hash256;

/// First hardened child index.
pub const HARDENED: u32 = 0x8000_0000;

const MASTER_CONTEXT: &str = "tally 2024-06 hd master key";
const NORMAL_CONTEXT: &str = "tally 2024-06 hd normal child";
const HARDENED_CONTEXT: &str = "tally 2024-06 hd hardened child";

/// Expand `parts` into a reduced scalar and a fresh chain code.
fn expand(context: &str, parts: &[&[u8]]) -> (Scalar, [u8; 32]) {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 96];
    hasher.finalize_xof().fill(&mut out);

    let mut wide = [0u8; 64];
    wide.copy_from_slice(&out[..64]);
    let mut chain_code = [0u8; 32];
    chain_code.copy_from_slice(&out[64..]);

    let scalar = Scalar::from_bytes_mod_order_wide(&wide);
    wide.zeroize();
    out.zeroize();
    (scalar, chain_code)
}

/// Extended private key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct HdPrivateKey {
    chain_code: [u8; 32],
    key: [u8; 32],
}

impl HdPrivateKey {
    /// Derive the master key from seed material (e.g. a BIP-39 seed).
    pub fn from_seed(seed: &[u8]) -> Self {
        let (scalar, chain_code) = expand(MASTER_CONTEXT, &[seed]);
        Self {
            chain_code,
            key: scalar.to_bytes(),
        }
    }

    /// Generate a random master key.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut seed = [0u8; 64];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        let key = Self::from_seed(&seed);
        seed.zeroize();
        key
    }

    /// Rebuild from a stored chain code and canonical scalar.
    pub fn from_parts(chain_code: [u8; 32], key: [u8; 32]) -> Result<Self, CryptoError> {
        let scalar: Option<Scalar> = Scalar::from_canonical_bytes(key).into();
        if scalar.is_none() {
            return Err(CryptoError::InvalidPrivateKey);
        }
        Ok(Self { chain_code, key })
    }

    pub fn chain_code(&self) -> &[u8; 32] {
        &self.chain_code
    }

    pub fn key_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    fn scalar(&self) -> Scalar {
        Scalar::from_bytes_mod_order(self.key)
    }

    fn public_point(&self) -> [u8; 32] {
        EdwardsPoint::mul_base(&self.scalar()).compress().to_bytes()
    }

    /// Derive child `index`; indexes at or above [`HARDENED`] are hardened.
    pub fn derive(&self, index: u32) -> Self {
        let idx = index.to_le_bytes();
        if index >= HARDENED {
            let (scalar, chain_code) =
                expand(HARDENED_CONTEXT, &[&self.chain_code, &self.key, &idx]);
            return Self {
                chain_code,
                key: scalar.to_bytes(),
            };
        }
        let public = self.public_point();
        let (tweak, chain_code) = expand(NORMAL_CONTEXT, &[&self.chain_code, &public, &idx]);
        Self {
            chain_code,
            key: (self.scalar() + tweak).to_bytes(),
        }
    }

    pub fn derive_path(&self, path: &[u32]) -> Self {
        path.iter().fold(self.clone(), |key, &index| key.derive(index))
    }

    /// The extended public key for this node.
    pub fn to_public(&self) -> HdPublicKey {
        HdPublicKey {
            chain_code: self.chain_code,
            key: self.public_point(),
        }
    }

    /// The signing key for this node.
    pub fn private_key(&self) -> PrivateKey {
        PrivateKey::from_scalar(self.scalar())
    }
}

impl fmt::Debug for HdPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HdPrivateKey")
            .field("public", &self.to_public())
            .finish_non_exhaustive()
    }
}

/// Extended public key: chain code plus compressed Edwards point.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HdPublicKey {
    chain_code: [u8; 32],
    key: [u8; 32],
}

impl HdPublicKey {
    pub const SIZE: usize = 64;

    pub fn from_parts(chain_code: [u8; 32], key: [u8; 32]) -> Result<Self, CryptoError> {
        CompressedEdwardsY(key)
            .decompress()
            .ok_or(CryptoError::InvalidPublicKey)?;
        Ok(Self { chain_code, key })
    }

    pub fn from_bytes(bytes: &[u8; 64]) -> Result<Self, CryptoError> {
        let mut chain_code = [0u8; 32];
        let mut key = [0u8; 32];
        chain_code.copy_from_slice(&bytes[..32]);
        key.copy_from_slice(&bytes[32..]);
        Self::from_parts(chain_code, key)
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.chain_code);
        out[32..].copy_from_slice(&self.key);
        out
    }

    /// Derive non-hardened child `index`.
    pub fn derive(&self, index: u32) -> Result<Self, CryptoError> {
        if index >= HARDENED {
            return Err(CryptoError::HardenedFromPublic);
        }
        let point = CompressedEdwardsY(self.key)
            .decompress()
            .ok_or(CryptoError::InvalidPublicKey)?;
        let (tweak, chain_code) =
            expand(NORMAL_CONTEXT, &[&self.chain_code, &self.key, &index.to_le_bytes()]);
        let child = point + EdwardsPoint::mul_base(&tweak);
        Ok(Self {
            chain_code,
            key: child.compress().to_bytes(),
        })
    }

    pub fn public_key(&self) -> Result<PublicKey, CryptoError> {
        PublicKey::from_bytes(&self.key)
    }

    pub fn key_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    pub fn pubkey_hash(&self) -> Hash256 {
        crate::crypto::pubkey_hash(&self.key)
    }
}

impl fmt::Debug for HdPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HdPublicKey({})", hex::encode(self.key))
    }
}
