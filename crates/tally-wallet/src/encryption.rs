//! Passphrase key derivation and AES-256-GCM sealing.
//!
//! The master key and imported private keys are sealed with a 256-bit key
//! derived from the passphrase. Two KDFs are supported:
//!
//! | id | algorithm | n | r | p |
//! |----|-----------|---|---|---|
//! | 0 | Argon2id | memory (KiB) | iterations | lanes |
//! | 1 | BLAKE3 `derive_key` | unused | unused | unused |

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::WalletError;

/// BLAKE3 KDF context for passphrase-derived keys.
const PASSPHRASE_KDF_CONTEXT: &str = "tally 2024-06 passphrase kdf";

/// AES-GCM nonce length in bytes.
pub const IV_LEN: usize = 12;

/// AES-GCM authentication tag length.
pub const TAG_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KdfAlgorithm {
    Argon2id,
    Blake3,
}

impl KdfAlgorithm {
    pub fn id(&self) -> u8 {
        match self {
            Self::Argon2id => 0,
            Self::Blake3 => 1,
        }
    }

    pub fn from_id(id: u8) -> Result<Self, WalletError> {
        match id {
            0 => Ok(Self::Argon2id),
            1 => Ok(Self::Blake3),
            _ => Err(WalletError::Corrupt(format!("unknown kdf algorithm {id}"))),
        }
    }
}

/// KDF selection and cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: KdfAlgorithm,
    pub n: u32,
    pub r: u32,
    pub p: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            algorithm: KdfAlgorithm::Argon2id,
            n: 19_456,
            r: 2,
            p: 1,
        }
    }
}

impl KdfParams {
    /// Minimal Argon2id cost, for tests and regtest.
    pub fn light() -> Self {
        Self {
            algorithm: KdfAlgorithm::Argon2id,
            n: 64,
            r: 1,
            p: 1,
        }
    }
}

/// Derive a 256-bit cipher key from a passphrase and salt.
pub fn derive_key(
    passphrase: &[u8],
    salt: &[u8],
    params: &KdfParams,
) -> Result<Zeroizing<[u8; 32]>, WalletError> {
    let mut out = Zeroizing::new([0u8; 32]);
    match params.algorithm {
        KdfAlgorithm::Argon2id => {
            let cost = Params::new(params.n, params.r, params.p, Some(32))
                .map_err(|e| WalletError::Encryption(e.to_string()))?;
            Argon2::new(Algorithm::Argon2id, Version::V0x13, cost)
                .hash_password_into(passphrase, salt, &mut *out)
                .map_err(|e| WalletError::Encryption(e.to_string()))?;
        }
        KdfAlgorithm::Blake3 => {
            let mut ikm = Zeroizing::new(Vec::with_capacity(passphrase.len() + salt.len()));
            ikm.extend_from_slice(passphrase);
            ikm.extend_from_slice(salt);
            *out = blake3::derive_key(PASSPHRASE_KDF_CONTEXT, &ikm);
        }
    }
    Ok(out)
}

/// Fresh random IV.
pub fn random_iv() -> [u8; IV_LEN] {
    use rand::RngCore;
    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    iv
}

/// Seal `plaintext` under `key`, returning ciphertext with the tag appended.
pub fn seal(key: &[u8; 32], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, WalletError> {
    if iv.len() != IV_LEN {
        return Err(WalletError::Encryption(format!("iv must be {IV_LEN} bytes")));
    }
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| WalletError::Encryption(e.to_string()))?;
    cipher
        .encrypt(Nonce::from_slice(iv), plaintext)
        .map_err(|e| WalletError::Encryption(e.to_string()))
}

/// Open data produced by [`seal`]. A tag mismatch means the key (and so the
/// passphrase) was wrong.
pub fn open(key: &[u8; 32], iv: &[u8], ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, WalletError> {
    if iv.len() != IV_LEN {
        return Err(WalletError::Corrupt(format!("iv must be {IV_LEN} bytes")));
    }
    if ciphertext.len() < TAG_LEN {
        return Err(WalletError::Corrupt(format!(
            "ciphertext too short: {} < {TAG_LEN}",
            ciphertext.len()
        )));
    }
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| WalletError::Encryption(e.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| WalletError::InvalidPassphrase)
}
