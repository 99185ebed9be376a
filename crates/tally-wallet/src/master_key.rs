//! Wallet master key, optionally sealed under a passphrase.
//!
//! Raw layout:
//!
//! ```text
//! encrypted: u8 1 | varbytes iv | varbytes ciphertext | u8 alg | u32 n | u32 r | u32 p
//! plain:     u8 0 | 32 chain code | 32 private key | u8 has mnemonic [| varstr mnemonic]
//! ```
//!
//! The ciphertext seals the plain body (everything after the flag). The IV
//! doubles as the KDF salt.

use std::time::{Duration, Instant};

use bytes::BufMut;
use tally_core::encoding::{Reader, put_var_bytes, put_var_str};
use tally_core::hd::HdPrivateKey;
use zeroize::Zeroizing;

use crate::encryption::{KdfAlgorithm, KdfParams, derive_key, open, random_iv, seal};
use crate::error::WalletError;

pub struct MasterKey {
    encrypted: bool,
    iv: Vec<u8>,
    ciphertext: Vec<u8>,
    kdf: KdfParams,
    key: Option<HdPrivateKey>,
    mnemonic: Option<Zeroizing<String>>,
    /// Cipher key kept while unlocked, for sealing imported keys.
    aes_key: Option<Zeroizing<[u8; 32]>>,
    until: Option<Instant>,
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("encrypted", &self.encrypted)
            .field("unlocked", &self.key.is_some())
            .finish_non_exhaustive()
    }
}

impl MasterKey {
    pub fn from_key(key: HdPrivateKey, mnemonic: Option<Zeroizing<String>>) -> Self {
        Self {
            encrypted: false,
            iv: Vec::new(),
            ciphertext: Vec::new(),
            kdf: KdfParams::default(),
            key: Some(key),
            mnemonic,
            aes_key: None,
            until: None,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Wipe the decrypted key once its unlock window has passed.
    fn expire(&mut self) {
        if let Some(until) = self.until {
            if Instant::now() >= until {
                self.lock();
            }
        }
    }

    pub fn is_unlocked(&mut self) -> bool {
        self.expire();
        self.key.is_some()
    }

    pub fn key(&mut self) -> Result<&HdPrivateKey, WalletError> {
        self.expire();
        self.key.as_ref().ok_or(WalletError::Locked)
    }

    pub fn mnemonic(&mut self) -> Result<Option<&str>, WalletError> {
        self.expire();
        if self.key.is_none() {
            return Err(WalletError::Locked);
        }
        Ok(self.mnemonic.as_ref().map(|m| m.as_str()))
    }

    /// Decrypt the key for `timeout` (forever when `None`). Unlocking an
    /// unlocked key only restarts the timer; the passphrase is not checked.
    pub fn unlock(&mut self, passphrase: &[u8], timeout: Option<Duration>) -> Result<(), WalletError> {
        if !self.encrypted {
            return Ok(());
        }
        if self.is_unlocked() {
            self.until = timeout.map(|t| Instant::now() + t);
            return Ok(());
        }
        let aes_key = derive_key(passphrase, &self.iv, &self.kdf)?;
        let body = open(&aes_key, &self.iv, &self.ciphertext)?;
        let (key, mnemonic) = read_body(&mut Reader::new(&body))?;
        self.key = Some(key);
        self.mnemonic = mnemonic;
        self.aes_key = Some(aes_key);
        self.until = timeout.map(|t| Instant::now() + t);
        Ok(())
    }

    /// Wipe decrypted material. No effect on an unencrypted key.
    pub fn lock(&mut self) {
        if !self.encrypted {
            return;
        }
        self.key = None;
        self.mnemonic = None;
        self.aes_key = None;
        self.until = None;
    }

    /// Seal the key under `passphrase` and lock it. Returns the cipher key
    /// so the caller can seal imported keys with it.
    pub fn encrypt(
        &mut self,
        passphrase: &[u8],
        kdf: KdfParams,
    ) -> Result<Zeroizing<[u8; 32]>, WalletError> {
        if self.encrypted {
            return Err(WalletError::InvalidState("master key already encrypted".into()));
        }
        let key = self.key.as_ref().ok_or(WalletError::Locked)?;
        let mut body = Zeroizing::new(Vec::with_capacity(66));
        write_body(&mut *body, key, self.mnemonic.as_deref().map(String::as_str));

        let iv = random_iv();
        let aes_key = derive_key(passphrase, &iv, &kdf)?;
        self.ciphertext = seal(&aes_key, &iv, &body)?;
        self.iv = iv.to_vec();
        self.kdf = kdf;
        self.encrypted = true;
        self.lock();
        Ok(aes_key)
    }

    /// Remove the passphrase. Returns the old cipher key so the caller can
    /// open imported keys sealed with it.
    pub fn decrypt(&mut self, passphrase: &[u8]) -> Result<Zeroizing<[u8; 32]>, WalletError> {
        if !self.encrypted {
            return Err(WalletError::InvalidState("master key is not encrypted".into()));
        }
        self.unlock(passphrase, None)?;
        let aes_key = self.aes_key.take().ok_or(WalletError::Locked)?;
        self.encrypted = false;
        self.iv.clear();
        self.ciphertext.clear();
        self.until = None;
        Ok(aes_key)
    }

    /// Seal `data` with the unlocked cipher key.
    pub fn encipher(&mut self, data: &[u8], iv: &[u8]) -> Result<Vec<u8>, WalletError> {
        self.expire();
        let aes_key = self.aes_key.as_ref().ok_or(WalletError::Locked)?;
        seal(aes_key, iv, data)
    }

    pub fn decipher(&mut self, data: &[u8], iv: &[u8]) -> Result<Zeroizing<Vec<u8>>, WalletError> {
        self.expire();
        let aes_key = self.aes_key.as_ref().ok_or(WalletError::Locked)?;
        open(aes_key, iv, data)
    }

    pub fn to_raw(&self) -> Result<Vec<u8>, WalletError> {
        let mut out = Vec::with_capacity(96);
        if self.encrypted {
            out.put_u8(1);
            put_var_bytes(&mut out, &self.iv);
            put_var_bytes(&mut out, &self.ciphertext);
            out.put_u8(self.kdf.algorithm.id());
            out.put_u32_le(self.kdf.n);
            out.put_u32_le(self.kdf.r);
            out.put_u32_le(self.kdf.p);
            return Ok(out);
        }
        let key = self.key.as_ref().ok_or(WalletError::Locked)?;
        out.put_u8(0);
        write_body(&mut out, key, self.mnemonic.as_deref().map(String::as_str));
        Ok(out)
    }

    pub fn read(r: &mut Reader<'_>) -> Result<Self, WalletError> {
        if !r.read_bool()? {
            let (key, mnemonic) = read_body(r)?;
            return Ok(Self::from_key(key, mnemonic));
        }
        let iv = r.read_var_bytes()?;
        let ciphertext = r.read_var_bytes()?;
        let kdf = KdfParams {
            algorithm: KdfAlgorithm::from_id(r.read_u8()?)?,
            n: r.read_u32()?,
            r: r.read_u32()?,
            p: r.read_u32()?,
        };
        Ok(Self {
            encrypted: true,
            iv,
            ciphertext,
            kdf,
            key: None,
            mnemonic: None,
            aes_key: None,
            until: None,
        })
    }

    pub fn from_raw(data: &[u8]) -> Result<Self, WalletError> {
        let mut r = Reader::new(data);
        let key = Self::read(&mut r)?;
        r.finish()?;
        Ok(key)
    }
}

fn write_body<B: BufMut>(out: &mut B, key: &HdPrivateKey, mnemonic: Option<&str>) {
    out.put_slice(key.chain_code());
    out.put_slice(key.key_bytes());
    match mnemonic {
        Some(phrase) => {
            out.put_u8(1);
            put_var_str(out, phrase);
        }
        None => out.put_u8(0),
    }
}

fn read_body(r: &mut Reader<'_>) -> Result<(HdPrivateKey, Option<Zeroizing<String>>), WalletError> {
    let chain_code = r.read_array::<32>()?;
    let key_bytes = Zeroizing::new(r.read_array::<32>()?);
    let key = HdPrivateKey::from_parts(chain_code, *key_bytes)?;
    let mnemonic = if r.read_bool()? {
        Some(Zeroizing::new(r.read_var_str()?))
    } else {
        None
    };
    Ok((key, mnemonic))
}
