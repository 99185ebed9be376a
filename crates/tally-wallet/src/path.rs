//! Address paths: how a wallet owns an address hash.

use bytes::BufMut;
use serde::{Deserialize, Serialize};
use tally_core::address::Address;
use tally_core::constants::Network;
use tally_core::encoding::{Reader, put_var_bytes};
use tally_core::types::Hash256;

use crate::error::WalletError;

/// Receive branch index.
pub const RECEIVE: u32 = 0;
/// Change branch index.
pub const CHANGE: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PathKind {
    /// Derived from the account key at `branch / index`.
    Hd { branch: u32, index: u32 },
    /// Imported key. `data` holds the private key, sealed when `encrypted`,
    /// and is empty for an imported public key.
    Imported {
        encrypted: bool,
        #[serde(skip)]
        data: Vec<u8>,
    },
    /// Watched address without any key.
    Address,
}

/// Ownership record for one address hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Path {
    pub account: u32,
    pub hash: Hash256,
    #[serde(flatten)]
    pub kind: PathKind,
}

impl Path {
    pub fn hd(account: u32, hash: Hash256, branch: u32, index: u32) -> Self {
        Self {
            account,
            hash,
            kind: PathKind::Hd { branch, index },
        }
    }

    pub fn is_hd(&self) -> bool {
        matches!(self.kind, PathKind::Hd { .. })
    }

    /// `(branch, index)` for derived paths.
    pub fn derivation(&self) -> Option<(u32, u32)> {
        match self.kind {
            PathKind::Hd { branch, index } => Some((branch, index)),
            _ => None,
        }
    }

    pub fn address(&self, network: Network) -> Address {
        Address::from_pubkey_hash(self.hash, network)
    }

    /// Raw form: u8 kind, u32 account, then the kind's fields. The hash
    /// lives in the record key.
    pub fn to_raw(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(13);
        match &self.kind {
            PathKind::Hd { branch, index } => {
                out.put_u8(0);
                out.put_u32_le(self.account);
                out.put_u32_le(*branch);
                out.put_u32_le(*index);
            }
            PathKind::Imported { encrypted, data } => {
                out.put_u8(1);
                out.put_u32_le(self.account);
                out.put_u8(u8::from(*encrypted));
                put_var_bytes(&mut out, data);
            }
            PathKind::Address => {
                out.put_u8(2);
                out.put_u32_le(self.account);
            }
        }
        out
    }

    pub fn from_raw(hash: Hash256, data: &[u8]) -> Result<Self, WalletError> {
        let mut r = Reader::new(data);
        let tag = r.read_u8()?;
        let account = r.read_u32()?;
        let kind = match tag {
            0 => PathKind::Hd {
                branch: r.read_u32()?,
                index: r.read_u32()?,
            },
            1 => PathKind::Imported {
                encrypted: r.read_bool()?,
                data: r.read_var_bytes()?,
            },
            2 => PathKind::Address,
            other => return Err(WalletError::Corrupt(format!("unknown path kind {other}"))),
        };
        r.finish()?;
        Ok(Self {
            account,
            hash,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_kinds_roundtrip() {
        let hash = Hash256([3; 32]);
        let paths = [
            Path::hd(1, hash, CHANGE, 17),
            Path {
                account: 0,
                hash,
                kind: PathKind::Imported {
                    encrypted: true,
                    data: vec![9; 48],
                },
            },
            Path {
                account: 2,
                hash,
                kind: PathKind::Address,
            },
        ];
        for path in paths {
            assert_eq!(Path::from_raw(hash, &path.to_raw()).unwrap(), path);
        }
    }

    #[test]
    fn unknown_kind_is_corrupt() {
        let raw = [7u8, 0, 0, 0, 0];
        assert!(matches!(
            Path::from_raw(Hash256::ZERO, &raw),
            Err(WalletError::Corrupt(_))
        ));
    }

    #[test]
    fn json_hides_key_material() {
        let path = Path {
            account: 0,
            hash: Hash256([1; 32]),
            kind: PathKind::Imported {
                encrypted: false,
                data: vec![0xAA; 32],
            },
        };
        let json = serde_json::to_string(&path).unwrap();
        assert!(json.contains("\"type\":\"imported\""));
        assert!(!json.contains("data"));
        assert_eq!(path.derivation(), None);
    }
}
