//! Keys a wallet can receive to.

use tally_core::address::Address;
use tally_core::constants::Network;
use tally_core::crypto::{PrivateKey, PublicKey};
use tally_core::hd::HdPublicKey;
use tally_core::types::Hash256;

use crate::error::WalletError;
use crate::path::{Path, PathKind};

/// Where a wallet key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrigin {
    Hd { account: u32, branch: u32, index: u32 },
    Imported { account: u32 },
    WatchOnly { account: u32 },
}

impl KeyOrigin {
    pub fn account(&self) -> u32 {
        match *self {
            Self::Hd { account, .. } | Self::Imported { account } | Self::WatchOnly { account } => {
                account
            }
        }
    }
}

/// A key owned (or watched) by a wallet account.
#[derive(Debug, Clone)]
pub struct WalletKey {
    pub origin: KeyOrigin,
    pub hash: Hash256,
    pub public: Option<PublicKey>,
    pub private: Option<PrivateKey>,
}

impl WalletKey {
    /// Key `branch / index` below an account public key.
    pub fn derive(
        account_key: &HdPublicKey,
        account: u32,
        branch: u32,
        index: u32,
    ) -> Result<Self, WalletError> {
        let child = account_key.derive(branch)?.derive(index)?;
        let public = child.public_key()?;
        Ok(Self {
            origin: KeyOrigin::Hd {
                account,
                branch,
                index,
            },
            hash: public.pubkey_hash(),
            public: Some(public),
            private: None,
        })
    }

    pub fn from_private(account: u32, private: PrivateKey) -> Self {
        let public = private.public_key();
        Self {
            origin: KeyOrigin::Imported { account },
            hash: public.pubkey_hash(),
            public: Some(public),
            private: Some(private),
        }
    }

    pub fn from_public(account: u32, public: PublicKey) -> Self {
        Self {
            origin: KeyOrigin::Imported { account },
            hash: public.pubkey_hash(),
            public: Some(public),
            private: None,
        }
    }

    pub fn watch(account: u32, hash: Hash256) -> Self {
        Self {
            origin: KeyOrigin::WatchOnly { account },
            hash,
            public: None,
            private: None,
        }
    }

    pub fn account(&self) -> u32 {
        self.origin.account()
    }

    pub fn address(&self, network: Network) -> Address {
        Address::from_pubkey_hash(self.hash, network)
    }

    /// The path record for this key. Imported private keys are stored as
    /// `data`, already sealed by the caller when `encrypted`.
    pub fn to_path(&self, encrypted: bool, data: Vec<u8>) -> Path {
        let kind = match self.origin {
            KeyOrigin::Hd { branch, index, .. } => PathKind::Hd { branch, index },
            KeyOrigin::Imported { .. } => PathKind::Imported { encrypted, data },
            KeyOrigin::WatchOnly { .. } => PathKind::Address,
        };
        Path {
            account: self.account(),
            hash: self.hash,
            kind,
        }
    }
}

/// Address at `branch / index` below an account key.
pub fn derive_address(
    account_key: &HdPublicKey,
    branch: u32,
    index: u32,
    network: Network,
) -> Result<Address, WalletError> {
    let key = WalletKey::derive(account_key, 0, branch, index)?;
    Ok(key.address(network))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::RECEIVE;
    use tally_core::hd::{HARDENED, HdPrivateKey};

    #[test]
    fn derived_key_matches_private_derivation() {
        let master = HdPrivateKey::from_seed(&[5u8; 64]);
        let account = master.derive(HARDENED);
        let key = WalletKey::derive(&account.to_public(), 0, RECEIVE, 4).unwrap();
        let private = account.derive(RECEIVE).derive(4).private_key();
        assert_eq!(key.public, Some(private.public_key()));
        assert_eq!(key.hash, private.public_key().pubkey_hash());
        assert!(key.to_path(false, Vec::new()).is_hd());
    }

    #[test]
    fn imported_and_watched_paths() {
        let private = PrivateKey::generate();
        let imported = WalletKey::from_private(3, private);
        let path = imported.to_path(true, vec![1, 2, 3]);
        assert_eq!(path.account, 3);
        assert!(matches!(path.kind, PathKind::Imported { encrypted: true, .. }));

        let watched = WalletKey::watch(1, Hash256([8; 32]));
        assert_eq!(watched.to_path(false, Vec::new()).kind, PathKind::Address);
        assert_eq!(
            watched.address(Network::Regtest).pubkey_hash(),
            Hash256([8; 32])
        );
    }
}
