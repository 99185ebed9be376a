//! HD accounts.
//!
//! An account owns two branches below its public key: receive (0) and
//! change (1). Each branch keeps `depth` exposed keys plus `lookahead`
//! keys beyond them, all of which are saved as paths so incoming payments
//! to any of them are recognized.

use bytes::BufMut;
use serde::Serialize;
use tally_core::address::Address;
use tally_core::constants::Network;
use tally_core::encoding::{Reader, put_var_str};
use tally_core::hd::HdPublicKey;

use crate::config::MAX_LOOKAHEAD;
use crate::error::WalletError;
use crate::layout;
use crate::path::{CHANGE, Path, RECEIVE};
use crate::records::MapRecord;
use crate::store::{KvRead, Txn};
use crate::wallet_key::WalletKey;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    pub wid: u32,
    pub name: String,
    pub index: u32,
    pub initialized: bool,
    pub watch_only: bool,
    pub receive_depth: u32,
    pub change_depth: u32,
    pub lookahead: u32,
    #[serde(skip)]
    pub account_key: HdPublicKey,
}

impl Account {
    pub fn new(
        wid: u32,
        name: impl Into<String>,
        index: u32,
        account_key: HdPublicKey,
        watch_only: bool,
        lookahead: u32,
    ) -> Self {
        Self {
            wid,
            name: name.into(),
            index,
            initialized: false,
            watch_only,
            receive_depth: 0,
            change_depth: 0,
            lookahead,
            account_key,
        }
    }

    pub fn to_raw(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.name.len() + 1 + 17 + HdPublicKey::SIZE);
        put_var_str(&mut out, &self.name);
        let mut flags = 0u8;
        if self.initialized {
            flags |= 1;
        }
        if self.watch_only {
            flags |= 2;
        }
        out.put_u8(flags);
        out.put_u32_le(self.index);
        out.put_u32_le(self.receive_depth);
        out.put_u32_le(self.change_depth);
        out.put_u32_le(self.lookahead);
        out.put_slice(&self.account_key.to_bytes());
        out
    }

    pub fn from_raw(wid: u32, data: &[u8]) -> Result<Self, WalletError> {
        let mut r = Reader::new(data);
        let name = r.read_var_str()?;
        let flags = r.read_u8()?;
        let index = r.read_u32()?;
        let receive_depth = r.read_u32()?;
        let change_depth = r.read_u32()?;
        let lookahead = r.read_u32()?;
        let account_key = HdPublicKey::from_bytes(&r.read_array::<64>()?)?;
        r.finish()?;
        Ok(Self {
            wid,
            name,
            index,
            initialized: flags & 1 != 0,
            watch_only: flags & 2 != 0,
            receive_depth,
            change_depth,
            lookahead,
            account_key,
        })
    }

    pub fn load<R: KvRead + ?Sized>(
        db: &R,
        wid: u32,
        index: u32,
    ) -> Result<Option<Self>, WalletError> {
        db.get(&layout::account(wid, index))?
            .map(|raw| Self::from_raw(wid, &raw))
            .transpose()
    }

    pub fn derive_key(&self, branch: u32, index: u32) -> Result<WalletKey, WalletError> {
        WalletKey::derive(&self.account_key, self.index, branch, index)
    }

    fn depth(&self, branch: u32) -> u32 {
        if branch == CHANGE {
            self.change_depth
        } else {
            self.receive_depth
        }
    }

    fn set_depth(&mut self, branch: u32, depth: u32) {
        if branch == CHANGE {
            self.change_depth = depth;
        } else {
            self.receive_depth = depth;
        }
    }

    /// The most recently exposed key on `branch`.
    pub fn current_key(&self, branch: u32) -> Result<WalletKey, WalletError> {
        let depth = self.depth(branch);
        if depth == 0 {
            return Err(WalletError::InvalidState(format!(
                "account {} is not initialized",
                self.name
            )));
        }
        self.derive_key(branch, depth - 1)
    }

    pub fn receive_address(&self, network: Network) -> Result<Address, WalletError> {
        Ok(self.current_key(RECEIVE)?.address(network))
    }

    pub fn change_address(&self, network: Network) -> Result<Address, WalletError> {
        Ok(self.current_key(CHANGE)?.address(network))
    }

    /// Write the account record and its name indexes.
    pub(crate) fn save(&self, txn: &mut Txn<'_>) {
        txn.put(layout::account(self.wid, self.index), self.to_raw());
        txn.put(
            layout::account_index(self.wid, &self.name),
            self.index.to_le_bytes().to_vec(),
        );
        txn.put(
            layout::account_name(self.wid, self.index),
            self.name.as_bytes().to_vec(),
        );
    }

    /// Record `path` for the wallet, its account index and the global
    /// address map.
    pub(crate) fn save_path(txn: &mut Txn<'_>, wid: u32, path: &Path) -> Result<(), WalletError> {
        txn.put(layout::path(wid, &path.hash), path.to_raw());
        txn.put(layout::account_path(wid, path.account, &path.hash), Vec::new());
        MapRecord::insert_wid(txn, layout::path_map(&path.hash), wid)?;
        Ok(())
    }

    fn remove_path(&self, txn: &mut Txn<'_>, key: &WalletKey) -> Result<(), WalletError> {
        txn.delete(layout::path(self.wid, &key.hash));
        txn.delete(layout::account_path(self.wid, self.index, &key.hash));
        MapRecord::remove_wid(txn, layout::path_map(&key.hash), self.wid)?;
        Ok(())
    }

    fn save_key(&self, txn: &mut Txn<'_>, key: &WalletKey) -> Result<(), WalletError> {
        Self::save_path(txn, self.wid, &key.to_path(false, Vec::new()))
    }

    /// Save keys `[from, to)` on `branch`.
    fn derive_range(
        &self,
        txn: &mut Txn<'_>,
        branch: u32,
        from: u32,
        to: u32,
    ) -> Result<Vec<WalletKey>, WalletError> {
        let mut keys = Vec::with_capacity(to.saturating_sub(from) as usize);
        for index in from..to {
            let key = self.derive_key(branch, index)?;
            self.save_key(txn, &key)?;
            keys.push(key);
        }
        Ok(keys)
    }

    /// Expose the first key on each branch and derive the lookahead window.
    pub(crate) fn init(&mut self, txn: &mut Txn<'_>) -> Result<Vec<WalletKey>, WalletError> {
        if self.initialized {
            return Ok(Vec::new());
        }
        self.receive_depth = 1;
        self.change_depth = 1;
        let mut keys = self.derive_range(txn, RECEIVE, 0, 1 + self.lookahead)?;
        keys.extend(self.derive_range(txn, CHANGE, 0, 1 + self.lookahead)?);
        self.initialized = true;
        self.save(txn);
        Ok(keys)
    }

    /// Expose the next key on `branch`. Returns it along with every newly
    /// saved key.
    pub(crate) fn create_key(
        &mut self,
        txn: &mut Txn<'_>,
        branch: u32,
    ) -> Result<(WalletKey, Vec<WalletKey>), WalletError> {
        let depth = self.depth(branch);
        let key = self.derive_key(branch, depth)?;
        let saved = self.derive_range(txn, branch, depth + self.lookahead, depth + self.lookahead + 1)?;
        self.set_depth(branch, depth + 1);
        self.save(txn);
        Ok((key, saved))
    }

    /// Advance `branch` so that `index` counts as exposed.
    pub(crate) fn sync_depth(
        &mut self,
        txn: &mut Txn<'_>,
        branch: u32,
        index: u32,
    ) -> Result<Vec<WalletKey>, WalletError> {
        let depth = self.depth(branch);
        if index < depth {
            return Ok(Vec::new());
        }
        let keys = self.derive_range(
            txn,
            branch,
            depth + self.lookahead,
            index + 1 + self.lookahead,
        )?;
        self.set_depth(branch, index + 1);
        self.save(txn);
        Ok(keys)
    }

    /// Grow or shrink the lookahead window on both branches.
    pub(crate) fn set_lookahead(
        &mut self,
        txn: &mut Txn<'_>,
        lookahead: u32,
    ) -> Result<Vec<WalletKey>, WalletError> {
        if lookahead > MAX_LOOKAHEAD {
            return Err(WalletError::InvalidState(format!(
                "lookahead {lookahead} exceeds {MAX_LOOKAHEAD}"
            )));
        }
        let old = self.lookahead;
        let mut added = Vec::new();
        for branch in [RECEIVE, CHANGE] {
            let depth = self.depth(branch);
            if lookahead > old {
                added.extend(self.derive_range(txn, branch, depth + old, depth + lookahead)?);
            } else {
                for index in depth + lookahead..depth + old {
                    let key = self.derive_key(branch, index)?;
                    self.remove_path(txn, &key)?;
                }
            }
        }
        self.lookahead = lookahead;
        self.save(txn);
        Ok(added)
    }
}
