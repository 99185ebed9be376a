//! Per-wallet transaction ledger.
//!
//! Tracks every transaction touching the wallet, the credits (owned outputs)
//! they create and spend, and running balances for the wallet and each
//! account. All mutations stage into a caller-supplied [`Txn`] so a block's
//! effects on every wallet commit together.
//!
//! Spending one of our credits records two entries: `s[prevout]` naming the
//! spending input and `d[spender]` holding a copy of the spent credit. A
//! pending spend keeps the credit with `spent` set; a confirmed spend deletes
//! it. Inputs spending unknown outpoints are watched through `s` and the
//! global outpoint map so a later double spend or late parent is noticed.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tally_core::coins::CoinView;
use tally_core::constants::Network;
use tally_core::types::{Coin, Hash256, OutPoint, Transaction};
use tracing::{debug, info};

use crate::credit::{Balance, BalanceDelta, Credit, signed};
use crate::details::TxDetails;
use crate::error::WalletError;
use crate::events::WalletEvent;
use crate::layout::{self, TxdbLayout, parse_hash};
use crate::path::Path;
use crate::records::{BlockMeta, BlockRecord, MapRecord, TxBlock, TxRecord};
use crate::store::{KvRead, Txn};

/// Seconds since the epoch, saturated to `u32`.
pub(crate) fn unix_now() -> u32 {
    u32::try_from(chrono::Utc::now().timestamp().max(0)).unwrap_or(u32::MAX)
}

fn corrupt(what: impl std::fmt::Display) -> WalletError {
    WalletError::Corrupt(what.to_string())
}

pub struct TxDb {
    wid: u32,
    layout: TxdbLayout,
    id: Arc<RwLock<String>>,
    network: Network,
    locked: Arc<Mutex<HashSet<OutPoint>>>,
}

impl TxDb {
    pub fn new(wid: u32, id: Arc<RwLock<String>>, network: Network) -> Self {
        Self {
            wid,
            layout: TxdbLayout::new(wid),
            id,
            network,
            locked: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn wid(&self) -> u32 {
        self.wid
    }

    fn id(&self) -> String {
        self.id.read().clone()
    }

    // --- Record access ---

    pub fn get_path<R: KvRead + ?Sized>(
        &self,
        db: &R,
        hash: &Hash256,
    ) -> Result<Option<Path>, WalletError> {
        db.get(&layout::path(self.wid, hash))?
            .map(|raw| Path::from_raw(*hash, &raw))
            .transpose()
    }

    /// Account owning `coin`. Every credit must resolve to a path.
    fn account_of<R: KvRead + ?Sized>(&self, db: &R, coin: &Coin) -> Result<u32, WalletError> {
        self.get_path(db, &coin.pubkey_hash)?
            .map(|path| path.account)
            .ok_or_else(|| corrupt(format!("no path for credit {}", coin.outpoint)))
    }

    pub fn get_tx<R: KvRead + ?Sized>(
        &self,
        db: &R,
        hash: &Hash256,
    ) -> Result<Option<TxRecord>, WalletError> {
        db.get(&self.layout.tx(hash))?
            .map(|raw| TxRecord::from_raw(&raw))
            .transpose()
    }

    pub fn has_tx<R: KvRead + ?Sized>(&self, db: &R, hash: &Hash256) -> Result<bool, WalletError> {
        db.has(&self.layout.tx(hash))
    }

    pub fn get_credit<R: KvRead + ?Sized>(
        &self,
        db: &R,
        outpoint: &OutPoint,
    ) -> Result<Option<Credit>, WalletError> {
        db.get(&self.layout.credit(outpoint))?
            .map(|raw| Credit::from_raw(*outpoint, &raw))
            .transpose()
    }

    /// The credit at `prevout` as recorded when input `spender` spent it.
    fn get_undo<R: KvRead + ?Sized>(
        &self,
        db: &R,
        spender: &OutPoint,
        prevout: &OutPoint,
    ) -> Result<Option<Credit>, WalletError> {
        db.get(&self.layout.undo(spender))?
            .map(|raw| Credit::from_raw(*prevout, &raw))
            .transpose()
    }

    /// The input spending `outpoint`, if any.
    pub fn get_spender<R: KvRead + ?Sized>(
        &self,
        db: &R,
        outpoint: &OutPoint,
    ) -> Result<Option<OutPoint>, WalletError> {
        db.get(&self.layout.spent(outpoint))?
            .map(|raw| OutPoint::from_key(&raw).map_err(WalletError::from))
            .transpose()
    }

    pub fn get_balance<R: KvRead + ?Sized>(
        &self,
        db: &R,
        account: Option<u32>,
    ) -> Result<Balance, WalletError> {
        let key = match account {
            Some(acct) => self.layout.account_balance(acct),
            None => self.layout.balance(),
        };
        match db.get(&key)? {
            Some(raw) => Balance::from_raw(account, &raw),
            None => Ok(Balance::new(account)),
        }
    }

    pub fn get_block<R: KvRead + ?Sized>(
        &self,
        db: &R,
        height: u32,
    ) -> Result<Option<BlockRecord>, WalletError> {
        db.get(&self.layout.block(height))?
            .map(|raw| BlockRecord::from_raw(&raw))
            .transpose()
    }

    /// Wallet-annotated view of `wtx` built from stored credits and paths.
    pub fn to_details<R: KvRead + ?Sized>(
        &self,
        db: &R,
        wtx: &TxRecord,
    ) -> Result<TxDetails, WalletError> {
        let mut details = TxDetails::new(self.wid, wtx, self.network)?;
        if !wtx.tx.is_coinbase() {
            for (i, input) in wtx.tx.inputs.iter().enumerate() {
                let spender = OutPoint::new(wtx.hash, i as u32);
                if let Some(undo) = self.get_undo(db, &spender, &input.previous_output)? {
                    let path = self.get_path(db, &undo.coin.pubkey_hash)?;
                    details.set_input(i, &undo.coin, path);
                }
            }
        }
        for (i, output) in wtx.tx.outputs.iter().enumerate() {
            if let Some(path) = self.get_path(db, &output.pubkey_hash)? {
                details.set_output(i, path);
            }
        }
        details.finish();
        Ok(details)
    }

    pub fn get_details<R: KvRead + ?Sized>(
        &self,
        db: &R,
        hash: &Hash256,
    ) -> Result<Option<TxDetails>, WalletError> {
        match self.get_tx(db, hash)? {
            Some(wtx) => Ok(Some(self.to_details(db, &wtx)?)),
            None => Ok(None),
        }
    }

    // --- Staged writes ---

    fn save_credit(&self, txn: &mut Txn<'_>, credit: &Credit, account: u32) {
        let outpoint = credit.outpoint();
        txn.put(self.layout.credit(&outpoint), credit.to_raw());
        txn.put(self.layout.account_credit(account, &outpoint), Vec::new());
    }

    fn remove_credit(&self, txn: &mut Txn<'_>, outpoint: &OutPoint, account: u32) {
        txn.delete(self.layout.credit(outpoint));
        txn.delete(self.layout.account_credit(account, outpoint));
    }

    fn put_undo(&self, txn: &mut Txn<'_>, spender: &OutPoint, credit: &Credit) {
        let mut undo = credit.clone();
        undo.spent = true;
        txn.put(self.layout.undo(spender), undo.to_raw());
    }

    /// Apply `delta` to the stored balances. Returns the new wallet balance.
    fn apply_delta(&self, txn: &mut Txn<'_>, delta: &BalanceDelta) -> Result<Balance, WalletError> {
        let mut wallet = self.get_balance(&*txn, None)?;
        wallet.apply(&delta.wallet)?;
        txn.put(self.layout.balance(), wallet.to_raw());
        for (&acct, d) in &delta.accounts {
            if d.is_zero() {
                continue;
            }
            let mut balance = self.get_balance(&*txn, Some(acct))?;
            balance.apply(d)?;
            txn.put(self.layout.account_balance(acct), balance.to_raw());
        }
        Ok(wallet)
    }

    fn write_account_index(&self, txn: &mut Txn<'_>, wtx: &TxRecord, account: u32) {
        let hash = &wtx.hash;
        txn.put(self.layout.account_tx(account, hash), Vec::new());
        txn.put(self.layout.account_time(account, wtx.mtime, hash), Vec::new());
        match wtx.height() {
            Some(height) => txn.put(self.layout.account_height(account, height, hash), Vec::new()),
            None => txn.put(self.layout.account_pending(account, hash), Vec::new()),
        }
    }

    fn delete_account_index(&self, txn: &mut Txn<'_>, wtx: &TxRecord, account: u32) {
        let hash = &wtx.hash;
        txn.delete(self.layout.account_tx(account, hash));
        txn.delete(self.layout.account_time(account, wtx.mtime, hash));
        match wtx.height() {
            Some(height) => txn.delete(self.layout.account_height(account, height, hash)),
            None => txn.delete(self.layout.account_pending(account, hash)),
        }
    }

    /// Accounts `wtx` is indexed under.
    fn indexed_accounts(
        &self,
        txn: &Txn<'_>,
        wtx: &TxRecord,
        details: &TxDetails,
    ) -> Result<Vec<u32>, WalletError> {
        let mut accounts = Vec::new();
        for acct in details.accounts() {
            if txn.has(&self.layout.account_tx(acct, &wtx.hash))? {
                accounts.push(acct);
            }
        }
        Ok(accounts)
    }

    fn add_block_tx(
        &self,
        txn: &mut Txn<'_>,
        meta: &BlockMeta,
        hash: Hash256,
    ) -> Result<(), WalletError> {
        let key = self.layout.block(meta.height);
        let mut record = match txn.get(&key)? {
            Some(raw) => BlockRecord::from_raw(&raw)?,
            None => BlockRecord::new(meta),
        };
        if record.add(hash) {
            txn.put(key, record.to_raw());
        }
        MapRecord::insert_wid(txn, layout::block_map(meta.height), self.wid)?;
        Ok(())
    }

    fn remove_block_tx(
        &self,
        txn: &mut Txn<'_>,
        height: u32,
        hash: &Hash256,
    ) -> Result<(), WalletError> {
        let key = self.layout.block(height);
        let Some(raw) = txn.get(&key)? else {
            return Ok(());
        };
        let mut record = BlockRecord::from_raw(&raw)?;
        record.remove(hash);
        if record.hashes.is_empty() {
            txn.delete(key);
            MapRecord::remove_wid(txn, layout::block_map(height), self.wid)?;
        } else {
            txn.put(key, record.to_raw());
        }
        Ok(())
    }

    fn emit_balance(&self, txn: &mut Txn<'_>, balance: Balance) {
        txn.emit(WalletEvent::Balance {
            wid: self.wid,
            id: self.id(),
            balance,
        });
    }

    // --- Ledger transitions ---

    /// Whether `tx` spends one of our credits or pays one of our paths.
    fn is_relevant(&self, txn: &Txn<'_>, tx: &Transaction) -> Result<bool, WalletError> {
        if !tx.is_coinbase() {
            for input in &tx.inputs {
                if txn.has(&self.layout.credit(&input.previous_output))? {
                    return Ok(true);
                }
            }
        }
        for output in &tx.outputs {
            if txn.has(&layout::path(self.wid, &output.pubkey_hash))? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Add `tx`, optionally confirmed in `block`. Returns the resulting
    /// details, or `None` when the transaction was ignored: already known,
    /// not ours, or an unconfirmed double spend of a confirmed transaction.
    pub fn add(
        &self,
        txn: &mut Txn<'_>,
        tx: &Transaction,
        block: Option<TxBlock>,
    ) -> Result<Option<TxDetails>, WalletError> {
        let hash = tx.txid()?;
        if let Some(existing) = self.get_tx(&*txn, &hash)? {
            if existing.is_confirmed() {
                return Ok(None);
            }
            return match block {
                Some(block) => self.confirm(txn, existing, block).map(Some),
                None => Ok(None),
            };
        }

        let relevant = self.is_relevant(txn, tx)?;
        let mut wtx = TxRecord::new(tx.clone(), unix_now())?;
        wtx.block = block;

        if !tx.is_coinbase() && !self.remove_conflicts(txn, &wtx)? {
            return Ok(None);
        }
        if !relevant {
            return Ok(None);
        }
        self.insert(txn, wtx).map(Some)
    }

    /// Evict every known transaction double spending an input of `wtx`.
    /// Returns false, touching nothing, when `wtx` is unconfirmed and loses
    /// to a confirmed spender.
    fn remove_conflicts(&self, txn: &mut Txn<'_>, wtx: &TxRecord) -> Result<bool, WalletError> {
        let mut conflicts = Vec::new();
        for input in &wtx.tx.inputs {
            let Some(spender) = self.get_spender(&*txn, &input.previous_output)? else {
                continue;
            };
            if spender.txid == wtx.hash {
                continue;
            }
            let conflict = self
                .get_tx(&*txn, &spender.txid)?
                .ok_or_else(|| corrupt(format!("spender {} has no record", spender.txid)))?;
            if !wtx.is_confirmed() && conflict.is_confirmed() {
                debug!(wid = self.wid, tx = %wtx.hash, spender = %conflict.hash, "rejecting double spend of confirmed tx");
                return Ok(false);
            }
            conflicts.push(conflict.hash);
        }

        for hash in conflicts {
            // an earlier removal may have taken it as a descendant
            if let Some(conflict) = self.get_tx(&*txn, &hash)? {
                info!(wid = self.wid, removed = %hash, by = %wtx.hash, "removing conflicting tx");
                self.remove_recursive(txn, conflict, true)?;
            }
        }
        Ok(true)
    }

    fn insert(&self, txn: &mut Txn<'_>, wtx: TxRecord) -> Result<TxDetails, WalletError> {
        let tx = &wtx.tx;
        let hash = wtx.hash;
        let height = wtx.height();
        let mut delta = BalanceDelta::new();
        let mut accounts = BTreeSet::new();
        let mut own = false;

        if !tx.is_coinbase() {
            for (i, input) in tx.inputs.iter().enumerate() {
                let prevout = input.previous_output;
                let spender = OutPoint::new(hash, i as u32);
                txn.put(self.layout.spent(&prevout), spender.to_key().to_vec());

                let Some(mut credit) = self.get_credit(&*txn, &prevout)? else {
                    MapRecord::insert_wid(txn, layout::outpoint_map(&prevout), self.wid)?;
                    continue;
                };
                if credit.spent {
                    return Err(corrupt(format!("credit {prevout} already spent")));
                }
                let acct = self.account_of(&*txn, &credit.coin)?;
                let value = signed(credit.value())?;
                delta.unconfirmed(acct, -value);
                if wtx.is_confirmed() {
                    self.remove_credit(txn, &prevout, acct);
                    MapRecord::remove_wid(txn, layout::outpoint_map(&prevout), self.wid)?;
                    delta.coin(acct, -1);
                    if credit.coin.height.is_some() {
                        delta.confirmed(acct, -value);
                    }
                } else {
                    credit.spent = true;
                    self.save_credit(txn, &credit, acct);
                }
                self.put_undo(txn, &spender, &credit);
                accounts.insert(acct);
                own = true;
            }
        }

        for (i, output) in tx.outputs.iter().enumerate() {
            let Some(path) = self.get_path(&*txn, &output.pubkey_hash)? else {
                continue;
            };
            let acct = path.account;
            let outpoint = OutPoint::new(hash, i as u32);
            let coin = Coin::from_tx(tx, hash, i as u32, height)
                .ok_or_else(|| corrupt(format!("missing output {outpoint}")))?;
            let value = signed(output.value)?;
            let mut credit = Credit::new(coin, own);
            accounts.insert(acct);

            match self.get_spender(&*txn, &outpoint)? {
                // a child spending this output arrived first
                Some(spender) => {
                    let child = self
                        .get_tx(&*txn, &spender.txid)?
                        .ok_or_else(|| corrupt(format!("spender {} has no record", spender.txid)))?;
                    credit.spent = true;
                    self.put_undo(txn, &spender, &credit);
                    if child.is_confirmed() {
                        MapRecord::remove_wid(txn, layout::outpoint_map(&outpoint), self.wid)?;
                    } else {
                        MapRecord::insert_wid(txn, layout::outpoint_map(&outpoint), self.wid)?;
                        self.save_credit(txn, &credit, acct);
                        delta.coin(acct, 1);
                        if height.is_some() {
                            delta.confirmed(acct, value);
                        }
                    }
                    if !txn.has(&self.layout.account_tx(acct, &child.hash))? {
                        self.write_account_index(txn, &child, acct);
                        delta.account_tx(acct, 1);
                    }
                }
                None => {
                    MapRecord::insert_wid(txn, layout::outpoint_map(&outpoint), self.wid)?;
                    self.save_credit(txn, &credit, acct);
                    delta.coin(acct, 1);
                    delta.unconfirmed(acct, value);
                    if height.is_some() {
                        delta.confirmed(acct, value);
                    }
                }
            }
        }

        txn.put(self.layout.tx(&hash), wtx.to_raw()?);
        txn.put(self.layout.time(wtx.mtime, &hash), Vec::new());
        match height {
            Some(h) => txn.put(self.layout.height(h, &hash), Vec::new()),
            None => txn.put(self.layout.pending(&hash), Vec::new()),
        }
        for &acct in &accounts {
            self.write_account_index(txn, &wtx, acct);
            delta.account_tx(acct, 1);
        }
        delta.wallet_tx(1);
        if let Some(block) = wtx.block {
            self.add_block_tx(txn, &block.meta(), hash)?;
        }
        MapRecord::insert_wid(txn, layout::tx_map(&hash), self.wid)?;

        let balance = self.apply_delta(txn, &delta)?;
        let details = self.to_details(&*txn, &wtx)?;
        debug!(wid = self.wid, tx = %hash, height = ?height, "inserted tx");

        let id = self.id();
        txn.emit(WalletEvent::Tx {
            wid: self.wid,
            id: id.clone(),
            details: details.clone(),
        });
        if wtx.is_confirmed() {
            txn.emit(WalletEvent::Confirmed {
                wid: self.wid,
                id,
                details: details.clone(),
            });
        }
        self.emit_balance(txn, balance);
        Ok(details)
    }

    /// Move a pending transaction into `block`.
    fn confirm(
        &self,
        txn: &mut Txn<'_>,
        mut wtx: TxRecord,
        block: TxBlock,
    ) -> Result<TxDetails, WalletError> {
        if wtx.is_confirmed() {
            return Err(WalletError::InvalidState(format!("tx {} already confirmed", wtx.hash)));
        }
        let hash = wtx.hash;
        let height = block.height;
        let mut delta = BalanceDelta::new();

        if !wtx.tx.is_coinbase() {
            for (i, input) in wtx.tx.inputs.iter().enumerate() {
                let spender = OutPoint::new(hash, i as u32);
                if !txn.has(&self.layout.undo(&spender))? {
                    continue;
                }
                let prevout = input.previous_output;
                // pending spends kept the credit around
                if let Some(credit) = self.get_credit(&*txn, &prevout)? {
                    let acct = self.account_of(&*txn, &credit.coin)?;
                    self.remove_credit(txn, &prevout, acct);
                    MapRecord::remove_wid(txn, layout::outpoint_map(&prevout), self.wid)?;
                    delta.coin(acct, -1);
                    if credit.coin.height.is_some() {
                        delta.confirmed(acct, -signed(credit.value())?);
                    }
                }
            }
        }

        for i in 0..wtx.tx.outputs.len() {
            let outpoint = OutPoint::new(hash, i as u32);
            if let Some(mut credit) = self.get_credit(&*txn, &outpoint)? {
                let acct = self.account_of(&*txn, &credit.coin)?;
                credit.coin.height = Some(height);
                self.save_credit(txn, &credit, acct);
                delta.confirmed(acct, signed(credit.value())?);
            }
            self.set_undo_height(txn, &outpoint, Some(height))?;
        }

        let pending = wtx.clone();
        wtx.block = Some(block);
        let details = self.to_details(&*txn, &wtx)?;
        for acct in self.indexed_accounts(txn, &wtx, &details)? {
            self.delete_account_index(txn, &pending, acct);
            self.write_account_index(txn, &wtx, acct);
        }
        txn.delete(self.layout.pending(&hash));
        txn.put(self.layout.height(height, &hash), Vec::new());
        txn.put(self.layout.tx(&hash), wtx.to_raw()?);
        self.add_block_tx(txn, &block.meta(), hash)?;

        let balance = self.apply_delta(txn, &delta)?;
        debug!(wid = self.wid, tx = %hash, height, "confirmed tx");
        txn.emit(WalletEvent::Confirmed {
            wid: self.wid,
            id: self.id(),
            details: details.clone(),
        });
        self.emit_balance(txn, balance);
        Ok(details)
    }

    /// Update the height of our output's coin copy held by its spender.
    fn set_undo_height(
        &self,
        txn: &mut Txn<'_>,
        outpoint: &OutPoint,
        height: Option<u32>,
    ) -> Result<(), WalletError> {
        let Some(spender) = self.get_spender(&*txn, outpoint)? else {
            return Ok(());
        };
        let key = self.layout.undo(&spender);
        if let Some(raw) = txn.get(&key)? {
            let mut undo = Credit::from_raw(*outpoint, &raw)?;
            undo.coin.height = height;
            txn.put(key, undo.to_raw());
        }
        Ok(())
    }

    /// Return a confirmed transaction to pending. The exact inverse of
    /// confirming it.
    pub fn disconnect(
        &self,
        txn: &mut Txn<'_>,
        mut wtx: TxRecord,
    ) -> Result<TxDetails, WalletError> {
        let Some(block) = wtx.block else {
            return Err(WalletError::InvalidState(format!("tx {} is not confirmed", wtx.hash)));
        };
        let hash = wtx.hash;
        let mut delta = BalanceDelta::new();

        if !wtx.tx.is_coinbase() {
            for (i, input) in wtx.tx.inputs.iter().enumerate() {
                let spender = OutPoint::new(hash, i as u32);
                let prevout = input.previous_output;
                let Some(raw) = txn.get(&self.layout.undo(&spender))? else {
                    continue;
                };
                if txn.has(&self.layout.credit(&prevout))? {
                    continue;
                }
                // bring back the coin, still spent by this now pending tx
                let credit = Credit::from_raw(prevout, &raw)?;
                let acct = self.account_of(&*txn, &credit.coin)?;
                self.save_credit(txn, &credit, acct);
                MapRecord::insert_wid(txn, layout::outpoint_map(&prevout), self.wid)?;
                delta.coin(acct, 1);
                if credit.coin.height.is_some() {
                    delta.confirmed(acct, signed(credit.value())?);
                }
            }
        }

        for i in 0..wtx.tx.outputs.len() {
            let outpoint = OutPoint::new(hash, i as u32);
            if let Some(mut credit) = self.get_credit(&*txn, &outpoint)? {
                let acct = self.account_of(&*txn, &credit.coin)?;
                credit.coin.height = None;
                self.save_credit(txn, &credit, acct);
                delta.confirmed(acct, -signed(credit.value())?);
            }
            self.set_undo_height(txn, &outpoint, None)?;
        }

        let confirmed = wtx.clone();
        wtx.unset_block();
        let details = self.to_details(&*txn, &wtx)?;
        for acct in self.indexed_accounts(txn, &wtx, &details)? {
            self.delete_account_index(txn, &confirmed, acct);
            self.write_account_index(txn, &wtx, acct);
        }
        txn.delete(self.layout.height(block.height, &hash));
        txn.put(self.layout.pending(&hash), Vec::new());
        txn.put(self.layout.tx(&hash), wtx.to_raw()?);
        self.remove_block_tx(txn, block.height, &hash)?;

        let balance = self.apply_delta(txn, &delta)?;
        debug!(wid = self.wid, tx = %hash, height = block.height, "unconfirmed tx");
        txn.emit(WalletEvent::Unconfirmed {
            wid: self.wid,
            id: self.id(),
            details: details.clone(),
        });
        self.emit_balance(txn, balance);
        Ok(details)
    }

    /// Disconnect every transaction the wallet has in the block at
    /// `height`, last in-block first. Coinbase transactions cannot exist
    /// outside their block and are removed instead. Returns the number of
    /// transactions affected.
    pub fn revert(&self, txn: &mut Txn<'_>, height: u32) -> Result<usize, WalletError> {
        let Some(record) = self.get_block(&*txn, height)? else {
            return Ok(0);
        };
        let mut count = 0;
        for hash in record.hashes.iter().rev() {
            let Some(wtx) = self.get_tx(&*txn, hash)? else {
                continue;
            };
            if !wtx.is_confirmed() {
                continue;
            }
            if wtx.tx.is_coinbase() {
                self.remove_recursive(txn, wtx, false)?;
            } else {
                self.disconnect(txn, wtx)?;
            }
            count += 1;
        }
        if txn.has(&self.layout.block(height))? {
            txn.delete(self.layout.block(height));
            MapRecord::remove_wid(txn, layout::block_map(height), self.wid)?;
        }
        Ok(count)
    }

    /// Remove `wtx` and, first, every transaction spending its outputs.
    /// The root is reported as a conflict when `conflict` is set.
    pub fn remove_recursive(
        &self,
        txn: &mut Txn<'_>,
        wtx: TxRecord,
        conflict: bool,
    ) -> Result<TxDetails, WalletError> {
        for i in 0..wtx.tx.outputs.len() {
            let outpoint = OutPoint::new(wtx.hash, i as u32);
            let Some(spender) = self.get_spender(&*txn, &outpoint)? else {
                continue;
            };
            if let Some(child) = self.get_tx(&*txn, &spender.txid)? {
                self.remove_recursive(txn, child, false)?;
            }
        }
        self.remove(txn, wtx, conflict)
    }

    fn remove(
        &self,
        txn: &mut Txn<'_>,
        wtx: TxRecord,
        conflict: bool,
    ) -> Result<TxDetails, WalletError> {
        let hash = wtx.hash;
        let details = self.to_details(&*txn, &wtx)?;
        let accounts = self.indexed_accounts(txn, &wtx, &details)?;
        let mut delta = BalanceDelta::new();

        if !wtx.tx.is_coinbase() {
            for (i, input) in wtx.tx.inputs.iter().enumerate() {
                let spender = OutPoint::new(hash, i as u32);
                let prevout = input.previous_output;
                let undo_key = self.layout.undo(&spender);
                match txn.get(&undo_key)? {
                    Some(raw) => {
                        let undo = Credit::from_raw(prevout, &raw)?;
                        let acct = self.account_of(&*txn, &undo.coin)?;
                        let value = signed(undo.value())?;
                        let mut credit = match self.get_credit(&*txn, &prevout)? {
                            Some(credit) => credit,
                            // spent by a confirmed tx: the credit was dropped
                            None => {
                                MapRecord::insert_wid(txn, layout::outpoint_map(&prevout), self.wid)?;
                                delta.coin(acct, 1);
                                if undo.coin.height.is_some() {
                                    delta.confirmed(acct, value);
                                }
                                undo
                            }
                        };
                        credit.spent = false;
                        self.save_credit(txn, &credit, acct);
                        delta.unconfirmed(acct, value);
                        txn.delete(undo_key);
                    }
                    None => {
                        MapRecord::remove_wid(txn, layout::outpoint_map(&prevout), self.wid)?;
                    }
                }
                txn.delete(self.layout.spent(&prevout));
            }
        }

        for i in 0..wtx.tx.outputs.len() {
            let outpoint = OutPoint::new(hash, i as u32);
            if let Some(credit) = self.get_credit(&*txn, &outpoint)? {
                let acct = self.account_of(&*txn, &credit.coin)?;
                let value = signed(credit.value())?;
                self.remove_credit(txn, &outpoint, acct);
                delta.coin(acct, -1);
                if !credit.spent {
                    delta.unconfirmed(acct, -value);
                }
                if credit.coin.height.is_some() {
                    delta.confirmed(acct, -value);
                }
            }
            MapRecord::remove_wid(txn, layout::outpoint_map(&outpoint), self.wid)?;
            if self.is_locked(&outpoint) {
                let locked = Arc::clone(&self.locked);
                txn.on_commit(move || {
                    locked.lock().remove(&outpoint);
                });
            }
        }

        txn.delete(self.layout.tx(&hash));
        txn.delete(self.layout.time(wtx.mtime, &hash));
        match wtx.block {
            Some(block) => {
                txn.delete(self.layout.height(block.height, &hash));
                self.remove_block_tx(txn, block.height, &hash)?;
            }
            None => txn.delete(self.layout.pending(&hash)),
        }
        for acct in accounts {
            self.delete_account_index(txn, &wtx, acct);
            delta.account_tx(acct, -1);
        }
        delta.wallet_tx(-1);
        MapRecord::remove_wid(txn, layout::tx_map(&hash), self.wid)?;

        let balance = self.apply_delta(txn, &delta)?;
        debug!(wid = self.wid, tx = %hash, conflict, "removed tx");
        let (wid, id) = (self.wid, self.id());
        txn.emit(if conflict {
            WalletEvent::Conflict {
                wid,
                id,
                details: details.clone(),
            }
        } else {
            WalletEvent::RemoveTx {
                wid,
                id,
                details: details.clone(),
            }
        });
        self.emit_balance(txn, balance);
        Ok(details)
    }

    /// Remove pending transactions first seen at least `age` seconds ago,
    /// along with their descendants. Returns the removed hashes.
    pub fn zap(
        &self,
        txn: &mut Txn<'_>,
        account: Option<u32>,
        age: u32,
    ) -> Result<Vec<Hash256>, WalletError> {
        let cutoff = unix_now().saturating_sub(age);
        let mut removed = Vec::new();
        for hash in self.pending_hashes(&*txn, account)? {
            let Some(wtx) = self.get_tx(&*txn, &hash)? else {
                continue;
            };
            if wtx.is_confirmed() || wtx.mtime > cutoff {
                continue;
            }
            self.remove_recursive(txn, wtx, false)?;
            removed.push(hash);
        }
        if !removed.is_empty() {
            info!(wid = self.wid, count = removed.len(), "zapped pending txs");
        }
        Ok(removed)
    }

    /// Remove one pending transaction and its descendants.
    pub fn abandon(&self, txn: &mut Txn<'_>, hash: &Hash256) -> Result<TxDetails, WalletError> {
        let wtx = self
            .get_tx(&*txn, hash)?
            .ok_or_else(|| WalletError::NotFound(format!("tx {hash}")))?;
        if wtx.is_confirmed() {
            return Err(WalletError::InvalidState(format!("tx {hash} is confirmed")));
        }
        self.remove_recursive(txn, wtx, false)
    }

    // --- Coin locks ---

    pub fn lock_coin(&self, outpoint: OutPoint) -> bool {
        self.locked.lock().insert(outpoint)
    }

    pub fn unlock_coin(&self, outpoint: &OutPoint) -> bool {
        self.locked.lock().remove(outpoint)
    }

    pub fn is_locked(&self, outpoint: &OutPoint) -> bool {
        self.locked.lock().contains(outpoint)
    }

    pub fn get_locked(&self) -> Vec<OutPoint> {
        let mut out: Vec<_> = self.locked.lock().iter().copied().collect();
        out.sort();
        out
    }

    // --- Queries ---

    fn pending_hashes<R: KvRead + ?Sized>(
        &self,
        db: &R,
        account: Option<u32>,
    ) -> Result<Vec<Hash256>, WalletError> {
        let (prefix, offset) = match account {
            Some(acct) => (self.layout.account_pending_prefix(acct), self.layout.body() + 4),
            None => (self.layout.pending_prefix(), self.layout.body()),
        };
        db.prefix(&prefix)?
            .iter()
            .map(|(key, _)| parse_hash(key, offset).map_err(WalletError::from))
            .collect()
    }

    fn load_all<R: KvRead + ?Sized>(
        &self,
        db: &R,
        hashes: Vec<Hash256>,
    ) -> Result<Vec<TxRecord>, WalletError> {
        let mut out = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let wtx = self
                .get_tx(db, &hash)?
                .ok_or_else(|| corrupt(format!("index points at missing tx {hash}")))?;
            out.push(wtx);
        }
        Ok(out)
    }

    pub fn get_pending<R: KvRead + ?Sized>(
        &self,
        db: &R,
        account: Option<u32>,
    ) -> Result<Vec<TxRecord>, WalletError> {
        let mut pending = self.load_all(db, self.pending_hashes(db, account)?)?;
        pending.sort_by_key(|wtx| (wtx.mtime, wtx.hash));
        Ok(pending)
    }

    /// Transactions first seen within `[start, end]`, oldest first.
    pub fn get_range<R: KvRead + ?Sized>(
        &self,
        db: &R,
        account: Option<u32>,
        start: u32,
        end: u32,
    ) -> Result<Vec<TxRecord>, WalletError> {
        let (lo, hi) = match account {
            Some(acct) => self.layout.account_time_range(acct, start, end),
            None => self.layout.time_range(start, end),
        };
        let hashes = db
            .range(&lo, hi.as_deref())?
            .iter()
            .map(|(key, _)| parse_hash(key, key.len().saturating_sub(32)).map_err(WalletError::from))
            .collect::<Result<Vec<_>, _>>()?;
        self.load_all(db, hashes)
    }

    pub fn get_history<R: KvRead + ?Sized>(
        &self,
        db: &R,
        account: Option<u32>,
    ) -> Result<Vec<TxRecord>, WalletError> {
        self.get_range(db, account, 0, u32::MAX)
    }

    pub fn get_credits<R: KvRead + ?Sized>(
        &self,
        db: &R,
        account: Option<u32>,
    ) -> Result<Vec<Credit>, WalletError> {
        let body = self.layout.body();
        match account {
            None => db
                .prefix(&self.layout.credit_prefix())?
                .iter()
                .map(|(key, raw)| {
                    let outpoint = OutPoint::from_key(&key[body..])?;
                    Credit::from_raw(outpoint, raw)
                })
                .collect(),
            Some(acct) => {
                let mut out = Vec::new();
                for (key, _) in db.prefix(&self.layout.account_credit_prefix(acct))? {
                    let outpoint = OutPoint::from_key(&key[body + 4..])?;
                    let credit = self
                        .get_credit(db, &outpoint)?
                        .ok_or_else(|| corrupt(format!("account index points at missing credit {outpoint}")))?;
                    out.push(credit);
                }
                Ok(out)
            }
        }
    }

    /// Unspent coins, locked ones included.
    pub fn get_coins<R: KvRead + ?Sized>(
        &self,
        db: &R,
        account: Option<u32>,
    ) -> Result<Vec<Coin>, WalletError> {
        Ok(self
            .get_credits(db, account)?
            .into_iter()
            .filter(|credit| !credit.spent)
            .map(|credit| credit.coin)
            .collect())
    }

    /// Our live coins spent by `tx`.
    pub fn get_coin_view<R: KvRead + ?Sized>(
        &self,
        db: &R,
        tx: &Transaction,
    ) -> Result<CoinView, WalletError> {
        let mut view = CoinView::new();
        if tx.is_coinbase() {
            return Ok(view);
        }
        for input in &tx.inputs {
            if let Some(credit) = self.get_credit(db, &input.previous_output)? {
                view.add_coin(credit.coin);
            }
        }
        Ok(view)
    }

    /// Like [`get_coin_view`](Self::get_coin_view) but also finds coins the
    /// stored `tx` already consumed.
    pub fn get_spent_view<R: KvRead + ?Sized>(
        &self,
        db: &R,
        tx: &Transaction,
    ) -> Result<CoinView, WalletError> {
        let mut view = CoinView::new();
        if tx.is_coinbase() {
            return Ok(view);
        }
        let hash = tx.txid()?;
        for (i, input) in tx.inputs.iter().enumerate() {
            let prevout = input.previous_output;
            if let Some(credit) = self.get_credit(db, &prevout)? {
                view.add_coin(credit.coin);
                continue;
            }
            let spender = OutPoint::new(hash, i as u32);
            if let Some(raw) = db.get(&self.layout.undo(&spender))? {
                view.add_coin(Credit::from_raw(prevout, &raw)?.coin);
            }
        }
        Ok(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Account;
    use crate::path::{Path, RECEIVE};
    use crate::store::{Batch, Entries, KvStore, MemoryStore};
    use tally_core::types::{TxInput, TxOutput};

    /// Reads through to a memory store and refuses every write.
    struct FailingStore<'a>(&'a MemoryStore);

    impl KvRead for FailingStore<'_> {
        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, WalletError> {
            self.0.get(key)
        }

        fn range(&self, start: &[u8], end: Option<&[u8]>) -> Result<Entries, WalletError> {
            self.0.range(start, end)
        }
    }

    impl KvStore for FailingStore<'_> {
        fn write(&self, _batch: Batch) -> Result<(), WalletError> {
            Err(WalletError::Storage("disk full".into()))
        }
    }

    const WID: u32 = 1;

    fn hash(n: u8) -> Hash256 {
        Hash256([n; 32])
    }

    /// Address hashes owned by account 0 and account 1.
    const MINE: u8 = 0xa0;
    const OTHER_ACCT: u8 = 0xa1;
    const THEIRS: u8 = 0xee;

    struct Fixture {
        store: MemoryStore,
        txdb: TxDb,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let mut txn = Txn::new(&store);
        Account::save_path(&mut txn, WID, &Path::hd(0, hash(MINE), RECEIVE, 0)).unwrap();
        Account::save_path(&mut txn, WID, &Path::hd(1, hash(OTHER_ACCT), RECEIVE, 0)).unwrap();
        txn.commit().unwrap();
        let txdb = TxDb::new(WID, Arc::new(RwLock::new("w1".into())), Network::Regtest);
        Fixture { store, txdb }
    }

    impl Fixture {
        fn run<T>(
            &self,
            op: impl FnOnce(&mut Txn<'_>) -> Result<T, WalletError>,
        ) -> (T, Vec<WalletEvent>) {
            let mut txn = Txn::new(&self.store);
            let out = op(&mut txn).unwrap();
            (out, txn.commit().unwrap())
        }

        fn add(&self, tx: &Transaction, block: Option<TxBlock>) -> Option<TxDetails> {
            self.run(|txn| self.txdb.add(txn, tx, block)).0
        }

        fn balance(&self, account: Option<u32>) -> Balance {
            self.txdb.get_balance(&self.store, account).unwrap()
        }

        /// Counters must match a recount of the stored credits.
        fn check(&self) {
            let credits = self.txdb.get_credits(&self.store, None).unwrap();
            let wallet = self.balance(None);
            assert_eq!(wallet.coin, credits.len() as u64);
            let unconfirmed: u64 = credits.iter().filter(|c| !c.spent).map(|c| c.value()).sum();
            let confirmed: u64 = credits
                .iter()
                .filter(|c| c.coin.height.is_some())
                .map(|c| c.value())
                .sum();
            assert_eq!(wallet.unconfirmed, unconfirmed);
            assert_eq!(wallet.confirmed, confirmed);
            let a = self.balance(Some(0));
            let b = self.balance(Some(1));
            // a tx touching both accounts counts once for the wallet
            let history = self.txdb.get_history(&self.store, None).unwrap();
            assert_eq!(wallet.tx, history.len() as u64);
            assert!(wallet.tx <= a.tx + b.tx);
            assert_eq!(wallet.coin, a.coin + b.coin);
            assert_eq!(wallet.unconfirmed, a.unconfirmed + b.unconfirmed);
            assert_eq!(wallet.confirmed, a.confirmed + b.confirmed);
        }
    }

    fn tx(inputs: &[OutPoint], outputs: &[(u8, u64)]) -> Transaction {
        Transaction {
            version: 1,
            inputs: inputs.iter().map(|op| TxInput::unsigned(*op)).collect(),
            outputs: outputs
                .iter()
                .map(|(to, value)| TxOutput {
                    value: *value,
                    pubkey_hash: hash(*to),
                })
                .collect(),
            lock_time: 0,
        }
    }

    fn foreign(n: u8) -> OutPoint {
        OutPoint::new(hash(n), 0)
    }

    fn block(height: u32, index: u32) -> TxBlock {
        let mut h = [0xbb; 32];
        h[..4].copy_from_slice(&height.to_le_bytes());
        TxBlock {
            hash: Hash256(h),
            height,
            time: 1_700_000_000 + height,
            index,
        }
    }

    #[test]
    fn receive_confirm_disconnect() {
        let f = fixture();
        let t = tx(&[foreign(1)], &[(MINE, 100_000), (THEIRS, 5)]);
        let (details, events) = f.run(|txn| f.txdb.add(txn, &t, None));
        let details = details.unwrap();
        assert_eq!(details.outputs[0].path.as_ref().unwrap().account, 0);
        assert!(details.outputs[1].path.is_none());
        let names: Vec<_> = events.iter().map(|e| e.name()).collect();
        assert_eq!(names, ["tx", "balance"]);

        let b = f.balance(None);
        assert_eq!((b.tx, b.coin, b.unconfirmed, b.confirmed), (1, 1, 100_000, 0));
        f.check();

        // known pending without block is ignored
        assert!(f.add(&t, None).is_none());

        let before = f.txdb.get_tx(&f.store, &details.hash).unwrap().unwrap();
        let (_, events) = f.run(|txn| f.txdb.add(txn, &t, Some(block(10, 0))));
        assert_eq!(events[0].name(), "confirmed");
        let b = f.balance(None);
        assert_eq!((b.unconfirmed, b.confirmed), (100_000, 100_000));
        assert_eq!(f.txdb.get_block(&f.store, 10).unwrap().unwrap().hashes, vec![details.hash]);
        f.check();

        // confirmed is final
        assert!(f.add(&t, Some(block(11, 0))).is_none());

        let (count, events) = f.run(|txn| f.txdb.revert(txn, 10));
        assert_eq!(count, 1);
        assert_eq!(events[0].name(), "unconfirmed");
        let b = f.balance(None);
        assert_eq!((b.tx, b.coin, b.unconfirmed, b.confirmed), (1, 1, 100_000, 0));
        assert!(f.txdb.get_block(&f.store, 10).unwrap().is_none());
        let after = f.txdb.get_tx(&f.store, &details.hash).unwrap().unwrap();
        assert_eq!(after, before);
        f.check();
    }

    #[test]
    fn unrelated_tx_is_ignored() {
        let f = fixture();
        let t = tx(&[foreign(1)], &[(THEIRS, 1_000)]);
        assert!(f.add(&t, None).is_none());
        assert!(f.store.get(&f.txdb.layout.spent(&foreign(1))).unwrap().is_none());
    }

    #[test]
    fn pending_then_confirmed_spend() {
        let f = fixture();
        let fund = tx(&[foreign(1)], &[(MINE, 100_000)]);
        let fund_hash = f.add(&fund, Some(block(5, 0))).unwrap().hash;
        let coin = OutPoint::new(fund_hash, 0);

        let spend = tx(&[coin], &[(THEIRS, 60_000), (OTHER_ACCT, 39_000)]);
        let details = f.add(&spend, None).unwrap();
        assert_eq!(details.fee, Some(1_000));
        assert_eq!(details.value(), -61_000);

        let credit = f.txdb.get_credit(&f.store, &coin).unwrap().unwrap();
        assert!(credit.spent);
        let b = f.balance(None);
        assert_eq!((b.coin, b.unconfirmed, b.confirmed), (2, 39_000, 100_000));
        assert_eq!(f.balance(Some(1)).tx, 1);
        assert_eq!(f.balance(Some(0)).tx, 2);
        f.check();

        let watched = |f: &Fixture| {
            MapRecord::load(&f.store, &layout::outpoint_map(&coin))
                .unwrap()
                .wids
                .contains(&WID)
        };
        assert!(watched(&f));

        f.add(&spend, Some(block(6, 0))).unwrap();
        assert!(f.txdb.get_credit(&f.store, &coin).unwrap().is_none());
        assert!(!watched(&f));
        let b = f.balance(None);
        assert_eq!((b.coin, b.unconfirmed, b.confirmed), (1, 39_000, 39_000));
        f.check();

        let view = f.txdb.get_spent_view(&f.store, &spend).unwrap();
        assert_eq!(view.get(&coin).unwrap().value, 100_000);
        assert!(f.txdb.get_coin_view(&f.store, &spend).unwrap().is_empty());

        // disconnecting restores the spent credit
        f.run(|txn| f.txdb.revert(txn, 6));
        let credit = f.txdb.get_credit(&f.store, &coin).unwrap().unwrap();
        assert!(credit.spent);
        assert_eq!(credit.coin.height, Some(5));
        assert!(watched(&f));
        f.check();
    }

    #[test]
    fn later_double_spend_replaces_pending() {
        let f = fixture();
        let t1 = tx(&[foreign(9)], &[(MINE, 10_000)]);
        let t2 = tx(&[foreign(9)], &[(MINE, 20_000)]);
        let h1 = f.add(&t1, None).unwrap().hash;
        let (details, events) = f.run(|txn| f.txdb.add(txn, &t2, None));
        let h2 = details.unwrap().hash;

        let names: Vec<_> = events.iter().map(|e| e.name()).collect();
        assert_eq!(names, ["conflict", "balance", "tx", "balance"]);
        assert!(!f.txdb.has_tx(&f.store, &h1).unwrap());
        assert!(f.txdb.has_tx(&f.store, &h2).unwrap());
        let b = f.balance(None);
        assert_eq!((b.tx, b.coin, b.unconfirmed), (1, 1, 20_000));
        assert_eq!(f.txdb.get_spender(&f.store, &foreign(9)).unwrap().unwrap().txid, h2);
        f.check();
    }

    #[test]
    fn confirmed_spender_beats_pending_double_spend() {
        let f = fixture();
        let t1 = tx(&[foreign(9)], &[(MINE, 10_000)]);
        let t2 = tx(&[foreign(9)], &[(MINE, 20_000)]);
        let h1 = f.add(&t1, Some(block(3, 0))).unwrap().hash;
        assert!(f.add(&t2, None).is_none());
        assert!(f.txdb.has_tx(&f.store, &h1).unwrap());

        // a confirmed double spend always wins
        let h2 = f.add(&t2, Some(block(4, 0))).unwrap().hash;
        assert!(!f.txdb.has_tx(&f.store, &h1).unwrap());
        assert!(f.txdb.get_block(&f.store, 3).unwrap().is_none());
        assert_eq!(f.txdb.get_history(&f.store, None).unwrap()[0].hash, h2);
        f.check();
    }

    #[test]
    fn foreign_child_is_not_tracked() {
        let f = fixture();
        let parent = tx(&[foreign(2)], &[(MINE, 50_000)]);
        let parent_hash = parent.txid().unwrap();
        let child = tx(&[OutPoint::new(parent_hash, 0)], &[(THEIRS, 49_000)]);

        // nothing marks the child as ours before its parent arrives
        assert!(f.add(&child, None).is_none());
        f.add(&parent, None).unwrap();
        let credit = f.txdb.get_credit(&f.store, &OutPoint::new(parent_hash, 0)).unwrap().unwrap();
        assert!(!credit.spent);
        f.check();
    }

    #[test]
    fn parent_resolves_known_child() {
        let f = fixture();
        let parent = tx(&[foreign(2)], &[(MINE, 50_000)]);
        let parent_hash = parent.txid().unwrap();
        // the child is ours through its other output
        let child = tx(&[OutPoint::new(parent_hash, 0)], &[(OTHER_ACCT, 48_000)]);
        let child_hash = f.add(&child, None).unwrap().hash;
        assert_eq!(f.balance(Some(0)).tx, 0);

        f.add(&parent, None).unwrap();
        let credit = f.txdb.get_credit(&f.store, &OutPoint::new(parent_hash, 0)).unwrap().unwrap();
        assert!(credit.spent);
        assert_eq!(f.balance(Some(0)).tx, 2);
        let details = f.txdb.get_details(&f.store, &child_hash).unwrap().unwrap();
        assert_eq!(details.fee, Some(2_000));
        f.check();

        // removing the parent takes the child with it
        let (_, events) = f.run(|txn| f.txdb.abandon(txn, &parent_hash));
        let removed: Vec<_> = events
            .iter()
            .filter_map(|e| e.details().map(|d| d.hash))
            .collect();
        assert_eq!(removed, vec![child_hash, parent_hash]);
        let b = f.balance(None);
        assert_eq!((b.tx, b.coin, b.unconfirmed, b.confirmed), (0, 0, 0, 0));
        assert!(f.txdb.get_history(&f.store, None).unwrap().is_empty());
        f.check();
    }

    #[test]
    fn revert_runs_children_first() {
        let f = fixture();
        let parent = tx(&[foreign(3)], &[(MINE, 30_000)]);
        let parent_hash = parent.txid().unwrap();
        let child = tx(&[OutPoint::new(parent_hash, 0)], &[(OTHER_ACCT, 29_000)]);
        f.add(&parent, Some(block(20, 0))).unwrap();
        let child_hash = f.add(&child, Some(block(20, 1))).unwrap().hash;
        f.check();

        let (_, events) = f.run(|txn| f.txdb.revert(txn, 20));
        let order: Vec<_> = events
            .iter()
            .filter(|e| e.name() == "unconfirmed")
            .filter_map(|e| e.details().map(|d| d.hash))
            .collect();
        assert_eq!(order, vec![child_hash, parent_hash]);
        let credit = f.txdb.get_credit(&f.store, &OutPoint::new(parent_hash, 0)).unwrap().unwrap();
        assert!(credit.spent);
        assert_eq!(credit.coin.height, None);
        let b = f.balance(None);
        assert_eq!((b.coin, b.unconfirmed, b.confirmed), (2, 29_000, 0));
        assert_eq!(f.txdb.get_pending(&f.store, None).unwrap().len(), 2);
        f.check();
    }

    #[test]
    fn coinbase_is_removed_on_revert() {
        let f = fixture();
        let cb = tx(&[OutPoint::null()], &[(MINE, 5_000_000)]);
        let details = f.add(&cb, Some(block(7, 0))).unwrap();
        assert_eq!(details.fee, Some(0));
        assert!(details.inputs.is_empty());
        let (_, events) = f.run(|txn| f.txdb.revert(txn, 7));
        assert_eq!(events[0].name(), "remove tx");
        assert_eq!(f.balance(None), Balance::new(None));
    }

    #[test]
    fn zap_and_abandon() {
        let f = fixture();
        let a = tx(&[foreign(4)], &[(MINE, 1_000)]);
        let b = tx(&[foreign(5)], &[(OTHER_ACCT, 2_000)]);
        let c = tx(&[foreign(6)], &[(MINE, 3_000)]);
        f.add(&a, None).unwrap();
        let hb = f.add(&b, None).unwrap().hash;
        let hc = f.add(&c, Some(block(2, 0))).unwrap().hash;

        // too young
        let (none, _) = f.run(|txn| f.txdb.zap(txn, None, 3_600));
        assert!(none.is_empty());

        let (zapped, _) = f.run(|txn| f.txdb.zap(txn, Some(0), 0));
        assert_eq!(zapped, vec![a.txid().unwrap()]);
        assert_eq!(f.txdb.get_pending(&f.store, None).unwrap()[0].hash, hb);

        let mut txn = Txn::new(&f.store);
        assert!(matches!(f.txdb.abandon(&mut txn, &hc), Err(WalletError::InvalidState(_))));
        assert!(matches!(f.txdb.abandon(&mut txn, &hash(1)), Err(WalletError::NotFound(_))));
        drop(txn);

        f.run(|txn| f.txdb.abandon(txn, &hb));
        let b = f.balance(None);
        assert_eq!((b.tx, b.coin, b.unconfirmed, b.confirmed), (1, 1, 3_000, 3_000));
        f.check();
    }

    #[test]
    fn account_queries() {
        let f = fixture();
        let t = tx(&[foreign(1)], &[(MINE, 1_000), (OTHER_ACCT, 2_000)]);
        f.add(&t, None).unwrap();
        assert_eq!(f.txdb.get_coins(&f.store, Some(1)).unwrap()[0].value, 2_000);
        assert_eq!(f.txdb.get_coins(&f.store, None).unwrap().len(), 2);
        assert_eq!(f.txdb.get_history(&f.store, Some(0)).unwrap().len(), 1);
        assert_eq!(f.txdb.get_pending(&f.store, Some(1)).unwrap().len(), 1);
        assert!(f.txdb.get_range(&f.store, Some(0), 0, 10).unwrap().is_empty());
        assert_eq!(f.balance(Some(0)).tx, 1);
        assert_eq!(f.balance(Some(1)).tx, 1);
        assert_eq!(f.balance(None).tx, 1);
        f.check();

        f.run(|txn| f.txdb.abandon(txn, &t.txid().unwrap()));
        assert_eq!(f.balance(None).tx, 0);
        assert_eq!(f.balance(Some(0)).tx, 0);
        assert_eq!(f.balance(Some(1)).tx, 0);
    }

    #[test]
    fn coin_locks() {
        let f = fixture();
        let op = foreign(1);
        assert!(f.txdb.lock_coin(op));
        assert!(!f.txdb.lock_coin(op));
        assert!(f.txdb.is_locked(&op));
        assert_eq!(f.txdb.get_locked(), vec![op]);
        assert!(f.txdb.unlock_coin(&op));
        assert!(!f.txdb.is_locked(&op));
    }

    #[test]
    fn coin_lock_outlives_failed_removal() {
        let f = fixture();
        let t = tx(&[foreign(1)], &[(MINE, 1_000)]);
        let h = f.add(&t, None).unwrap().hash;
        let op = OutPoint::new(h, 0);
        assert!(f.txdb.lock_coin(op));

        let failing = FailingStore(&f.store);
        let mut txn = Txn::new(&failing);
        f.txdb.abandon(&mut txn, &h).unwrap();
        assert!(f.txdb.is_locked(&op));
        assert!(matches!(txn.commit(), Err(WalletError::Storage(_))));
        assert!(f.txdb.is_locked(&op));
        assert!(f.txdb.has_tx(&f.store, &h).unwrap());

        f.run(|txn| f.txdb.abandon(txn, &h));
        assert!(!f.txdb.is_locked(&op));
    }
}
