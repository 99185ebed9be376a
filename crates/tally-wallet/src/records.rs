//! Persisted record types and their byte layouts.
//!
//! ```text
//! ChainState   u32 start_height | hash start | u32 height | u8 marked      (41)
//! BlockMeta    hash | u32 height | u32 time                                (40)
//! TxRecord     raw tx | u32 mtime | u8 flag [| hash | u32 height | u32 time | u32 index]
//! MapRecord    u32 count | u32 wid*
//! BlockRecord  hash | u32 height | u32 time | u32 count | hash*
//! ```
//! Integers are little-endian.

use std::collections::BTreeSet;

use bytes::BufMut;
use serde::{Deserialize, Serialize};
use tally_core::encoding::Reader;
use tally_core::types::{ChainEntry, Hash256, Transaction};

use crate::error::WalletError;
use crate::store::{KvRead, Txn};

/// The wallet database's processed chain tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChainState {
    pub start_height: u32,
    pub start_hash: Hash256,
    pub height: u32,
    /// Set once the initial historical rescan has completed.
    pub marked: bool,
}

impl ChainState {
    pub const SIZE: usize = 41;

    pub fn to_raw(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.put_u32_le(self.start_height);
        out.put_slice(self.start_hash.as_bytes());
        out.put_u32_le(self.height);
        out.put_u8(u8::from(self.marked));
        out
    }

    pub fn from_raw(data: &[u8]) -> Result<Self, WalletError> {
        let mut r = Reader::new(data);
        let state = Self {
            start_height: r.read_u32()?,
            start_hash: r.read_hash()?,
            height: r.read_u32()?,
            marked: r.read_bool()?,
        };
        r.finish()?;
        Ok(state)
    }
}

/// Minimal identity of a processed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BlockMeta {
    pub hash: Hash256,
    pub height: u32,
    pub time: u32,
}

impl BlockMeta {
    pub const SIZE: usize = 40;

    pub fn new(hash: Hash256, height: u32, time: u32) -> Self {
        Self { hash, height, time }
    }

    pub fn from_entry(entry: &ChainEntry) -> Self {
        Self::new(entry.hash, entry.height, entry.time)
    }

    pub fn to_raw(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.put_slice(self.hash.as_bytes());
        out.put_u32_le(self.height);
        out.put_u32_le(self.time);
        out
    }

    pub fn from_raw(data: &[u8]) -> Result<Self, WalletError> {
        let mut r = Reader::new(data);
        let meta = Self {
            hash: r.read_hash()?,
            height: r.read_u32()?,
            time: r.read_u32()?,
        };
        r.finish()?;
        Ok(meta)
    }
}

/// Where a confirmed transaction sits in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxBlock {
    pub hash: Hash256,
    pub height: u32,
    pub time: u32,
    /// Position within the block.
    pub index: u32,
}

impl TxBlock {
    pub fn meta(&self) -> BlockMeta {
        BlockMeta::new(self.hash, self.height, self.time)
    }
}

/// A transaction plus wallet-local metadata. `block` is `None` while pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRecord {
    pub tx: Transaction,
    pub hash: Hash256,
    /// Seconds since the epoch when the wallet first saw the transaction.
    pub mtime: u32,
    pub block: Option<TxBlock>,
}

impl TxRecord {
    pub fn new(tx: Transaction, mtime: u32) -> Result<Self, WalletError> {
        let hash = tx.txid()?;
        Ok(Self {
            tx,
            hash,
            mtime,
            block: None,
        })
    }

    pub fn height(&self) -> Option<u32> {
        self.block.map(|b| b.height)
    }

    pub fn is_confirmed(&self) -> bool {
        self.block.is_some()
    }

    /// Confirmations at chain height `tip`.
    pub fn depth(&self, tip: u32) -> u32 {
        match self.height() {
            Some(h) if tip >= h => tip - h + 1,
            _ => 0,
        }
    }

    /// Block time when confirmed, otherwise the first-seen time.
    pub fn time(&self) -> u32 {
        self.block.map_or(self.mtime, |b| b.time)
    }

    pub fn set_block(&mut self, meta: &BlockMeta, index: u32) {
        self.block = Some(TxBlock {
            hash: meta.hash,
            height: meta.height,
            time: meta.time,
            index,
        });
    }

    pub fn unset_block(&mut self) {
        self.block = None;
    }

    pub fn to_raw(&self) -> Result<Vec<u8>, WalletError> {
        let mut out = self.tx.to_raw()?;
        out.put_u32_le(self.mtime);
        match &self.block {
            Some(block) => {
                out.put_u8(1);
                out.put_slice(block.hash.as_bytes());
                out.put_u32_le(block.height);
                out.put_u32_le(block.time);
                out.put_u32_le(block.index);
            }
            None => out.put_u8(0),
        }
        Ok(out)
    }

    pub fn from_raw(data: &[u8]) -> Result<Self, WalletError> {
        let (tx, consumed) = Transaction::decode_prefix(data)?;
        let hash = tx.txid()?;
        let mut r = Reader::new(&data[consumed..]);
        let mtime = r.read_u32()?;
        let block = if r.read_bool()? {
            Some(TxBlock {
                hash: r.read_hash()?,
                height: r.read_u32()?,
                time: r.read_u32()?,
                index: r.read_u32()?,
            })
        } else {
            None
        };
        r.finish()?;
        Ok(Self {
            tx,
            hash,
            mtime,
            block,
        })
    }
}

/// Set of wallet ids interested in one key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapRecord {
    pub wids: BTreeSet<u32>,
}

impl MapRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when `wid` was already present.
    pub fn add(&mut self, wid: u32) -> bool {
        self.wids.insert(wid)
    }

    /// Returns false when `wid` was absent.
    pub fn remove(&mut self, wid: u32) -> bool {
        self.wids.remove(&wid)
    }

    pub fn has(&self, wid: u32) -> bool {
        self.wids.contains(&wid)
    }

    pub fn is_empty(&self) -> bool {
        self.wids.is_empty()
    }

    pub fn to_raw(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.wids.len() * 4);
        out.put_u32_le(self.wids.len() as u32);
        for wid in &self.wids {
            out.put_u32_le(*wid);
        }
        out
    }

    pub fn from_raw(data: &[u8]) -> Result<Self, WalletError> {
        let mut r = Reader::new(data);
        let count = r.read_u32()?;
        let mut wids = BTreeSet::new();
        for _ in 0..count {
            wids.insert(r.read_u32()?);
        }
        r.finish()?;
        Ok(Self { wids })
    }
}

impl MapRecord {
    /// The record under `key`, empty when absent.
    pub fn load<R: KvRead + ?Sized>(db: &R, key: &[u8]) -> Result<Self, WalletError> {
        match db.get(key)? {
            Some(raw) => Self::from_raw(&raw),
            None => Ok(Self::new()),
        }
    }

    /// Add `wid` to the record under `key`. Returns false when present.
    pub fn insert_wid(txn: &mut Txn<'_>, key: Vec<u8>, wid: u32) -> Result<bool, WalletError> {
        let mut map = Self::load(&*txn, &key)?;
        if !map.add(wid) {
            return Ok(false);
        }
        txn.put(key, map.to_raw());
        Ok(true)
    }

    /// Remove `wid` from the record under `key`, deleting the record once
    /// empty. Returns false when absent.
    pub fn remove_wid(txn: &mut Txn<'_>, key: Vec<u8>, wid: u32) -> Result<bool, WalletError> {
        let mut map = Self::load(&*txn, &key)?;
        if !map.remove(wid) {
            return Ok(false);
        }
        if map.is_empty() {
            txn.delete(key);
        } else {
            txn.put(key, map.to_raw());
        }
        Ok(true)
    }
}

/// A wallet's list of its own transactions confirmed in one block, in
/// in-block order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub hash: Hash256,
    pub height: u32,
    pub time: u32,
    pub hashes: Vec<Hash256>,
}

impl BlockRecord {
    pub fn new(meta: &BlockMeta) -> Self {
        Self {
            hash: meta.hash,
            height: meta.height,
            time: meta.time,
            hashes: Vec::new(),
        }
    }

    /// Returns false when `hash` is already listed.
    pub fn add(&mut self, hash: Hash256) -> bool {
        if self.hashes.contains(&hash) {
            return false;
        }
        self.hashes.push(hash);
        true
    }

    pub fn remove(&mut self, hash: &Hash256) -> bool {
        let before = self.hashes.len();
        self.hashes.retain(|h| h != hash);
        self.hashes.len() != before
    }

    pub fn to_raw(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(44 + self.hashes.len() * 32);
        out.put_slice(self.hash.as_bytes());
        out.put_u32_le(self.height);
        out.put_u32_le(self.time);
        out.put_u32_le(self.hashes.len() as u32);
        for hash in &self.hashes {
            out.put_slice(hash.as_bytes());
        }
        out
    }

    pub fn from_raw(data: &[u8]) -> Result<Self, WalletError> {
        let mut r = Reader::new(data);
        let hash = r.read_hash()?;
        let height = r.read_u32()?;
        let time = r.read_u32()?;
        let count = r.read_u32()?;
        let mut hashes = Vec::with_capacity(count.min(10_000) as usize);
        for _ in 0..count {
            hashes.push(r.read_hash()?);
        }
        r.finish()?;
        Ok(Self {
            hash,
            height,
            time,
            hashes,
        })
    }
}
