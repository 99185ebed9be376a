//! Key-value storage for the wallet database.
//!
//! Every record lives in one ordered key space. Mutations are staged in a
//! [`Txn`], which overlays pending writes on top of the committed store so
//! later steps of the same operation read their own writes, then commits
//! everything as one atomic [`Batch`]. Events raised while staging are only
//! handed back once the commit succeeds.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;

use parking_lot::RwLock;
use rocksdb::{ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};

use crate::error::WalletError;
use crate::events::WalletEvent;

/// Ordered key/value pairs returned by range scans.
pub type Entries = Vec<(Vec<u8>, Vec<u8>)>;

/// Read access shared by committed stores and open transactions.
pub trait KvRead {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, WalletError>;

    /// Entries with `start <= key < end` in ascending key order. A `None`
    /// end scans to the end of the key space.
    fn range(&self, start: &[u8], end: Option<&[u8]>) -> Result<Entries, WalletError>;

    fn has(&self, key: &[u8]) -> Result<bool, WalletError> {
        Ok(self.get(key)?.is_some())
    }

    /// Entries whose key starts with `prefix`.
    fn prefix(&self, prefix: &[u8]) -> Result<Entries, WalletError> {
        let end = prefix_end(prefix);
        self.range(prefix, end.as_deref())
    }
}

/// A committed store accepting atomic batches.
pub trait KvStore: KvRead + Send + Sync {
    fn write(&self, batch: Batch) -> Result<(), WalletError>;
}

/// Smallest key greater than every key starting with `prefix`.
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

fn bounds<'k>(start: &'k [u8], end: Option<&'k [u8]>) -> (Bound<&'k [u8]>, Bound<&'k [u8]>) {
    (
        Bound::Included(start),
        end.map_or(Bound::Unbounded, Bound::Excluded),
    )
}

/// Staged puts and deletes, applied atomically.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Batch {
    ops: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.insert(key.into(), Some(value.into()));
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.insert(key.into(), None);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &Option<Vec<u8>>)> {
        self.ops.iter()
    }

    fn lookup(&self, key: &[u8]) -> Option<&Option<Vec<u8>>> {
        self.ops.get(key)
    }
}

// --- In-memory store ---

/// `BTreeMap` store for tests and ephemeral wallets.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl KvRead for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, WalletError> {
        Ok(self.map.read().get(key).cloned())
    }

    fn range(&self, start: &[u8], end: Option<&[u8]>) -> Result<Entries, WalletError> {
        let map = self.map.read();
        Ok(map
            .range::<[u8], _>(bounds(start, end))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

impl KvStore for MemoryStore {
    fn write(&self, batch: Batch) -> Result<(), WalletError> {
        let mut map = self.map.write();
        for (key, op) in batch.ops {
            match op {
                Some(value) => {
                    map.insert(key, value);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }
}

// --- RocksDB store ---

const CF_WALLET: &str = "wallet";

/// RocksDB-backed persistent store. All records live in the `wallet`
/// column family; batches map onto one [`WriteBatch`].
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    /// Open or create a RocksDB database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalletError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cfs = vec![ColumnFamilyDescriptor::new(CF_WALLET, Options::default())];
        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cfs)
            .map_err(|e| WalletError::Storage(e.to_string()))?;
        Ok(Self { db })
    }

    fn cf_handle(&self) -> Result<&rocksdb::ColumnFamily, WalletError> {
        self.db
            .cf_handle(CF_WALLET)
            .ok_or_else(|| WalletError::Storage(format!("missing column family: {CF_WALLET}")))
    }
}

impl KvRead for RocksStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, WalletError> {
        let cf = self.cf_handle()?;
        self.db
            .get_cf(cf, key)
            .map_err(|e| WalletError::Storage(e.to_string()))
    }

    fn range(&self, start: &[u8], end: Option<&[u8]>) -> Result<Entries, WalletError> {
        let cf = self.cf_handle()?;
        let mut out = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(start, Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(|e| WalletError::Storage(e.to_string()))?;
            if end.is_some_and(|end| key.as_ref() >= end) {
                break;
            }
            out.push((key.into_vec(), value.into_vec()));
        }
        Ok(out)
    }
}

impl KvStore for RocksStore {
    fn write(&self, batch: Batch) -> Result<(), WalletError> {
        let cf = self.cf_handle()?;
        let mut wb = WriteBatch::default();
        for (key, op) in batch.ops {
            match op {
                Some(value) => wb.put_cf(cf, key, value),
                None => wb.delete_cf(cf, key),
            }
        }
        self.db
            .write(wb)
            .map_err(|e| WalletError::Storage(e.to_string()))
    }
}

// --- Transactions ---

/// In-memory change applied once the batch is durable.
type Hook = Box<dyn FnOnce() + Send>;

/// A unit of atomic work: staged writes plus the events they raise.
pub struct Txn<'a> {
    store: &'a dyn KvStore,
    batch: Batch,
    events: Vec<WalletEvent>,
    hooks: Vec<Hook>,
}

impl<'a> Txn<'a> {
    pub fn new(store: &'a dyn KvStore) -> Self {
        Self {
            store,
            batch: Batch::new(),
            events: Vec::new(),
            hooks: Vec::new(),
        }
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.batch.put(key, value);
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.batch.delete(key);
    }

    /// Queue an event for delivery after commit.
    pub fn emit(&mut self, event: WalletEvent) {
        self.events.push(event);
    }

    /// Events queued so far.
    pub fn events(&self) -> &[WalletEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty() && self.events.is_empty()
    }

    /// Run `hook` after a successful commit. Dropped with the batch
    /// otherwise.
    pub fn on_commit(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.hooks.push(Box::new(hook));
    }

    /// Write the batch atomically, run the commit hooks and release the
    /// queued events.
    pub fn commit(self) -> Result<Vec<WalletEvent>, WalletError> {
        if !self.batch.is_empty() {
            self.store.write(self.batch)?;
        }
        for hook in self.hooks {
            hook();
        }
        Ok(self.events)
    }
}

impl KvRead for Txn<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, WalletError> {
        match self.batch.lookup(key) {
            Some(op) => Ok(op.clone()),
            None => self.store.get(key),
        }
    }

    fn range(&self, start: &[u8], end: Option<&[u8]>) -> Result<Entries, WalletError> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.store.range(start, end)?.into_iter().collect();
        for (key, op) in self.batch.ops.range::<[u8], _>(bounds(start, end)) {
            match op {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }
}
