//! Wallet database: wallet registry, chain synchronization and routing.
//!
//! The [`WalletDb`] owns the key-value store, every loaded [`Wallet`], the
//! processed chain tip and the bloom filter shared with the chain client.
//! Chain data enters in one of three ways:
//!
//! - live blocks and transactions ([`add_block`](WalletDb::add_block),
//!   [`add_tx`](WalletDb::add_tx)), or the async [`run`](WalletDb::run) loop
//!   feeding [`ChainEvent`]s;
//! - reorganizations ([`remove_block`](WalletDb::remove_block),
//!   [`rollback`](WalletDb::rollback));
//! - replays through the client ([`rescan`](WalletDb::rescan),
//!   [`sync_chain`](WalletDb::sync_chain)).
//!
//! All three hold the ingestion lock. Each block is one store batch holding
//! every wallet's changes plus the new chain state; events are published
//! only after that batch is written.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{ArcMutexGuard, Mutex, MutexGuard, RawMutex, RwLock};
use serde::Serialize;
use tally_core::bloom::{BloomFilter, BloomFlags};
use tally_core::constants::MIN_RELAY;
use tally_core::hd::{HdPrivateKey, HdPublicKey};
use tally_core::types::{ChainEntry, Hash256, Transaction};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::client::{ChainClient, ChainEvent};
use crate::config::WalletDbConfig;
use crate::error::WalletError;
use crate::events::WalletEvent;
use crate::layout;
use crate::master_key::MasterKey;
use crate::mnemonic;
use crate::records::{BlockMeta, ChainState, MapRecord, TxBlock};
use crate::store::{KvRead, KvStore, RocksStore, Txn};
use crate::wallet::Wallet;

/// On-disk layout version.
pub const DB_VERSION: u32 = 1;

/// Id of the wallet created with every database.
pub const PRIMARY_ID: &str = "primary";

const EVENT_CAPACITY: usize = 1024;

/// Where the database stands relative to its chain client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Disconnected,
    Connecting,
    Syncing,
    Synced,
}

/// Parameters for [`WalletDb::create`].
#[derive(Default)]
pub struct CreateOptions {
    /// Random when `None`.
    pub id: Option<String>,
    /// Phrase to restore from. A fresh 12-word phrase is generated when
    /// neither this nor `master` is given.
    pub mnemonic: Option<String>,
    pub master: Option<HdPrivateKey>,
    /// Encrypt the master key under this passphrase.
    pub passphrase: Option<String>,
    pub watch_only: bool,
    /// Public key of the default account, required for watch-only wallets.
    pub account_key: Option<HdPublicKey>,
}

fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 40
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

fn read_u32_value(raw: &[u8], what: &str) -> Result<u32, WalletError> {
    let bytes: [u8; 4] = raw
        .try_into()
        .map_err(|_| WalletError::Corrupt(format!("bad {what} record")))?;
    Ok(u32::from_le_bytes(bytes))
}

/// Clears the rescan flags when a rescan ends, however it ends.
struct RescanGuard<'a> {
    running: &'a AtomicBool,
    abort: &'a AtomicBool,
}

impl Drop for RescanGuard<'_> {
    fn drop(&mut self) {
        self.abort.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }
}

pub struct WalletDb {
    me: Weak<WalletDb>,
    config: WalletDbConfig,
    store: Box<dyn KvStore>,
    wallets: Mutex<HashMap<u32, Arc<Wallet>>>,
    /// Serializes wallet creation and renames.
    write_lock: Mutex<()>,
    /// Serializes block and transaction ingestion, rollback and rescans.
    tx_lock: Mutex<()>,
    state: RwLock<Option<ChainState>>,
    filter: RwLock<BloomFilter>,
    client: RwLock<Option<Arc<dyn ChainClient>>>,
    events: broadcast::Sender<WalletEvent>,
    rescanning: AtomicBool,
    abort: AtomicBool,
    status: RwLock<SyncStatus>,
}

impl WalletDb {
    /// Open the RocksDB-backed database under the configured data
    /// directory.
    pub fn open(config: WalletDbConfig) -> Result<Arc<Self>, WalletError> {
        let path = config.db_path();
        std::fs::create_dir_all(&path).map_err(|e| WalletError::Storage(e.to_string()))?;
        let store = RocksStore::open(&path)?;
        info!(path = %path.display(), network = config.network.name(), "opened wallet database");
        Self::open_with_store(config, Box::new(store))
    }

    /// Open over any store. Creates the primary wallet on first use.
    pub fn open_with_store(
        config: WalletDbConfig,
        store: Box<dyn KvStore>,
    ) -> Result<Arc<Self>, WalletError> {
        Self::check_version(&config, &*store)?;
        let state = store
            .get(layout::CHAIN_STATE)?
            .map(|raw| ChainState::from_raw(&raw))
            .transpose()?;
        let filter = Self::build_filter(&config, &*store)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let db = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            store,
            wallets: Mutex::new(HashMap::new()),
            write_lock: Mutex::new(()),
            tx_lock: Mutex::new(()),
            state: RwLock::new(state),
            filter: RwLock::new(filter),
            client: RwLock::new(None),
            events,
            rescanning: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            status: RwLock::new(SyncStatus::Disconnected),
        });

        if db.get(PRIMARY_ID)?.is_none() {
            db.create(CreateOptions {
                id: Some(PRIMARY_ID.to_string()),
                ..CreateOptions::default()
            })?;
        }
        Ok(db)
    }

    fn check_version(config: &WalletDbConfig, store: &dyn KvStore) -> Result<(), WalletError> {
        let magic = config.network.magic_bytes();
        match store.get(layout::VERSION)? {
            None => {
                let mut txn = Txn::new(store);
                txn.put(layout::VERSION, DB_VERSION.to_le_bytes().to_vec());
                txn.put(layout::OPTIONS, magic.to_vec());
                txn.commit()?;
                Ok(())
            }
            Some(raw) => {
                let version = read_u32_value(&raw, "version")?;
                if version != DB_VERSION {
                    return Err(WalletError::Corrupt(format!(
                        "unsupported database version {version}"
                    )));
                }
                match store.get(layout::OPTIONS)? {
                    Some(stored) if stored == magic => Ok(()),
                    _ => Err(WalletError::InvalidState(format!(
                        "database does not belong to {}",
                        config.network.name()
                    ))),
                }
            }
        }
    }

    /// Filter holding every path hash and watched outpoint in the store.
    fn build_filter(config: &WalletDbConfig, store: &dyn KvStore) -> Result<BloomFilter, WalletError> {
        let mut filter =
            BloomFilter::with_random_tweak(config.filter_items, config.filter_rate, BloomFlags::All)?;
        for tag in [layout::PATH_MAP, layout::OUTPOINT_MAP] {
            for (key, _) in store.prefix(&[tag])? {
                filter.insert(&key[1..]);
            }
        }
        Ok(filter)
    }

    pub fn config(&self) -> &WalletDbConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &dyn KvStore {
        &*self.store
    }

    /// Receive every [`WalletEvent`] published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> Option<ChainState> {
        *self.state.read()
    }

    /// Height of the last processed block, zero before the first.
    pub fn height(&self) -> u32 {
        self.state.read().map_or(0, |s| s.height)
    }

    pub fn sync_status(&self) -> SyncStatus {
        *self.status.read()
    }

    fn set_status(&self, status: SyncStatus) {
        *self.status.write() = status;
    }

    pub fn client(&self) -> Option<Arc<dyn ChainClient>> {
        self.client.read().clone()
    }

    fn require_client(&self) -> Result<Arc<dyn ChainClient>, WalletError> {
        self.client()
            .ok_or_else(|| WalletError::Client("no chain client connected".into()))
    }

    pub(crate) fn lock_ingest(&self) -> MutexGuard<'_, ()> {
        self.tx_lock.lock()
    }

    pub fn get_block_meta(&self, height: u32) -> Result<Option<BlockMeta>, WalletError> {
        self.store
            .get(&layout::block_meta(height))?
            .map(|raw| BlockMeta::from_raw(&raw))
            .transpose()
    }

    /// Fee rate per 1000 bytes: the client's estimate, else the configured
    /// fallback.
    pub fn fee_rate(&self) -> u64 {
        let estimate = self.client().and_then(|client| match client.estimate_fee(1) {
            Ok(rate) => rate,
            Err(e) => {
                debug!(error = %e, "fee estimate failed");
                None
            }
        });
        estimate.unwrap_or(self.config.fallback_rate).max(MIN_RELAY)
    }

    // --- Events and filter ---

    /// Add the hashes and outpoints `events` introduce to the local filter.
    /// Returns the added items.
    fn watch(&self, events: &[WalletEvent]) -> Vec<Vec<u8>> {
        let mut items = Vec::new();
        for event in events {
            match event {
                WalletEvent::Address { addresses, .. } => {
                    items.extend(addresses.iter().map(|a| a.pubkey_hash().as_bytes().to_vec()));
                }
                // a disconnected spend watches its inputs again
                WalletEvent::Tx { details, .. } | WalletEvent::Unconfirmed { details, .. } => {
                    items.extend(details.owned_outpoints().iter().map(|o| o.to_key().to_vec()));
                    if !details.tx.is_coinbase() {
                        items.extend(
                            details
                                .tx
                                .inputs
                                .iter()
                                .map(|i| i.previous_output.to_key().to_vec()),
                        );
                    }
                }
                _ => {}
            }
        }
        if !items.is_empty() {
            let mut filter = self.filter.write();
            for item in &items {
                filter.insert(item);
            }
        }
        items
    }

    /// Push new filter items to the client, then deliver the events.
    fn publish(&self, events: Vec<WalletEvent>, items: Vec<Vec<u8>>) {
        if !items.is_empty() {
            if let Some(client) = self.client() {
                for item in &items {
                    if let Err(e) = client.add_filter(item) {
                        warn!(error = %e, "failed to extend remote filter");
                        break;
                    }
                }
            }
        }
        for event in events {
            // no subscribers is fine
            let _ = self.events.send(event);
        }
    }

    /// Write `txn`, then update the filter and publish its events.
    pub(crate) fn commit(&self, txn: Txn<'_>) -> Result<(), WalletError> {
        let events = txn.commit()?;
        let items = self.watch(&events);
        self.publish(events, items);
        Ok(())
    }

    /// Rebuild the local filter from the store and push it to the client.
    pub fn sync_filter(&self) -> Result<(), WalletError> {
        let filter = Self::build_filter(&self.config, self.store())?;
        *self.filter.write() = filter.clone();
        if let Some(client) = self.client() {
            client.set_filter(&filter)?;
        }
        Ok(())
    }

    pub fn add_filter(&self, data: &[u8]) -> Result<(), WalletError> {
        self.filter.write().insert(data);
        if let Some(client) = self.client() {
            client.add_filter(data)?;
        }
        Ok(())
    }

    /// Drop the remote filter and rebuild the local one from the path and
    /// outpoint maps under a fresh tweak. The client sees nothing until the
    /// next [`sync_filter`](Self::sync_filter).
    pub fn reset_filter(&self) -> Result<(), WalletError> {
        let filter = Self::build_filter(&self.config, self.store())?;
        *self.filter.write() = filter;
        if let Some(client) = self.client() {
            client.reset_filter()?;
        }
        Ok(())
    }

    // --- Wallet registry ---

    pub fn get_wid(&self, id: &str) -> Result<Option<u32>, WalletError> {
        self.store
            .get(&layout::wallet_id(id))?
            .map(|raw| read_u32_value(&raw, "wallet id"))
            .transpose()
    }

    pub fn ensure_wid(&self, id: &str) -> Result<u32, WalletError> {
        self.get_wid(id)?
            .ok_or_else(|| WalletError::NotFound(format!("wallet {id}")))
    }

    pub fn get_id(&self, wid: u32) -> Result<Option<String>, WalletError> {
        self.store
            .get(&layout::wallet_name(wid))?
            .map(|raw| String::from_utf8(raw).map_err(|_| WalletError::Corrupt("wallet name".into())))
            .transpose()
    }

    /// Wallet `wid`, loading it on first access.
    pub fn get_by_wid(&self, wid: u32) -> Result<Option<Arc<Wallet>>, WalletError> {
        let mut wallets = self.wallets.lock();
        if let Some(wallet) = wallets.get(&wid) {
            return Ok(Some(Arc::clone(wallet)));
        }
        let Some(raw) = self.store.get(&layout::wallet(wid))? else {
            return Ok(None);
        };
        let wallet = Arc::new(Wallet::from_raw(
            self.me.clone(),
            wid,
            self.config.network,
            &raw,
        )?);
        wallets.insert(wid, Arc::clone(&wallet));
        debug!(wid, "loaded wallet");
        Ok(Some(wallet))
    }

    pub fn get(&self, id: &str) -> Result<Option<Arc<Wallet>>, WalletError> {
        match self.get_wid(id)? {
            Some(wid) => self.get_by_wid(wid),
            None => Ok(None),
        }
    }

    pub fn primary(&self) -> Result<Arc<Wallet>, WalletError> {
        self.get(PRIMARY_ID)?
            .ok_or_else(|| WalletError::NotFound(format!("wallet {PRIMARY_ID}")))
    }

    /// Ids of every stored wallet, ordered by wid.
    pub fn get_wallets(&self) -> Result<Vec<String>, WalletError> {
        self.store
            .prefix(&[layout::WALLET_NAME])?
            .into_iter()
            .map(|(_, raw)| String::from_utf8(raw).map_err(|_| WalletError::Corrupt("wallet name".into())))
            .collect()
    }

    fn wids(&self) -> Result<Vec<u32>, WalletError> {
        self.store
            .prefix(&[layout::WALLET_NAME])?
            .iter()
            .map(|(key, _)| layout::parse_u32(key, 1).map_err(WalletError::from))
            .collect()
    }

    pub fn register(&self, wallet: Arc<Wallet>) {
        self.wallets.lock().insert(wallet.wid(), wallet);
    }

    /// Drop a wallet from memory. It is reloaded on next access.
    pub fn unregister(&self, wid: u32) -> Option<Arc<Wallet>> {
        self.wallets.lock().remove(&wid)
    }

    /// Create and register a new wallet.
    pub fn create(&self, options: CreateOptions) -> Result<Arc<Wallet>, WalletError> {
        let _write = self.write_lock.lock();
        let id = match options.id {
            Some(id) => id,
            None => hex::encode(rand::random::<[u8; 8]>()),
        };
        if !valid_id(&id) {
            return Err(WalletError::InvalidState(format!("invalid wallet id {id:?}")));
        }
        if self.get_wid(&id)?.is_some() {
            return Err(WalletError::AlreadyExists(format!("wallet {id}")));
        }

        // watch-only wallets keep a throwaway key that only seeds the token
        let master = match (options.master, options.mnemonic) {
            _ if options.watch_only => MasterKey::from_key(HdPrivateKey::generate(), None),
            (Some(key), _) => MasterKey::from_key(key, None),
            (None, Some(phrase)) => {
                let phrase = Zeroizing::new(phrase);
                let key = mnemonic::master_key(&phrase, "")?;
                MasterKey::from_key(key, Some(phrase))
            }
            (None, None) => {
                let phrase = mnemonic::generate(12)?;
                let key = mnemonic::master_key(&phrase, "")?;
                MasterKey::from_key(key, Some(phrase))
            }
        };

        let wid = match self.store.get(layout::NEXT_WID)? {
            Some(raw) => read_u32_value(&raw, "next wid")?,
            None => 0,
        };
        let wallet = Arc::new(Wallet::new(
            self.me.clone(),
            wid,
            id.clone(),
            self.config.network,
            options.watch_only,
            master,
        )?);

        let mut txn = Txn::new(self.store());
        txn.put(layout::wallet_id(&id), wid.to_le_bytes().to_vec());
        txn.put(layout::wallet_name(wid), id.as_bytes().to_vec());
        txn.put(layout::NEXT_WID, (wid + 1).to_le_bytes().to_vec());
        wallet.init(
            &mut txn,
            options.account_key,
            options.passphrase.as_deref(),
        )?;
        self.commit(txn)?;

        self.register(Arc::clone(&wallet));
        info!(wid, id = %id, watch_only = options.watch_only, "created wallet");
        Ok(wallet)
    }

    /// Give wallet `id` a new id. The primary wallet keeps its name.
    pub fn rename(&self, id: &str, new_id: &str) -> Result<(), WalletError> {
        let _write = self.write_lock.lock();
        if id == PRIMARY_ID {
            return Err(WalletError::InvalidState("cannot rename the primary wallet".into()));
        }
        if !valid_id(new_id) {
            return Err(WalletError::InvalidState(format!("invalid wallet id {new_id:?}")));
        }
        if self.get_wid(new_id)?.is_some() {
            return Err(WalletError::AlreadyExists(format!("wallet {new_id}")));
        }
        let wid = self.ensure_wid(id)?;
        let wallet = self
            .get_by_wid(wid)?
            .ok_or_else(|| WalletError::Corrupt(format!("wallet {wid} has no record")))?;

        let mut txn = Txn::new(self.store());
        txn.delete(layout::wallet_id(id));
        txn.put(layout::wallet_id(new_id), wid.to_le_bytes().to_vec());
        txn.put(layout::wallet_name(wid), new_id.as_bytes().to_vec());
        wallet.write_record(&mut txn, new_id)?;
        self.commit(txn)?;
        wallet.set_id(new_id.to_string());
        info!(wid, from = id, to = new_id, "renamed wallet");
        Ok(())
    }

    /// Rebroadcast the pending transactions of every wallet.
    pub fn resend(&self) -> Result<usize, WalletError> {
        let mut total = 0;
        for wid in self.wids()? {
            if let Some(wallet) = self.get_by_wid(wid)? {
                total += wallet.resend()?;
            }
        }
        Ok(total)
    }

    // --- Routing ---

    /// Wallets possibly interested in `tx`: owners of a spent outpoint or
    /// of an output address.
    fn route_tx<R: KvRead + ?Sized>(&self, db: &R, tx: &Transaction) -> Result<BTreeSet<u32>, WalletError> {
        let mut outpoints = Vec::new();
        let mut hashes = Vec::new();
        {
            let filter = self.filter.read();
            if !tx.is_coinbase() {
                for input in &tx.inputs {
                    if filter.contains(&input.previous_output.to_key()) {
                        outpoints.push(input.previous_output);
                    }
                }
            }
            for output in &tx.outputs {
                if filter.contains(output.pubkey_hash.as_bytes()) {
                    hashes.push(output.pubkey_hash);
                }
            }
        }
        let mut wids = BTreeSet::new();
        for outpoint in &outpoints {
            wids.extend(MapRecord::load(db, &layout::outpoint_map(outpoint))?.wids);
        }
        for hash in &hashes {
            wids.extend(MapRecord::load(db, &layout::path_map(hash))?.wids);
        }
        Ok(wids)
    }

    fn wallet_for(&self, wid: u32) -> Result<Arc<Wallet>, WalletError> {
        self.get_by_wid(wid)?
            .ok_or_else(|| WalletError::Corrupt(format!("map references missing wallet {wid}")))
    }

    // --- Ingestion ---

    /// Add an unconfirmed transaction. Returns the number of wallets that
    /// recorded it.
    pub fn add_tx(&self, tx: &Transaction) -> Result<usize, WalletError> {
        let _ingest = self.tx_lock.lock();
        let mut txn = Txn::new(self.store());
        let mut guards: HashMap<u32, ArcMutexGuard<RawMutex, ()>> = HashMap::new();
        let mut items = Vec::new();
        let mut count = 0;
        for wid in self.route_tx(&txn, tx)? {
            let wallet = self.wallet_for(wid)?;
            guards.entry(wid).or_insert_with(|| wallet.lock_write());
            let before = txn.events().len();
            if wallet.add(&mut txn, tx, None)?.is_some() {
                count += 1;
            }
            items.extend(self.watch(&txn.events()[before..]));
        }
        let events = txn.commit()?;
        drop(guards);
        self.publish(events, items);
        Ok(count)
    }

    /// Connect a block at the tip. Lower blocks are ignored; the current
    /// tip is re-applied; a gap or a block not building on the stored tip
    /// triggers a resync through the client.
    pub fn add_block(&self, entry: &ChainEntry, txs: &[Transaction]) -> Result<usize, WalletError> {
        let _ingest = self.tx_lock.lock();
        self.add_block_inner(entry, txs, true)
    }

    fn add_block_inner(
        &self,
        entry: &ChainEntry,
        txs: &[Transaction],
        allow_sync: bool,
    ) -> Result<usize, WalletError> {
        let state = self.state();
        if let Some(state) = state {
            if entry.height < state.height {
                warn!(height = entry.height, tip = state.height, "ignoring low block");
                return Ok(0);
            }
            let mut replaced = false;
            if entry.height == state.height {
                replaced = self
                    .get_block_meta(entry.height)?
                    .is_some_and(|meta| meta.hash != entry.hash);
                if !replaced {
                    debug!(height = entry.height, "re-applying tip block");
                }
            }
            // nothing stored below the first processed block to compare with
            let linked = match entry.height.checked_sub(1) {
                Some(prev) => self
                    .get_block_meta(prev)?
                    .is_none_or(|meta| meta.hash == entry.prev_hash),
                None => true,
            };
            if entry.height > state.height + 1 || !linked || replaced {
                if !allow_sync {
                    return Err(WalletError::InvalidState(format!(
                        "block {} does not connect to tip {}",
                        entry.height, state.height
                    )));
                }
                warn!(height = entry.height, tip = state.height, "block does not connect, resyncing");
                let client = self.require_client()?;
                self.sync_chain_inner(&*client)?;
                return Ok(0);
            }
        }

        let meta = BlockMeta::from_entry(entry);
        let mut txn = Txn::new(self.store());
        let mut guards: HashMap<u32, ArcMutexGuard<RawMutex, ()>> = HashMap::new();
        let mut items = Vec::new();
        let mut count = 0;

        for (index, tx) in txs.iter().enumerate() {
            let block = TxBlock {
                hash: meta.hash,
                height: meta.height,
                time: meta.time,
                index: index as u32,
            };
            for wid in self.route_tx(&txn, tx)? {
                let wallet = self.wallet_for(wid)?;
                guards.entry(wid).or_insert_with(|| wallet.lock_write());
                let before = txn.events().len();
                if wallet.add(&mut txn, tx, Some(block))?.is_some() {
                    count += 1;
                }
                items.extend(self.watch(&txn.events()[before..]));
            }
        }

        let next = match state {
            Some(state) => ChainState {
                height: entry.height,
                ..state
            },
            None => ChainState {
                start_height: entry.height,
                start_hash: entry.hash,
                height: entry.height,
                marked: true,
            },
        };
        // history before the first relevant block has nothing for us
        let next = if count > 0 && !next.marked {
            ChainState {
                start_height: entry.height,
                start_hash: entry.hash,
                marked: true,
                ..next
            }
        } else {
            next
        };
        txn.put(layout::block_meta(entry.height), meta.to_raw());
        txn.put(layout::CHAIN_STATE, next.to_raw());
        let events = txn.commit()?;
        *self.state.write() = Some(next);
        drop(guards);
        self.publish(events, items);

        if count > 0 {
            info!(height = entry.height, hash = %entry.hash, txs = count, "connected block");
        } else {
            debug!(height = entry.height, hash = %entry.hash, "connected block");
        }
        Ok(count)
    }

    /// Disconnect the tip block. Returns the number of transactions
    /// returned to pending or removed.
    pub fn remove_block(&self, entry: &ChainEntry) -> Result<usize, WalletError> {
        let _ingest = self.tx_lock.lock();
        let Some(state) = self.state() else {
            return Ok(0);
        };
        if entry.height > state.height {
            warn!(height = entry.height, tip = state.height, "disconnecting unknown block");
            return Ok(0);
        }
        if entry.height != state.height {
            return Err(WalletError::InvalidState(format!(
                "disconnect of block {} below tip {}",
                entry.height, state.height
            )));
        }
        if let Some(meta) = self.get_block_meta(entry.height)? {
            if meta.hash != entry.hash {
                return Err(WalletError::InvalidState(format!(
                    "disconnect of {} at {} but stored tip is {}",
                    entry.hash, entry.height, meta.hash
                )));
            }
        }
        let count = self.rollback_inner(entry.height.saturating_sub(1))?;
        info!(height = entry.height, hash = %entry.hash, txs = count, "disconnected block");
        Ok(count)
    }

    /// Revert every block above `height`.
    pub fn rollback(&self, height: u32) -> Result<usize, WalletError> {
        let _ingest = self.tx_lock.lock();
        self.rollback_inner(height)
    }

    /// Roll back to the entry the chain was reset to.
    pub fn reset_chain(&self, entry: &ChainEntry) -> Result<usize, WalletError> {
        let _ingest = self.tx_lock.lock();
        if entry.height > self.height() {
            return Err(WalletError::InvalidState(format!(
                "reset to {} above tip {}",
                entry.height,
                self.height()
            )));
        }
        let count = self.rollback_inner(entry.height)?;
        info!(height = entry.height, "chain reset");
        Ok(count)
    }

    /// One batch per block, newest first.
    fn rollback_inner(&self, height: u32) -> Result<usize, WalletError> {
        let Some(mut state) = self.state() else {
            return Ok(0);
        };
        let mut total = 0;
        while state.height > height {
            let tip = state.height;
            let mut txn = Txn::new(self.store());
            let mut guards = Vec::new();
            for wid in MapRecord::load(&txn, &layout::block_map(tip))?.wids {
                let wallet = self.wallet_for(wid)?;
                guards.push(wallet.lock_write());
                total += wallet.revert(&mut txn, tip)?;
            }
            txn.delete(layout::block_meta(tip));

            state.height = tip - 1;
            if state.height < state.start_height {
                state.start_height = state.height;
                state.start_hash = txn
                    .get(&layout::block_meta(state.height))?
                    .map(|raw| BlockMeta::from_raw(&raw))
                    .transpose()?
                    .map_or(Hash256::ZERO, |meta| meta.hash);
            }
            txn.put(layout::CHAIN_STATE, state.to_raw());
            let events = txn.commit()?;
            *self.state.write() = Some(state);
            drop(guards);
            let items = self.watch(&events);
            self.publish(events, items);
            debug!(height = tip, "reverted block");
        }
        if total > 0 {
            info!(height, txs = total, "rolled back");
        }
        Ok(total)
    }

    // --- Chain sync ---

    /// Bind `client`, push the filter and catch up with its chain.
    pub fn connect(&self, client: Arc<dyn ChainClient>) -> Result<(), WalletError> {
        self.set_status(SyncStatus::Connecting);
        *self.client.write() = Some(Arc::clone(&client));
        let _ingest = self.tx_lock.lock();

        if self.state().is_none() {
            let tip = client.get_tip()?;
            let state = ChainState {
                start_height: tip.height,
                start_hash: tip.hash,
                height: tip.height,
                marked: false,
            };
            let mut txn = Txn::new(self.store());
            txn.put(layout::block_meta(tip.height), BlockMeta::from_entry(&tip).to_raw());
            txn.put(layout::CHAIN_STATE, state.to_raw());
            txn.commit()?;
            *self.state.write() = Some(state);
            info!(height = tip.height, "initialized chain state at client tip");
        }

        let filter = self.filter.read().clone();
        client.set_filter(&filter)?;
        self.sync_chain_inner(&*client)?;
        info!(height = self.height(), "connected to chain");
        Ok(())
    }

    pub fn disconnect(&self) {
        *self.client.write() = None;
        self.set_status(SyncStatus::Disconnected);
        info!("disconnected from chain");
    }

    /// Find the newest stored block still on the client's main chain,
    /// roll back to it and replay the rest.
    pub fn sync_chain(&self) -> Result<(), WalletError> {
        let client = self.require_client()?;
        let _ingest = self.tx_lock.lock();
        self.sync_chain_inner(&*client)
    }

    fn sync_chain_inner(&self, client: &dyn ChainClient) -> Result<(), WalletError> {
        let Some(state) = self.state() else {
            return Ok(());
        };
        let mut height = state.height;
        loop {
            let Some(meta) = self.get_block_meta(height)? else {
                break;
            };
            if client.get_entry(height)?.is_some_and(|entry| entry.hash == meta.hash) {
                break;
            }
            if height == 0 {
                return Err(WalletError::InvalidState(format!(
                    "client genesis differs from stored genesis {}",
                    meta.hash
                )));
            }
            height -= 1;
        }
        if height < state.height {
            warn!(fork = height, tip = state.height, "local tip left the main chain");
        }
        self.rollback_inner(height)?;
        self.scan_inner(client, height + 1)
    }

    /// Replay blocks from `start` through the client. Clears the abort
    /// flag check between blocks.
    fn scan_inner(&self, client: &dyn ChainClient, start: u32) -> Result<(), WalletError> {
        self.set_status(SyncStatus::Syncing);
        info!(start, "scanning chain");
        let mut sink = |entry: &ChainEntry, txs: &[Transaction]| -> Result<(), WalletError> {
            if self.abort.load(Ordering::SeqCst) {
                return Err(WalletError::RescanAborted);
            }
            self.add_block_inner(entry, txs, false).map(|_| ())
        };
        if let Err(e) = client.rescan(start, &mut sink) {
            warn!(error = %e, "scan stopped");
            self.set_status(SyncStatus::Synced);
            return Err(e);
        }

        let marked = self.state().map(|state| ChainState {
            marked: true,
            ..state
        });
        if let Some(state) = marked {
            if !self.state().is_some_and(|s| s.marked) {
                let mut txn = Txn::new(self.store());
                txn.put(layout::CHAIN_STATE, state.to_raw());
                txn.commit()?;
                *self.state.write() = Some(state);
            }
        }
        self.set_status(SyncStatus::Synced);
        info!(height = self.height(), "scan complete");
        Ok(())
    }

    /// Roll back below `height` and replay from it. Fails if another
    /// rescan is running.
    pub fn rescan(&self, height: u32) -> Result<(), WalletError> {
        if self.rescanning.swap(true, Ordering::SeqCst) {
            return Err(WalletError::RescanInProgress);
        }
        let _guard = RescanGuard {
            running: &self.rescanning,
            abort: &self.abort,
        };
        let client = self.require_client()?;
        let _ingest = self.tx_lock.lock();
        self.rollback_inner(height.saturating_sub(1))?;
        self.scan_inner(&*client, height)
    }

    /// Stop a running rescan before its next block. Returns false when no
    /// rescan is running.
    pub fn abort_rescan(&self) -> bool {
        if !self.rescanning.load(Ordering::SeqCst) {
            return false;
        }
        self.abort.store(true, Ordering::SeqCst);
        info!("rescan abort requested");
        true
    }

    pub fn is_rescanning(&self) -> bool {
        self.rescanning.load(Ordering::SeqCst)
    }

    /// Run [`rescan`](Self::rescan) on the blocking pool.
    pub fn spawn_rescan(self: &Arc<Self>, height: u32) -> JoinHandle<Result<(), WalletError>> {
        let db = Arc::clone(self);
        tokio::task::spawn_blocking(move || db.rescan(height))
    }

    // --- Event loop ---

    pub fn handle_event(&self, event: ChainEvent) -> Result<(), WalletError> {
        match event {
            ChainEvent::BlockConnect(entry, txs) => self.add_block(&entry, &txs).map(|_| ()),
            ChainEvent::BlockDisconnect(entry) => self.remove_block(&entry).map(|_| ()),
            ChainEvent::BlockRescan(entry, txs) => {
                let _ingest = self.tx_lock.lock();
                self.add_block_inner(&entry, &txs, false).map(|_| ())
            }
            ChainEvent::ChainReset(entry) => self.reset_chain(&entry).map(|_| ()),
            ChainEvent::Tx(tx) => self.add_tx(&tx).map(|_| ()),
        }
    }

    /// Apply chain events in arrival order until the sender goes away.
    /// Each event runs on the blocking pool.
    pub async fn run(self: &Arc<Self>, mut rx: mpsc::Receiver<ChainEvent>) {
        info!("wallet event loop started");
        while let Some(event) = rx.recv().await {
            let name = event.name();
            let db = Arc::clone(self);
            match tokio::task::spawn_blocking(move || db.handle_event(event)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(event = name, error = %e, "failed to apply chain event"),
                Err(e) => {
                    error!(event = name, error = %e, "chain event handler panicked");
                    break;
                }
            }
        }
        info!("chain event channel closed, wallet event loop stopped");
    }

    /// Unbind the client and drop every loaded wallet.
    pub fn close(&self) {
        self.abort_rescan();
        self.disconnect();
        self.wallets.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tally_core::types::{OutPoint, TxInput, TxOutput};

    fn open() -> Arc<WalletDb> {
        WalletDb::open_with_store(
            WalletDbConfig::regtest(std::env::temp_dir()),
            Box::new(MemoryStore::new()),
        )
        .unwrap()
    }

    fn entry(height: u32, fork: u8) -> ChainEntry {
        let hash = |h: u32| {
            let mut b = [fork; 32];
            b[..4].copy_from_slice(&h.to_le_bytes());
            Hash256(b)
        };
        ChainEntry {
            hash: hash(height),
            prev_hash: hash(height.wrapping_sub(1)),
            height,
            time: 1_700_000_000 + height,
        }
    }

    fn pay(to: Hash256, value: u64, seed: u8) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput::unsigned(OutPoint::new(Hash256([seed; 32]), 0))],
            outputs: vec![TxOutput {
                value,
                pubkey_hash: to,
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn registry_ids() {
        let db = open();
        assert_eq!(db.get_wid(PRIMARY_ID).unwrap(), Some(0));
        let w = db
            .create(CreateOptions {
                id: Some("alice".into()),
                ..CreateOptions::default()
            })
            .unwrap();
        assert_eq!(w.wid(), 1);
        assert_eq!(db.get_id(1).unwrap().as_deref(), Some("alice"));
        assert!(matches!(
            db.create(CreateOptions {
                id: Some("alice".into()),
                ..CreateOptions::default()
            }),
            Err(WalletError::AlreadyExists(_))
        ));
        assert!(db
            .create(CreateOptions {
                id: Some("bad id!".into()),
                ..CreateOptions::default()
            })
            .is_err());
        assert_eq!(db.get_wallets().unwrap(), vec!["primary", "alice"]);

        let anon = db.create(CreateOptions::default()).unwrap();
        assert_eq!(anon.id().len(), 16);
    }

    #[test]
    fn unregistered_wallet_reloads() {
        let db = open();
        let primary = db.primary().unwrap();
        let token = primary.token();
        let address = primary.receive_address(0).unwrap();
        assert!(db.unregister(0).is_some());
        let reloaded = db.get_by_wid(0).unwrap().unwrap();
        assert!(!Arc::ptr_eq(&primary, &reloaded));
        assert_eq!(reloaded.token(), token);
        assert_eq!(reloaded.receive_address(0).unwrap(), address);
    }

    #[test]
    fn rename_wallet() {
        let db = open();
        db.create(CreateOptions {
            id: Some("old".into()),
            ..CreateOptions::default()
        })
        .unwrap();
        db.rename("old", "new").unwrap();
        assert!(db.get("old").unwrap().is_none());
        let wallet = db.get("new").unwrap().unwrap();
        assert_eq!(wallet.id(), "new");
        assert!(db.rename(PRIMARY_ID, "main").is_err());
        assert!(matches!(db.rename("missing", "x"), Err(WalletError::NotFound(_))));

        db.unregister(wallet.wid());
        assert_eq!(db.get("new").unwrap().unwrap().id(), "new");
    }

    #[test]
    fn blocks_route_to_owning_wallets() {
        let db = open();
        let mut rx = db.subscribe();
        let bob = db
            .create(CreateOptions {
                id: Some("bob".into()),
                ..CreateOptions::default()
            })
            .unwrap();
        let primary = db.primary().unwrap();
        let to_primary = primary.receive_address(0).unwrap().pubkey_hash();
        let to_bob = bob.receive_address(0).unwrap().pubkey_hash();

        let txs = vec![
            pay(to_primary, 1_000, 1),
            pay(to_bob, 2_000, 2),
            pay(Hash256([0x55; 32]), 3_000, 3),
        ];
        assert_eq!(db.add_block(&entry(1, 0), &txs).unwrap(), 2);
        assert_eq!(db.height(), 1);
        assert_eq!(primary.get_balance(None).unwrap().confirmed, 1_000);
        assert_eq!(bob.get_balance(None).unwrap().confirmed, 2_000);

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        assert!(names.contains(&"confirmed"));
        assert!(names.contains(&"balance"));

        // low blocks are ignored, the tip is re-applied harmlessly
        assert_eq!(db.add_block(&entry(0, 0), &[]).unwrap(), 0);
        assert_eq!(db.add_block(&entry(1, 0), &txs).unwrap(), 0);
        assert_eq!(primary.get_balance(None).unwrap().confirmed, 1_000);
    }

    #[test]
    fn gap_without_client_fails() {
        let db = open();
        db.add_block(&entry(1, 0), &[]).unwrap();
        assert!(matches!(
            db.add_block(&entry(3, 0), &[]),
            Err(WalletError::Client(_))
        ));
        assert!(matches!(
            db.add_block(&entry(2, 9), &[]),
            Err(WalletError::Client(_))
        ));
        assert_eq!(db.height(), 1);
    }

    #[test]
    fn remove_block_unconfirms() {
        let db = open();
        let primary = db.primary().unwrap();
        let to = primary.receive_address(0).unwrap().pubkey_hash();
        db.add_block(&entry(1, 0), &[]).unwrap();
        db.add_block(&entry(2, 0), &[pay(to, 7_000, 1)]).unwrap();

        assert!(db.remove_block(&entry(1, 0)).is_err());
        assert_eq!(db.remove_block(&entry(2, 0)).unwrap(), 1);
        assert_eq!(db.height(), 1);
        assert!(db.get_block_meta(2).unwrap().is_none());
        let balance = primary.get_balance(None).unwrap();
        assert_eq!(balance.confirmed, 0);
        assert_eq!(balance.unconfirmed, 7_000);
    }

    #[test]
    fn remove_block_rejects_foreign_tip() {
        let db = open();
        db.add_block(&entry(1, 0), &[]).unwrap();
        db.add_block(&entry(2, 0), &[]).unwrap();
        assert!(matches!(
            db.remove_block(&entry(2, 7)),
            Err(WalletError::InvalidState(_))
        ));
        assert_eq!(db.height(), 2);
        assert_eq!(db.get_block_meta(2).unwrap().unwrap().hash, entry(2, 0).hash);
    }

    #[test]
    fn reset_filter_keeps_local_routing() {
        let db = open();
        let primary = db.primary().unwrap();
        let to = primary.receive_address(0).unwrap().pubkey_hash();
        db.reset_filter().unwrap();
        assert_eq!(db.add_tx(&pay(to, 5_000, 1)).unwrap(), 1);
        assert_eq!(primary.get_balance(None).unwrap().unconfirmed, 5_000);
    }

    #[test]
    fn unconfirmed_tx_routing() {
        let db = open();
        let primary = db.primary().unwrap();
        let to = primary.receive_address(0).unwrap().pubkey_hash();
        assert_eq!(db.add_tx(&pay(Hash256([0x66; 32]), 5, 1)).unwrap(), 0);
        assert_eq!(db.add_tx(&pay(to, 4_000, 2)).unwrap(), 1);
        // known pending tx is not recorded twice
        assert_eq!(db.add_tx(&pay(to, 4_000, 2)).unwrap(), 0);
        assert_eq!(primary.get_pending(None).unwrap().len(), 1);
    }

    #[test]
    fn rescan_needs_client_and_is_exclusive() {
        let db = open();
        assert!(matches!(db.rescan(0), Err(WalletError::Client(_))));
        assert!(!db.is_rescanning());
        assert!(!db.abort_rescan());
    }

    #[test]
    fn reopen_keeps_state_and_wallets() {
        let dir = tempfile::tempdir().unwrap();
        let config = WalletDbConfig::regtest(dir.path().to_path_buf());
        let to = {
            let db = WalletDb::open(config.clone()).unwrap();
            let primary = db.primary().unwrap();
            let to = primary.receive_address(0).unwrap().pubkey_hash();
            db.add_block(&entry(1, 0), &[pay(to, 9_000, 1)]).unwrap();
            db.close();
            to
        };
        let db = WalletDb::open(config.clone()).unwrap();
        assert_eq!(db.height(), 1);
        assert_eq!(db.state().unwrap().start_height, 1);
        let primary = db.primary().unwrap();
        assert_eq!(primary.get_balance(None).unwrap().confirmed, 9_000);
        assert!(primary.get_path(&to).unwrap().is_some());
        drop(primary);
        drop(db);

        let mut testnet = config.clone();
        testnet.network = tally_core::constants::Network::Testnet;
        let store = RocksStore::open(config.db_path()).unwrap();
        assert!(matches!(
            WalletDb::open_with_store(testnet, Box::new(store)),
            Err(WalletError::InvalidState(_))
        ));
    }
}
