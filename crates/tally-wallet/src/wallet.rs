//! A single wallet: accounts, keys, funding, signing and its ledger.
//!
//! Writes follow a fixed lock order. Funding takes the fund lock, then the
//! database ingestion lock (through [`WalletDb::add_tx`]), then this
//! wallet's write lock. Key derivation only ever takes the write lock.
//!
//! Raw wallet record:
//!
//! ```text
//! varstr id | u8 watch only | u32 account depth | 32 token | u32 token depth | master key
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::BufMut;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex, RwLock};
use serde::{Deserialize, Serialize};
use tally_core::address::Address;
use tally_core::constants::{COINBASE_MATURITY, Network};
use tally_core::crypto::{PrivateKey, PublicKey};
use tally_core::encoding::{Reader, put_var_str};
use tally_core::hd::{HARDENED, HdPublicKey};
use tally_core::types::{Coin, Hash256, OutPoint, Transaction};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::account::Account;
use crate::builder::TxDraft;
use crate::coin_selection::{Selected, Selection, SelectorOptions};
use crate::credit::{Balance, Credit};
use crate::details::TxDetails;
use crate::encryption::{IV_LEN, open, seal};
use crate::error::WalletError;
use crate::events::WalletEvent;
use crate::layout;
use crate::master_key::MasterKey;
use crate::path::{CHANGE, Path, PathKind, RECEIVE};
use crate::records::{TxBlock, TxRecord};
use crate::store::{KvRead, Txn};
use crate::txdb::TxDb;
use crate::wallet_key::WalletKey;
use crate::walletdb::WalletDb;

/// Name of the account every wallet starts with.
pub const DEFAULT_ACCOUNT: &str = "default";

/// Options for funding a draft.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FundOptions {
    /// Account to spend from and send change to. Coins of every account
    /// are eligible when `None`; change then goes to account 0.
    pub account: Option<u32>,
    pub selection: Selection,
    pub subtract_fee: bool,
    pub subtract_index: Option<usize>,
    pub depth: Option<u32>,
    pub hard_fee: Option<u64>,
    /// Fee rate per 1000 bytes. Estimated when `None`.
    pub rate: Option<u64>,
    pub max_fee: Option<u64>,
    pub round: bool,
}

#[derive(Debug, Clone, Copy)]
struct WalletState {
    account_depth: u32,
    token: [u8; 32],
    token_depth: u32,
}

pub struct Wallet {
    db: Weak<WalletDb>,
    wid: u32,
    id: Arc<RwLock<String>>,
    network: Network,
    watch_only: bool,
    state: Mutex<WalletState>,
    master: Mutex<MasterKey>,
    txdb: TxDb,
    write_lock: Arc<Mutex<()>>,
    fund_lock: Mutex<()>,
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("wid", &self.wid)
            .field("id", &*self.id.read())
            .field("watch_only", &self.watch_only)
            .finish_non_exhaustive()
    }
}

fn token_for(master: &mut MasterKey, depth: u32) -> Result<[u8; 32], WalletError> {
    let key = master.key()?;
    Ok(*blake3::keyed_hash(key.key_bytes(), &depth.to_le_bytes()).as_bytes())
}

/// IV used to seal an imported key: the leading bytes of its address hash.
fn import_iv(hash: &Hash256) -> &[u8] {
    &hash.as_bytes()[..IV_LEN]
}

impl Wallet {
    /// A new, unsaved wallet. The master key must be unlocked.
    pub(crate) fn new(
        db: Weak<WalletDb>,
        wid: u32,
        id: String,
        network: Network,
        watch_only: bool,
        mut master: MasterKey,
    ) -> Result<Self, WalletError> {
        let token = token_for(&mut master, 0)?;
        let id = Arc::new(RwLock::new(id));
        Ok(Self {
            db,
            wid,
            txdb: TxDb::new(wid, Arc::clone(&id), network),
            id,
            network,
            watch_only,
            state: Mutex::new(WalletState {
                account_depth: 0,
                token,
                token_depth: 0,
            }),
            master: Mutex::new(master),
            write_lock: Arc::new(Mutex::new(())),
            fund_lock: Mutex::new(()),
        })
    }

    pub(crate) fn from_raw(
        db: Weak<WalletDb>,
        wid: u32,
        network: Network,
        data: &[u8],
    ) -> Result<Self, WalletError> {
        let mut r = Reader::new(data);
        let id = Arc::new(RwLock::new(r.read_var_str()?));
        let watch_only = r.read_bool()?;
        let state = WalletState {
            account_depth: r.read_u32()?,
            token: r.read_array::<32>()?,
            token_depth: r.read_u32()?,
        };
        let master = MasterKey::read(&mut r)?;
        r.finish()?;
        Ok(Self {
            db,
            wid,
            txdb: TxDb::new(wid, Arc::clone(&id), network),
            id,
            network,
            watch_only,
            state: Mutex::new(state),
            master: Mutex::new(master),
            write_lock: Arc::new(Mutex::new(())),
            fund_lock: Mutex::new(()),
        })
    }

    fn to_raw(&self, id: &str, state: &WalletState, master: &MasterKey) -> Result<Vec<u8>, WalletError> {
        let mut out = Vec::with_capacity(id.len() + 48 + 66);
        put_var_str(&mut out, id);
        out.put_u8(u8::from(self.watch_only));
        out.put_u32_le(state.account_depth);
        out.put_slice(&state.token);
        out.put_u32_le(state.token_depth);
        out.put_slice(&master.to_raw()?);
        Ok(out)
    }

    /// Stage the wallet record under `id`.
    pub(crate) fn write_record(&self, txn: &mut Txn<'_>, id: &str) -> Result<(), WalletError> {
        let state = *self.state.lock();
        let raw = self.to_raw(id, &state, &self.master.lock())?;
        txn.put(layout::wallet(self.wid), raw);
        Ok(())
    }

    fn save(&self, txn: &mut Txn<'_>) -> Result<(), WalletError> {
        let id = self.id();
        self.write_record(txn, &id)
    }

    pub(crate) fn set_id(&self, id: String) {
        *self.id.write() = id;
    }

    /// Create the default account and seal the master key. Runs inside the
    /// registry transaction that creates the wallet.
    pub(crate) fn init(
        &self,
        txn: &mut Txn<'_>,
        account_key: Option<HdPublicKey>,
        passphrase: Option<&str>,
    ) -> Result<(), WalletError> {
        self.create_account_inner(txn, DEFAULT_ACCOUNT, account_key)?;
        if let Some(passphrase) = passphrase {
            let kdf = self.db()?.config().kdf;
            self.master.lock().encrypt(passphrase.as_bytes(), kdf)?;
        }
        self.save(txn)
    }

    fn db(&self) -> Result<Arc<WalletDb>, WalletError> {
        self.db.upgrade().ok_or(WalletError::Closed)
    }

    pub fn wid(&self) -> u32 {
        self.wid
    }

    pub fn id(&self) -> String {
        self.id.read().clone()
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn is_watch_only(&self) -> bool {
        self.watch_only
    }

    pub fn txdb(&self) -> &TxDb {
        &self.txdb
    }

    /// Take the write lock as an owned guard, for callers batching several
    /// wallets into one transaction.
    pub(crate) fn lock_write(&self) -> ArcMutexGuard<RawMutex, ()> {
        self.write_lock.lock_arc()
    }

    fn commit(&self, db: &WalletDb, txn: Txn<'_>) -> Result<(), WalletError> {
        db.commit(txn)
    }

    fn emit_addresses(&self, txn: &mut Txn<'_>, account: u32, keys: &[WalletKey]) {
        if keys.is_empty() {
            return;
        }
        txn.emit(WalletEvent::Address {
            wid: self.wid,
            id: self.id(),
            account,
            addresses: keys.iter().map(|k| k.address(self.network)).collect(),
        });
    }

    // --- Accounts ---

    fn create_account_inner(
        &self,
        txn: &mut Txn<'_>,
        name: &str,
        account_key: Option<HdPublicKey>,
    ) -> Result<Account, WalletError> {
        if name.is_empty() || name.len() > 40 {
            return Err(WalletError::InvalidState(format!("bad account name {name:?}")));
        }
        if txn.has(&layout::account_index(self.wid, name))? {
            return Err(WalletError::AlreadyExists(format!("account {name}")));
        }
        let index = self.state.lock().account_depth;
        let key = match (self.watch_only, account_key) {
            (true, Some(key)) => key,
            (true, None) => {
                return Err(WalletError::InvalidState(
                    "watch-only accounts need an account key".into(),
                ));
            }
            (false, Some(_)) => {
                return Err(WalletError::InvalidState(
                    "account keys can only be given to watch-only wallets".into(),
                ));
            }
            (false, None) => self.master.lock().key()?.derive(index | HARDENED).to_public(),
        };

        let lookahead = self.db()?.config().lookahead;
        let mut account = Account::new(self.wid, name, index, key, self.watch_only, lookahead);
        let keys = account.init(txn)?;
        self.emit_addresses(txn, index, &keys);
        self.state.lock().account_depth = index + 1;
        self.save(txn)?;
        info!(wid = self.wid, account = index, name, "created account");
        Ok(account)
    }

    /// Add an account. Watch-only wallets must supply its public key;
    /// others derive it from the master key, which must be unlocked.
    pub fn create_account(
        &self,
        name: &str,
        account_key: Option<HdPublicKey>,
    ) -> Result<Account, WalletError> {
        let db = self.db()?;
        let _write = self.write_lock.lock();
        let mut txn = Txn::new(db.store());
        let account = self.create_account_inner(&mut txn, name, account_key)?;
        self.commit(&db, txn)?;
        Ok(account)
    }

    pub fn get_account(&self, index: u32) -> Result<Option<Account>, WalletError> {
        Account::load(self.db()?.store(), self.wid, index)
    }

    fn require_account<R: KvRead + ?Sized>(&self, db: &R, index: u32) -> Result<Account, WalletError> {
        Account::load(db, self.wid, index)?
            .ok_or_else(|| WalletError::NotFound(format!("account {index}")))
    }

    /// Index of the account called `name`.
    pub fn account_index(&self, name: &str) -> Result<Option<u32>, WalletError> {
        let db = self.db()?;
        match db.store().get(&layout::account_index(self.wid, name))? {
            Some(raw) => {
                let bytes: [u8; 4] = raw
                    .as_slice()
                    .try_into()
                    .map_err(|_| WalletError::Corrupt(format!("account index for {name}")))?;
                Ok(Some(u32::from_le_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    /// Account names ordered by index.
    pub fn get_accounts(&self) -> Result<Vec<String>, WalletError> {
        let db = self.db()?;
        db.store()
            .prefix(&layout::account_name_prefix(self.wid))?
            .into_iter()
            .map(|(_, raw)| {
                String::from_utf8(raw).map_err(|_| WalletError::Corrupt("account name".into()))
            })
            .collect()
    }

    fn create_key(&self, account: u32, branch: u32) -> Result<WalletKey, WalletError> {
        let db = self.db()?;
        let _write = self.write_lock.lock();
        let mut txn = Txn::new(db.store());
        let mut acct = self.require_account(&txn, account)?;
        let (key, saved) = acct.create_key(&mut txn, branch)?;
        self.emit_addresses(&mut txn, account, &saved);
        self.commit(&db, txn)?;
        Ok(key)
    }

    /// Expose the next receive key of `account`.
    pub fn create_receive(&self, account: u32) -> Result<WalletKey, WalletError> {
        self.create_key(account, RECEIVE)
    }

    pub fn create_change(&self, account: u32) -> Result<WalletKey, WalletError> {
        self.create_key(account, CHANGE)
    }

    pub fn receive_address(&self, account: u32) -> Result<Address, WalletError> {
        let db = self.db()?;
        self.require_account(db.store(), account)?.receive_address(self.network)
    }

    pub fn change_address(&self, account: u32) -> Result<Address, WalletError> {
        let db = self.db()?;
        self.require_account(db.store(), account)?.change_address(self.network)
    }

    /// Resize the lookahead window of `account`.
    pub fn set_lookahead(&self, account: u32, lookahead: u32) -> Result<(), WalletError> {
        let db = self.db()?;
        let _write = self.write_lock.lock();
        let mut txn = Txn::new(db.store());
        let mut acct = self.require_account(&txn, account)?;
        let added = acct.set_lookahead(&mut txn, lookahead)?;
        self.emit_addresses(&mut txn, account, &added);
        self.commit(&db, txn)
    }

    // --- Imports ---

    fn import(&self, key: WalletKey, private: Option<&PrivateKey>, passphrase: Option<&str>) -> Result<(), WalletError> {
        let db = self.db()?;
        let _write = self.write_lock.lock();
        let mut txn = Txn::new(db.store());
        let account = key.account();
        self.require_account(&txn, account)?;
        if txn.has(&layout::path(self.wid, &key.hash))? {
            return Err(WalletError::AlreadyExists(format!(
                "address {}",
                key.address(self.network)
            )));
        }

        let path = match private {
            Some(private) => {
                let data = Zeroizing::new(private.to_bytes());
                let mut master = self.master.lock();
                if master.is_encrypted() {
                    if let Some(passphrase) = passphrase {
                        master.unlock(passphrase.as_bytes(), db.config().key_timeout())?;
                    }
                    let sealed = master.encipher(&*data, import_iv(&key.hash))?;
                    key.to_path(true, sealed)
                } else {
                    key.to_path(false, data.to_vec())
                }
            }
            None => key.to_path(false, Vec::new()),
        };

        Account::save_path(&mut txn, self.wid, &path)?;
        self.emit_addresses(&mut txn, account, std::slice::from_ref(&key));
        self.commit(&db, txn)?;
        debug!(wid = self.wid, account, hash = %key.hash, "imported key");
        Ok(())
    }

    /// Import a private key into `account`. The key is sealed with the
    /// master cipher key when the wallet is encrypted.
    pub fn import_key(
        &self,
        account: u32,
        private: PrivateKey,
        passphrase: Option<&str>,
    ) -> Result<(), WalletError> {
        if self.watch_only {
            return Err(WalletError::InvalidState(
                "cannot import a private key into a watch-only wallet".into(),
            ));
        }
        let key = WalletKey::from_private(account, private.clone());
        self.import(key, Some(&private), passphrase)
    }

    pub fn import_public(&self, account: u32, public: PublicKey) -> Result<(), WalletError> {
        if !self.watch_only {
            return Err(WalletError::InvalidState(
                "cannot import a public key into a spending wallet".into(),
            ));
        }
        self.import(WalletKey::from_public(account, public), None, None)
    }

    pub fn import_address(&self, account: u32, address: &Address) -> Result<(), WalletError> {
        if !self.watch_only {
            return Err(WalletError::InvalidState(
                "cannot import an address into a spending wallet".into(),
            ));
        }
        self.import(WalletKey::watch(account, address.pubkey_hash()), None, None)
    }

    pub fn get_path(&self, hash: &Hash256) -> Result<Option<Path>, WalletError> {
        self.txdb.get_path(self.db()?.store(), hash)
    }

    pub fn has_address(&self, address: &Address) -> Result<bool, WalletError> {
        Ok(self.get_path(&address.pubkey_hash())?.is_some())
    }

    // --- Passphrase and token ---

    /// Change, set or remove the passphrase. Imported keys are re-sealed
    /// under the new cipher key.
    pub fn set_passphrase(&self, old: Option<&str>, new: Option<&str>) -> Result<(), WalletError> {
        if old.is_none() && new.is_none() {
            return Err(WalletError::InvalidState("no passphrase given".into()));
        }
        let db = self.db()?;
        let _write = self.write_lock.lock();
        let mut txn = Txn::new(db.store());
        {
            let mut master = self.master.lock();
            let old_key = match old {
                Some(old) => Some(master.decrypt(old.as_bytes())?),
                None if master.is_encrypted() => return Err(WalletError::InvalidPassphrase),
                None => None,
            };
            let new_key = match new {
                Some(new) => Some(master.encrypt(new.as_bytes(), db.config().kdf)?),
                None => None,
            };

            for (key, raw) in txn.prefix(&layout::path_prefix(self.wid))? {
                let hash = layout::parse_hash(&key, 5)?;
                let mut path = Path::from_raw(hash, &raw)?;
                let PathKind::Imported { encrypted, data } = &path.kind else {
                    continue;
                };
                if data.is_empty() {
                    continue;
                }
                let iv = import_iv(&hash);
                let plain = match (&old_key, *encrypted) {
                    (Some(old_key), true) => open(old_key, iv, data)?,
                    (None, true) => return Err(WalletError::Corrupt("sealed key without passphrase".into())),
                    (_, false) => Zeroizing::new(data.clone()),
                };
                path.kind = match &new_key {
                    Some(new_key) => PathKind::Imported {
                        encrypted: true,
                        data: seal(new_key, iv, &plain)?,
                    },
                    None => PathKind::Imported {
                        encrypted: false,
                        data: plain.to_vec(),
                    },
                };
                txn.put(layout::path(self.wid, &hash), path.to_raw());
            }
        }
        self.save(&mut txn)?;
        self.commit(&db, txn)?;
        info!(wid = self.wid, encrypted = new.is_some(), "changed passphrase");
        Ok(())
    }

    /// Decrypt the master key for `timeout`, or the configured default.
    pub fn unlock(&self, passphrase: &str, timeout: Option<Duration>) -> Result<(), WalletError> {
        let timeout = match timeout {
            Some(t) => Some(t),
            None => self.db()?.config().key_timeout(),
        };
        self.master.lock().unlock(passphrase.as_bytes(), timeout)
    }

    pub fn lock(&self) {
        self.master.lock().lock();
    }

    pub fn is_locked(&self) -> bool {
        !self.master.lock().is_unlocked()
    }

    pub fn is_encrypted(&self) -> bool {
        self.master.lock().is_encrypted()
    }

    /// BIP-39 phrase of an unlocked wallet, when it was created from one.
    pub fn mnemonic(&self) -> Result<Option<Zeroizing<String>>, WalletError> {
        Ok(self
            .master
            .lock()
            .mnemonic()?
            .map(|m| Zeroizing::new(m.to_string())))
    }

    pub fn token(&self) -> [u8; 32] {
        self.state.lock().token
    }

    pub fn token_depth(&self) -> u32 {
        self.state.lock().token_depth
    }

    /// Replace the API token with the next one in sequence.
    pub fn retoken(&self, passphrase: Option<&str>) -> Result<[u8; 32], WalletError> {
        let db = self.db()?;
        let _write = self.write_lock.lock();
        let mut txn = Txn::new(db.store());
        let token = {
            let mut master = self.master.lock();
            if let Some(passphrase) = passphrase {
                master.unlock(passphrase.as_bytes(), db.config().key_timeout())?;
            }
            let mut state = self.state.lock();
            let depth = state.token_depth + 1;
            let token = token_for(&mut master, depth)?;
            state.token = token;
            state.token_depth = depth;
            token
        };
        self.save(&mut txn)?;
        self.commit(&db, txn)?;
        Ok(token)
    }

    pub fn check_token(&self, token: &[u8]) -> Result<(), WalletError> {
        let token: [u8; 32] = token.try_into().map_err(|_| WalletError::InvalidToken)?;
        if blake3::Hash::from(self.state.lock().token) == token {
            Ok(())
        } else {
            Err(WalletError::InvalidToken)
        }
    }

    // --- Spending ---

    /// Unspent, unlocked coins that are confirmed or came from our own
    /// transactions.
    fn spendable_coins(&self, db: &WalletDb, account: Option<u32>) -> Result<Vec<Coin>, WalletError> {
        Ok(self
            .txdb
            .get_credits(db.store(), account)?
            .into_iter()
            .filter(|credit| !credit.spent && !self.txdb.is_locked(&credit.outpoint()))
            .filter(|credit| credit.coin.height.is_some() || credit.own)
            .map(|credit| credit.coin)
            .collect())
    }

    fn fund_inner(
        &self,
        db: &WalletDb,
        draft: &mut TxDraft,
        options: &FundOptions,
    ) -> Result<Selected, WalletError> {
        let change_account = options.account.unwrap_or(0);
        let change = self
            .require_account(db.store(), change_account)?
            .current_key(CHANGE)?
            .hash;
        let rate = match options.rate {
            Some(rate) => rate,
            None => db.fee_rate(),
        };
        let selector = SelectorOptions {
            selection: options.selection,
            subtract_fee: options.subtract_fee,
            subtract_index: options.subtract_index,
            height: db.height(),
            depth: options.depth,
            hard_fee: options.hard_fee,
            rate,
            long_term_rate: db.config().long_term_rate,
            max_fee: options.max_fee,
            round: options.round,
            coinbase_maturity: COINBASE_MATURITY,
        };
        let coins = self.spendable_coins(db, options.account)?;
        let selected = draft.fund(&coins, &selector, change)?;
        debug!(
            wid = self.wid,
            inputs = selected.coins.len(),
            fee = selected.fee,
            change = selected.change,
            "funded draft"
        );
        Ok(selected)
    }

    /// Add inputs and change to `draft`.
    pub fn fund(&self, draft: &mut TxDraft, options: &FundOptions) -> Result<Selected, WalletError> {
        let db = self.db()?;
        let _fund = self.fund_lock.lock();
        self.fund_inner(&db, draft, options)
    }

    fn draft_for(outputs: &[(Address, u64)]) -> Result<TxDraft, WalletError> {
        let mut draft = TxDraft::new();
        for (address, value) in outputs {
            draft.add_output(address, *value)?;
        }
        Ok(draft)
    }

    /// A funded, unsigned draft paying `outputs`.
    pub fn create_tx(
        &self,
        outputs: &[(Address, u64)],
        options: &FundOptions,
    ) -> Result<TxDraft, WalletError> {
        let mut draft = Self::draft_for(outputs)?;
        self.fund(&mut draft, options)?;
        Ok(draft)
    }

    fn private_key_for(
        &self,
        master: &mut MasterKey,
        path: &Path,
    ) -> Result<Option<PrivateKey>, WalletError> {
        match &path.kind {
            PathKind::Hd { branch, index } => Ok(Some(
                master
                    .key()?
                    .derive(path.account | HARDENED)
                    .derive(*branch)
                    .derive(*index)
                    .private_key(),
            )),
            PathKind::Imported { data, .. } if data.is_empty() => Ok(None),
            PathKind::Imported { encrypted, data } => {
                let raw = if *encrypted {
                    master.decipher(data, import_iv(&path.hash))?
                } else {
                    Zeroizing::new(data.clone())
                };
                Ok(Some(PrivateKey::from_bytes(&raw)?))
            }
            PathKind::Address => Ok(None),
        }
    }

    /// Sign every input of `draft` spending one of our coins. Returns the
    /// number of inputs signed.
    pub fn sign(&self, draft: &mut TxDraft, passphrase: Option<&str>) -> Result<usize, WalletError> {
        if self.watch_only {
            return Err(WalletError::InvalidState("cannot sign from a watch-only wallet".into()));
        }
        let db = self.db()?;
        let mut master = self.master.lock();
        if let Some(passphrase) = passphrase {
            master.unlock(passphrase.as_bytes(), db.config().key_timeout())?;
        }
        let mut keys: HashMap<Hash256, PrivateKey> = HashMap::new();
        for coin in draft.view().iter() {
            if keys.contains_key(&coin.pubkey_hash) {
                continue;
            }
            let Some(path) = self.txdb.get_path(db.store(), &coin.pubkey_hash)? else {
                continue;
            };
            if let Some(key) = self.private_key_for(&mut master, &path)? {
                keys.insert(coin.pubkey_hash, key);
            }
        }
        drop(master);
        draft.sign(|hash| keys.get(hash).cloned())
    }

    /// Build, sign, record and relay a transaction paying `outputs`.
    pub fn send(
        &self,
        outputs: &[(Address, u64)],
        options: &FundOptions,
        passphrase: Option<&str>,
    ) -> Result<TxDetails, WalletError> {
        let db = self.db()?;
        let _fund = self.fund_lock.lock();
        let mut draft = Self::draft_for(outputs)?;
        self.fund_inner(&db, &mut draft, options)?;
        self.sign(&mut draft, passphrase)?;
        let tx = draft.finalize()?;
        let hash = tx.txid()?;

        db.add_tx(&tx)?;
        let details = self
            .txdb
            .get_details(db.store(), &hash)?
            .ok_or_else(|| WalletError::InvalidState(format!("sent tx {hash} was not recorded")))?;
        if let Some(client) = db.client() {
            client.send(&tx)?;
        }
        info!(wid = self.wid, tx = %hash, fee = ?details.fee, "sent tx");
        Ok(details)
    }

    /// Relay every pending transaction again. Returns how many were sent.
    pub fn resend(&self) -> Result<usize, WalletError> {
        let db = self.db()?;
        let Some(client) = db.client() else {
            return Ok(0);
        };
        let pending = self.txdb.get_pending(db.store(), None)?;
        for wtx in &pending {
            client.send(&wtx.tx)?;
        }
        if !pending.is_empty() {
            info!(wid = self.wid, count = pending.len(), "rebroadcast pending txs");
        }
        Ok(pending.len())
    }

    // --- Ledger ---

    /// Record `tx` and advance account depths for any derived key it
    /// pays. Caller holds the database ingestion lock and this wallet's
    /// write lock.
    pub(crate) fn add(
        &self,
        txn: &mut Txn<'_>,
        tx: &Transaction,
        block: Option<TxBlock>,
    ) -> Result<Option<TxDetails>, WalletError> {
        let Some(details) = self.txdb.add(txn, tx, block)? else {
            return Ok(None);
        };
        let mut accounts: BTreeMap<u32, Account> = BTreeMap::new();
        for output in &details.outputs {
            let Some(path) = &output.path else { continue };
            let Some((branch, index)) = path.derivation() else {
                continue;
            };
            if !accounts.contains_key(&path.account) {
                let account = self.require_account(&*txn, path.account)?;
                accounts.insert(path.account, account);
            }
            if let Some(account) = accounts.get_mut(&path.account) {
                let keys = account.sync_depth(txn, branch, index)?;
                self.emit_addresses(txn, path.account, &keys);
            }
        }
        Ok(Some(details))
    }

    /// Unconfirm this wallet's transactions in the block at `height`.
    pub(crate) fn revert(&self, txn: &mut Txn<'_>, height: u32) -> Result<usize, WalletError> {
        self.txdb.revert(txn, height)
    }

    /// Remove a pending transaction and everything spending it.
    pub fn abandon(&self, hash: &Hash256) -> Result<TxDetails, WalletError> {
        let db = self.db()?;
        let _ingest = db.lock_ingest();
        let _write = self.write_lock.lock();
        let mut txn = Txn::new(db.store());
        let details = self.txdb.abandon(&mut txn, hash)?;
        self.commit(&db, txn)?;
        Ok(details)
    }

    /// Remove pending transactions older than `age` seconds.
    pub fn zap(&self, account: Option<u32>, age: u32) -> Result<Vec<Hash256>, WalletError> {
        let db = self.db()?;
        let _ingest = db.lock_ingest();
        let _write = self.write_lock.lock();
        let mut txn = Txn::new(db.store());
        let removed = self.txdb.zap(&mut txn, account, age)?;
        self.commit(&db, txn)?;
        Ok(removed)
    }

    pub fn lock_coin(&self, outpoint: OutPoint) -> bool {
        self.txdb.lock_coin(outpoint)
    }

    pub fn unlock_coin(&self, outpoint: &OutPoint) -> bool {
        self.txdb.unlock_coin(outpoint)
    }

    pub fn get_locked(&self) -> Vec<OutPoint> {
        self.txdb.get_locked()
    }

    // --- Queries ---

    pub fn get_balance(&self, account: Option<u32>) -> Result<Balance, WalletError> {
        self.txdb.get_balance(self.db()?.store(), account)
    }

    pub fn get_coins(&self, account: Option<u32>) -> Result<Vec<Coin>, WalletError> {
        self.txdb.get_coins(self.db()?.store(), account)
    }

    pub fn get_credits(&self, account: Option<u32>) -> Result<Vec<Credit>, WalletError> {
        self.txdb.get_credits(self.db()?.store(), account)
    }

    pub fn get_tx(&self, hash: &Hash256) -> Result<Option<TxRecord>, WalletError> {
        self.txdb.get_tx(self.db()?.store(), hash)
    }

    pub fn get_details(&self, hash: &Hash256) -> Result<Option<TxDetails>, WalletError> {
        self.txdb.get_details(self.db()?.store(), hash)
    }

    pub fn get_pending(&self, account: Option<u32>) -> Result<Vec<TxRecord>, WalletError> {
        self.txdb.get_pending(self.db()?.store(), account)
    }

    pub fn get_history(&self, account: Option<u32>) -> Result<Vec<TxRecord>, WalletError> {
        self.txdb.get_history(self.db()?.store(), account)
    }

    /// Transactions first seen between `start` and `end` (unix seconds).
    pub fn get_range(
        &self,
        account: Option<u32>,
        start: u32,
        end: u32,
    ) -> Result<Vec<TxRecord>, WalletError> {
        self.txdb.get_range(self.db()?.store(), account, start, end)
    }

    /// Details of the `limit` most recently seen transactions.
    pub fn get_last(&self, account: Option<u32>, limit: usize) -> Result<Vec<TxDetails>, WalletError> {
        let db = self.db()?;
        let history = self.txdb.get_history(db.store(), account)?;
        history
            .iter()
            .rev()
            .take(limit)
            .map(|wtx| self.txdb.to_details(db.store(), wtx))
            .collect()
    }
}
