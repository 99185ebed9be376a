//! Shared test helpers: an in-memory chain client and transaction builders.

use std::sync::{Arc, Once};

use parking_lot::Mutex;
use tally_core::bloom::{BloomFilter, BloomFlags};
use tally_core::types::{ChainEntry, Hash256, OutPoint, Transaction, TxInput, TxOutput};
use tally_wallet::client::{ChainClient, RescanSink};
use tally_wallet::{MemoryStore, WalletDb, WalletDbConfig, WalletError};

/// Install a tracing subscriber honouring `RUST_LOG`, once per process.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        use tracing_subscriber::filter::EnvFilter;
        use tracing_subscriber::fmt;
        use tracing_subscriber::prelude::*;

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_test_writer())
            .try_init();
    });
}

/// Regtest configuration with a short lookahead.
pub fn test_config() -> WalletDbConfig {
    WalletDbConfig {
        lookahead: 5,
        ..WalletDbConfig::regtest(std::env::temp_dir())
    }
}

/// A fresh memory-backed wallet database.
pub fn memory_db() -> Arc<WalletDb> {
    init_tracing();
    WalletDb::open_with_store(test_config(), Box::new(MemoryStore::new())).unwrap()
}

/// Simple pubkey hash from a seed byte.
pub fn pkh(seed: u8) -> Hash256 {
    Hash256([seed; 32])
}

/// An unsigned transaction spending `inputs`.
pub fn make_tx(inputs: Vec<OutPoint>, outputs: Vec<(u64, Hash256)>) -> Transaction {
    Transaction {
        version: 1,
        inputs: inputs.into_iter().map(TxInput::unsigned).collect(),
        outputs: outputs
            .into_iter()
            .map(|(value, pubkey_hash)| TxOutput { value, pubkey_hash })
            .collect(),
        lock_time: 0,
    }
}

/// A payment from outside the wallet: spends an outpoint no wallet knows.
/// `nonce` keeps txids distinct.
pub fn external_tx(nonce: u32, outputs: Vec<(u64, Hash256)>) -> Transaction {
    make_tx(vec![OutPoint::new(pkh(0xEE), nonce)], outputs)
}

/// Coinbase paying `value` to `to`, unique per height.
pub fn make_coinbase(value: u64, to: Hash256, height: u32) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            signature: height.to_le_bytes().to_vec(),
            ..TxInput::unsigned(OutPoint::null())
        }],
        outputs: vec![TxOutput {
            value,
            pubkey_hash: to,
        }],
        lock_time: height,
    }
}

fn block_hash(height: u32, salt: u8) -> Hash256 {
    let mut hash = [salt; 32];
    hash[..4].copy_from_slice(&height.to_le_bytes());
    hash[4] = 0xC4;
    Hash256(hash)
}

struct ChainInner {
    blocks: Vec<(ChainEntry, Vec<Transaction>)>,
    /// Changes on every reorg so replacement blocks get new hashes.
    salt: u8,
}

/// A chain kept in memory, serving as the wallet database's client.
///
/// Blocks are mined explicitly by tests; nothing is pushed to the wallet
/// unless the test forwards it or the wallet asks for a rescan.
pub struct MemoryChain {
    inner: Mutex<ChainInner>,
    filter: Mutex<Option<BloomFilter>>,
    sent: Mutex<Vec<Transaction>>,
    fee_rate: Mutex<Option<u64>>,
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChain {
    /// A chain holding only an empty genesis block.
    pub fn new() -> Self {
        let genesis = ChainEntry {
            hash: block_hash(0, 0),
            prev_hash: Hash256::ZERO,
            height: 0,
            time: 1_700_000_000,
        };
        Self {
            inner: Mutex::new(ChainInner {
                blocks: vec![(genesis, Vec::new())],
                salt: 0,
            }),
            filter: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            fee_rate: Mutex::new(None),
        }
    }

    pub fn height(&self) -> u32 {
        self.inner.lock().blocks.len() as u32 - 1
    }

    pub fn tip_entry(&self) -> ChainEntry {
        let inner = self.inner.lock();
        inner.blocks[inner.blocks.len() - 1].0
    }

    /// Append a block holding `txs`.
    pub fn mine(&self, txs: Vec<Transaction>) -> (ChainEntry, Vec<Transaction>) {
        let mut inner = self.inner.lock();
        let prev = inner.blocks[inner.blocks.len() - 1].0;
        let height = prev.height + 1;
        let entry = ChainEntry {
            hash: block_hash(height, inner.salt),
            prev_hash: prev.hash,
            height,
            time: prev.time + 600,
        };
        inner.blocks.push((entry, txs.clone()));
        (entry, txs)
    }

    /// Append `n` empty blocks.
    pub fn mine_empty(&self, n: u32) -> Vec<ChainEntry> {
        (0..n).map(|_| self.mine(Vec::new()).0).collect()
    }

    /// Drop every block above `height`, returning them newest first.
    pub fn reorg(&self, height: u32) -> Vec<(ChainEntry, Vec<Transaction>)> {
        let mut inner = self.inner.lock();
        inner.salt = inner.salt.wrapping_add(1);
        let mut removed = inner.blocks.split_off(height as usize + 1);
        removed.reverse();
        removed
    }

    pub fn block(&self, height: u32) -> Option<(ChainEntry, Vec<Transaction>)> {
        self.inner.lock().blocks.get(height as usize).cloned()
    }

    /// Transactions relayed through [`ChainClient::send`].
    pub fn sent(&self) -> Vec<Transaction> {
        self.sent.lock().clone()
    }

    pub fn set_fee_rate(&self, rate: Option<u64>) {
        *self.fee_rate.lock() = rate;
    }

    pub fn has_filter(&self) -> bool {
        self.filter.lock().is_some()
    }

    /// Whether `tx` passes the loaded filter. Matching outputs are added
    /// to the filter so later spends of them match too.
    fn matches(&self, tx: &Transaction) -> bool {
        let mut guard = self.filter.lock();
        let Some(filter) = guard.as_mut() else {
            return true;
        };
        let mut hit = !tx.is_coinbase()
            && tx
                .inputs
                .iter()
                .any(|input| filter.contains(&input.previous_output.to_key()));
        let Ok(txid) = tx.txid() else {
            return hit;
        };
        for (index, output) in tx.outputs.iter().enumerate() {
            if filter.contains(output.pubkey_hash.as_bytes()) {
                hit = true;
                if filter.flags() == BloomFlags::All {
                    filter.insert(&OutPoint::new(txid, index as u32).to_key());
                }
            }
        }
        hit
    }
}

impl ChainClient for MemoryChain {
    fn get_tip(&self) -> Result<ChainEntry, WalletError> {
        Ok(self.tip_entry())
    }

    fn get_entry(&self, height: u32) -> Result<Option<ChainEntry>, WalletError> {
        Ok(self.block(height).map(|(entry, _)| entry))
    }

    fn send(&self, tx: &Transaction) -> Result<(), WalletError> {
        self.sent.lock().push(tx.clone());
        Ok(())
    }

    fn set_filter(&self, filter: &BloomFilter) -> Result<(), WalletError> {
        *self.filter.lock() = Some(filter.clone());
        Ok(())
    }

    fn add_filter(&self, data: &[u8]) -> Result<(), WalletError> {
        if let Some(filter) = self.filter.lock().as_mut() {
            filter.insert(data);
        }
        Ok(())
    }

    fn reset_filter(&self) -> Result<(), WalletError> {
        *self.filter.lock() = None;
        Ok(())
    }

    fn rescan(&self, start: u32, sink: &mut RescanSink<'_>) -> Result<(), WalletError> {
        // snapshot so the sink may call back into the client
        let blocks: Vec<(ChainEntry, Vec<Transaction>)> = {
            let inner = self.inner.lock();
            inner.blocks.iter().skip(start as usize).cloned().collect()
        };
        for (entry, txs) in blocks {
            let matched: Vec<Transaction> = txs.into_iter().filter(|tx| self.matches(tx)).collect();
            sink(&entry, &matched)?;
        }
        Ok(())
    }

    fn estimate_fee(&self, _blocks: u32) -> Result<Option<u64>, WalletError> {
        Ok(*self.fee_rate.lock())
    }
}
