//! # tally-wallet — transactional wallet core with a reorg-safe ledger.
//!
//! Keeps any number of HD wallets in one key-value store, follows a chain
//! client block by block, records every relevant transaction with exact
//! balance accounting, and funds new transactions through a fee-aware coin
//! selector.
//!
//! # Modules
//!
//! - [`walletdb`] — `WalletDb`: wallet registry, routing, chain sync, rescans
//! - [`wallet`] — `Wallet`: accounts, keys, passphrase, funding, signing
//! - [`txdb`] — per-wallet transaction ledger (credits, spends, balances)
//! - [`coin_selection`] — `CoinSelector`: BnB, lowest-larger and accumulation
//! - [`builder`] — `TxDraft` funding and signing
//! - [`account`], [`wallet_key`], [`path`] — key derivation and address paths
//! - [`master_key`], [`encryption`], [`mnemonic`] — sealed master keys
//! - [`store`], [`layout`], [`records`] — storage and on-disk records
//! - [`client`] — `ChainClient` contract and chain events
//! - [`events`] — `WalletEvent` notifications
//! - [`config`] — `WalletDbConfig`
//! - [`error`] — `WalletError` enum

pub mod account;
pub mod builder;
pub mod client;
pub mod coin_selection;
pub mod config;
pub mod credit;
pub mod details;
pub mod encryption;
pub mod error;
pub mod events;
pub mod layout;
pub mod master_key;
pub mod mnemonic;
pub mod path;
pub mod records;
pub mod store;
pub mod txdb;
pub mod wallet;
pub mod wallet_key;
pub mod walletdb;

// Re-exports for convenient access
pub use builder::TxDraft;
pub use client::{ChainClient, ChainEvent, RescanSink};
pub use coin_selection::{CoinSelector, Selected, Selection, SelectorOptions};
pub use config::WalletDbConfig;
pub use credit::{Balance, Credit};
pub use details::{DetailsMember, TxDetails};
pub use error::WalletError;
pub use events::WalletEvent;
pub use path::{Path, PathKind};
pub use records::{BlockMeta, ChainState, TxBlock, TxRecord};
pub use store::{KvStore, MemoryStore, RocksStore};
pub use wallet::{FundOptions, Wallet};
pub use walletdb::{CreateOptions, SyncStatus, WalletDb};
