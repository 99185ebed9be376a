//! Contract between the wallet database and the chain backend.

use tally_core::bloom::BloomFilter;
use tally_core::types::{ChainEntry, Transaction};

use crate::error::WalletError;

/// Callback receiving each block replayed by [`ChainClient::rescan`].
/// Returning an error stops the rescan.
pub type RescanSink<'a> = dyn FnMut(&ChainEntry, &[Transaction]) -> Result<(), WalletError> + 'a;

/// Access to the chain a wallet database follows.
///
/// Implemented by the node glue; the wallet never talks to peers itself.
/// Calls may block.
pub trait ChainClient: Send + Sync {
    /// Current main chain tip.
    fn get_tip(&self) -> Result<ChainEntry, WalletError>;

    /// Main chain entry at `height`, if the chain is that long.
    fn get_entry(&self, height: u32) -> Result<Option<ChainEntry>, WalletError>;

    /// Relay a transaction.
    fn send(&self, tx: &Transaction) -> Result<(), WalletError>;

    /// Replace the remote filter.
    fn set_filter(&self, filter: &BloomFilter) -> Result<(), WalletError>;

    /// Add one element to the remote filter.
    fn add_filter(&self, data: &[u8]) -> Result<(), WalletError>;

    /// Drop the remote filter.
    fn reset_filter(&self) -> Result<(), WalletError>;

    /// Feed every main chain block from `start` to the tip into `sink`,
    /// in order, with the transactions matching the current filter.
    fn rescan(&self, start: u32, sink: &mut RescanSink<'_>) -> Result<(), WalletError>;

    /// Fee rate per 1000 bytes for confirmation within `blocks` blocks.
    fn estimate_fee(&self, blocks: u32) -> Result<Option<u64>, WalletError>;
}

/// Notifications from the chain backend.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    BlockConnect(ChainEntry, Vec<Transaction>),
    BlockDisconnect(ChainEntry),
    BlockRescan(ChainEntry, Vec<Transaction>),
    ChainReset(ChainEntry),
    Tx(Transaction),
}

impl ChainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::BlockConnect(..) => "block connect",
            Self::BlockDisconnect(..) => "block disconnect",
            Self::BlockRescan(..) => "block rescan",
            Self::ChainReset(..) => "chain reset",
            Self::Tx(..) => "tx",
        }
    }
}
