//! Wallet error types.

use tally_core::error::{AddressError, BloomError, CryptoError, EncodingError, TransactionError};
use thiserror::Error;

/// Errors that can occur in wallet and wallet database operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    /// The spendable coins cannot cover outputs plus fee.
    #[error("insufficient funds: available {available}, required {required}")]
    InsufficientFunds {
        /// Value of all spendable coins considered.
        available: u64,
        /// Outputs plus the fee at the last estimate.
        required: u64,
    },

    /// The computed fee exceeds the caller's maximum.
    #[error("fee too high: {fee} > {max}")]
    FeeTooHigh { fee: u64, max: u64 },

    /// Invalid monetary amount.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Stored record could not be interpreted.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// Operation is not valid in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Wrong passphrase for the master key.
    #[error("invalid passphrase")]
    InvalidPassphrase,

    /// The master key is encrypted and not unlocked.
    #[error("wallet is locked")]
    Locked,

    /// Wrong wallet API token.
    #[error("invalid token")]
    InvalidToken,

    /// Invalid BIP-39 mnemonic phrase.
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    #[error("encryption: {0}")]
    Encryption(String),

    /// Key-value store failure. The enclosing batch was discarded.
    #[error("storage: {0}")]
    Storage(String),

    /// Chain client failure.
    #[error("client: {0}")]
    Client(String),

    #[error("rescan already in progress")]
    RescanInProgress,

    #[error("rescan aborted")]
    RescanAborted,

    /// The wallet database has been closed.
    #[error("wallet database closed")]
    Closed,

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Bloom(#[from] BloomError),
}

impl WalletError {
    /// Funding failures the caller can fix by changing the request.
    pub fn is_funding(&self) -> bool {
        matches!(self, Self::InsufficientFunds { .. } | Self::FeeTooHigh { .. })
    }
}
