//! Protocol and policy constants. All monetary values in base units
//! (1 TALLY = 10^8 units).

use serde::{Deserialize, Serialize};

pub const COIN: u64 = 100_000_000;

/// Network selector.
///
/// Controls the store magic, address version byte and data directory suffix.
///
/// # Examples
///
/// ```
/// use tally_core::constants::Network;
/// let net = Network::default();
/// assert_eq!(net, Network::Mainnet);
/// assert_eq!(net.magic_bytes(), *b"TALY");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Production network.
    #[default]
    Mainnet,
    /// Public test network.
    Testnet,
    /// Local regression-test network.
    Regtest,
}

impl Network {
    /// Four-byte network identifier stored alongside persisted wallet data.
    pub fn magic_bytes(&self) -> [u8; 4] {
        match self {
            Self::Mainnet => *b"TALY",
            Self::Testnet => *b"TEST",
            Self::Regtest => *b"REGT",
        }
    }

    /// Leading byte of base58check addresses.
    pub fn address_version(&self) -> u8 {
        match self {
            Self::Mainnet => 0x41,
            Self::Testnet => 0x6f,
            Self::Regtest => 0x7a,
        }
    }

    pub fn from_address_version(version: u8) -> Option<Self> {
        [Self::Mainnet, Self::Testnet, Self::Regtest]
            .into_iter()
            .find(|n| n.address_version() == version)
    }

    pub fn from_magic(magic: [u8; 4]) -> Option<Self> {
        [Self::Mainnet, Self::Testnet, Self::Regtest]
            .into_iter()
            .find(|n| n.magic_bytes() == magic)
    }

    /// Data directory suffix: empty for mainnet.
    pub fn data_dir_suffix(&self) -> &'static str {
        match self {
            Self::Mainnet => "",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        }
    }
}

pub const MAX_TX_SIZE: usize = 100_000;
pub const COINBASE_MATURITY: u32 = 100;

/// Upper bound on the encoded size of one signed input.
pub const INPUT_SIZE: usize = 32 + 5 + 1 + 64 + 1 + 32 + 5;
/// Upper bound on the encoded size of one output.
pub const OUTPUT_SIZE: usize = 9 + 32;
/// Upper bound on version, lock time and the two vector lengths.
pub const TX_OVERHEAD: usize = 5 + 3 + 3 + 5;

/// Minimum relay fee rate, per 1000 bytes.
pub const MIN_RELAY: u64 = 1_000;
/// Lowest fee a computed fee is clamped to.
pub const MIN_FEE: u64 = 100;
/// Highest fee a computed fee is clamped to.
pub const MAX_FEE: u64 = COIN / 10;
