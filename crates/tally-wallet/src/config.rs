//! Wallet database configuration.
//!
//! Provides [`WalletDbConfig`] with defaults for the data directory, network,
//! address lookahead, key timeout, passphrase KDF cost, and fee policy. The
//! configuration is serde-derivable so an outer layer can load it from a file.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tally_core::constants::{MIN_RELAY, Network};

use crate::encryption::KdfParams;

/// Default number of addresses derived ahead of the current depth.
pub const DEFAULT_LOOKAHEAD: u32 = 10;
/// Upper bound accepted for an account lookahead.
pub const MAX_LOOKAHEAD: u32 = 1_000;
/// Default seconds an unlocked master key stays decrypted.
pub const DEFAULT_KEY_TIMEOUT: i64 = 60;

/// Configuration for a wallet database instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletDbConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// Network the wallets belong to.
    pub network: Network,
    /// Lookahead given to newly created accounts.
    pub lookahead: u32,
    /// Seconds before an unlocked master key is wiped. Negative disables.
    pub key_timeout: i64,
    /// Passphrase KDF parameters used when encrypting a master key.
    pub kdf: KdfParams,
    /// Fee rate per 1000 bytes when the client has no estimate.
    pub fallback_rate: u64,
    /// Long-term fee rate per 1000 bytes used for waste scoring.
    pub long_term_rate: u64,
    /// Expected number of filter elements across all wallets.
    pub filter_items: u32,
    /// Target false positive rate of the chain filter.
    pub filter_rate: f64,
    /// Log level filter string (e.g. "info", "tally_wallet=debug").
    pub log_level: String,
}

impl Default for WalletDbConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tally");

        Self {
            data_dir,
            network: Network::default(),
            lookahead: DEFAULT_LOOKAHEAD,
            key_timeout: DEFAULT_KEY_TIMEOUT,
            kdf: KdfParams::default(),
            fallback_rate: MIN_RELAY * 10,
            long_term_rate: MIN_RELAY,
            filter_items: 10_000,
            filter_rate: 0.001,
            log_level: "info".to_string(),
        }
    }
}

impl WalletDbConfig {
    /// Regtest defaults with a cheap KDF, for tests and local tooling.
    pub fn regtest(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            network: Network::Regtest,
            kdf: KdfParams::light(),
            ..Self::default()
        }
    }

    /// Path to the RocksDB wallet directory.
    pub fn db_path(&self) -> PathBuf {
        let suffix = self.network.data_dir_suffix();
        if suffix.is_empty() {
            self.data_dir.join("wallet")
        } else {
            self.data_dir.join(suffix).join("wallet")
        }
    }

    /// How long an unlock lasts, `None` when expiry is disabled.
    pub fn key_timeout(&self) -> Option<Duration> {
        u64::try_from(self.key_timeout).ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_data_dir_ends_with_tally() {
        let cfg = WalletDbConfig::default();
        assert!(cfg.data_dir.ends_with("tally"), "{:?}", cfg.data_dir);
    }

    #[test]
    fn db_path_mainnet_has_no_suffix() {
        let cfg = WalletDbConfig {
            data_dir: PathBuf::from("/tmp/tally-test"),
            ..WalletDbConfig::default()
        };
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/tally-test/wallet"));
    }

    #[test]
    fn db_path_regtest_suffix() {
        let cfg = WalletDbConfig::regtest(PathBuf::from("/tmp/t"));
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/t/regtest/wallet"));
    }

    #[test]
    fn negative_timeout_disables_expiry() {
        let cfg = WalletDbConfig {
            key_timeout: -1,
            ..WalletDbConfig::default()
        };
        assert_eq!(cfg.key_timeout(), None);
        assert_eq!(
            WalletDbConfig::default().key_timeout(),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: WalletDbConfig =
            serde_json::from_str(r#"{"network":"testnet","lookahead":25}"#).unwrap();
        assert_eq!(cfg.network, Network::Testnet);
        assert_eq!(cfg.lookahead, 25);
        assert_eq!(cfg.key_timeout, DEFAULT_KEY_TIMEOUT);
    }
}
