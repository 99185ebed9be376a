//! Credits and running balances.

use std::collections::BTreeMap;

use bytes::BufMut;
use serde::{Deserialize, Serialize};
use tally_core::encoding::Reader;
use tally_core::types::{COIN_RAW_SIZE, Coin, OutPoint};

use crate::error::WalletError;

/// A wallet-owned output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credit {
    pub coin: Coin,
    /// Spent by a pending transaction. Coins spent by a confirmed
    /// transaction have no credit at all.
    pub spent: bool,
    /// Created by a transaction that also spent our coins.
    pub own: bool,
}

impl Credit {
    pub fn new(coin: Coin, own: bool) -> Self {
        Self {
            coin,
            spent: false,
            own,
        }
    }

    pub fn outpoint(&self) -> OutPoint {
        self.coin.outpoint
    }

    pub fn value(&self) -> u64 {
        self.coin.value
    }

    pub fn to_raw(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(COIN_RAW_SIZE + 2);
        self.coin.write_raw(&mut out);
        out.put_u8(u8::from(self.spent));
        out.put_u8(u8::from(self.own));
        out
    }

    pub fn from_raw(outpoint: OutPoint, data: &[u8]) -> Result<Self, WalletError> {
        let mut r = Reader::new(data);
        let coin = Coin::read_raw(outpoint, &mut r)?;
        let spent = r.read_bool()?;
        let own = r.read_bool()?;
        r.finish()?;
        Ok(Self { coin, spent, own })
    }
}

/// Running counters for a wallet (`account == None`) or one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Balance {
    pub account: Option<u32>,
    /// Transactions recorded.
    pub tx: u64,
    /// Credit records held.
    pub coin: u64,
    /// Value of credits not spent by any transaction.
    pub unconfirmed: u64,
    /// Value of credits whose coin is confirmed.
    pub confirmed: u64,
}

impl Balance {
    pub const SIZE: usize = 32;

    pub fn new(account: Option<u32>) -> Self {
        Self {
            account,
            ..Self::default()
        }
    }

    /// Apply `delta`; driving any counter negative means the ledger is
    /// inconsistent.
    pub fn apply(&mut self, delta: &Delta) -> Result<(), WalletError> {
        fn step(value: u64, delta: i64, what: &str) -> Result<u64, WalletError> {
            value
                .checked_add_signed(delta)
                .ok_or_else(|| WalletError::Corrupt(format!("{what} balance underflow")))
        }
        self.tx = step(self.tx, delta.tx, "tx")?;
        self.coin = step(self.coin, delta.coin, "coin")?;
        self.unconfirmed = step(self.unconfirmed, delta.unconfirmed, "unconfirmed")?;
        self.confirmed = step(self.confirmed, delta.confirmed, "confirmed")?;
        Ok(())
    }

    pub fn to_raw(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.put_u64_le(self.tx);
        out.put_u64_le(self.coin);
        out.put_u64_le(self.unconfirmed);
        out.put_u64_le(self.confirmed);
        out
    }

    pub fn from_raw(account: Option<u32>, data: &[u8]) -> Result<Self, WalletError> {
        let mut r = Reader::new(data);
        let balance = Self {
            account,
            tx: r.read_u64()?,
            coin: r.read_u64()?,
            unconfirmed: r.read_u64()?,
            confirmed: r.read_u64()?,
        };
        r.finish()?;
        Ok(balance)
    }
}

/// Signed change to one balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Delta {
    pub tx: i64,
    pub coin: i64,
    pub unconfirmed: i64,
    pub confirmed: i64,
}

impl Delta {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// Changes produced by one ledger mutation, for the wallet and each
/// account it touched. Coin and value updates land on both sides, so those
/// wallet figures stay equal to the sum of the accounts. The tx counters do
/// not: a transaction counts once for the wallet and once per account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalanceDelta {
    pub wallet: Delta,
    pub accounts: BTreeMap<u32, Delta>,
}

impl BalanceDelta {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&mut self, account: u32, f: impl Fn(&mut Delta)) {
        f(&mut self.wallet);
        f(self.accounts.entry(account).or_default());
    }

    /// Count a transaction entering or leaving `account`'s history.
    pub fn account_tx(&mut self, account: u32, n: i64) {
        self.accounts.entry(account).or_default().tx += n;
    }

    /// Count a transaction entering or leaving the wallet's history.
    pub fn wallet_tx(&mut self, n: i64) {
        self.wallet.tx += n;
    }

    pub fn coin(&mut self, account: u32, n: i64) {
        self.update(account, |d| d.coin += n);
    }

    pub fn unconfirmed(&mut self, account: u32, value: i64) {
        self.update(account, |d| d.unconfirmed += value);
    }

    pub fn confirmed(&mut self, account: u32, value: i64) {
        self.update(account, |d| d.confirmed += value);
    }

    pub fn is_empty(&self) -> bool {
        self.wallet.is_zero() && self.accounts.values().all(Delta::is_zero)
    }
}

/// Signed form of a coin value.
pub(crate) fn signed(value: u64) -> Result<i64, WalletError> {
    i64::try_from(value).map_err(|_| WalletError::InvalidAmount(format!("{value} out of range")))
}
