//! Wallet-annotated transaction details.

use std::collections::BTreeSet;

use serde::Serialize;
use tally_core::address::Address;
use tally_core::constants::Network;
use tally_core::types::{Coin, Hash256, OutPoint, Transaction};

use crate::error::WalletError;
use crate::path::Path;
use crate::records::TxRecord;

/// One input or output as the wallet sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetailsMember {
    /// Zero for inputs spending unknown coins.
    pub value: u64,
    pub address: Option<Address>,
    /// Present when the wallet owns the address.
    pub path: Option<Path>,
}

impl DetailsMember {
    fn unknown() -> Self {
        Self {
            value: 0,
            address: None,
            path: None,
        }
    }
}

/// A transaction plus everything the wallet knows about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxDetails {
    pub wid: u32,
    pub hash: Hash256,
    pub height: Option<u32>,
    pub block: Option<Hash256>,
    pub index: Option<u32>,
    pub time: u32,
    pub mtime: u32,
    pub size: usize,
    /// Known only when every input coin is known.
    pub fee: Option<u64>,
    pub inputs: Vec<DetailsMember>,
    pub outputs: Vec<DetailsMember>,
    #[serde(skip)]
    pub tx: Transaction,
    #[serde(skip)]
    network: Network,
}

impl TxDetails {
    pub fn new(wid: u32, wtx: &TxRecord, network: Network) -> Result<Self, WalletError> {
        let tx = &wtx.tx;
        let inputs = if tx.is_coinbase() {
            Vec::new()
        } else {
            vec![DetailsMember::unknown(); tx.inputs.len()]
        };
        let outputs = tx
            .outputs
            .iter()
            .map(|out| DetailsMember {
                value: out.value,
                address: Some(Address::from_pubkey_hash(out.pubkey_hash, network)),
                path: None,
            })
            .collect();
        Ok(Self {
            wid,
            hash: wtx.hash,
            height: wtx.height(),
            block: wtx.block.map(|b| b.hash),
            index: wtx.block.map(|b| b.index),
            time: wtx.time(),
            mtime: wtx.mtime,
            size: tx.size()?,
            fee: None,
            inputs,
            outputs,
            tx: tx.clone(),
            network,
        })
    }

    /// Record the coin spent by input `i`.
    pub fn set_input(&mut self, i: usize, coin: &Coin, path: Option<Path>) {
        if let Some(member) = self.inputs.get_mut(i) {
            member.value = coin.value;
            member.address = Some(Address::from_pubkey_hash(coin.pubkey_hash, self.network));
            member.path = path;
        }
    }

    pub fn set_output(&mut self, i: usize, path: Path) {
        if let Some(member) = self.outputs.get_mut(i) {
            member.path = Some(path);
        }
    }

    /// Fill in the fee once all inputs are resolved.
    pub(crate) fn finish(&mut self) {
        if self.tx.is_coinbase() {
            self.fee = Some(0);
            return;
        }
        if self.inputs.iter().any(|m| m.address.is_none()) {
            return;
        }
        let input: u64 = self.inputs.iter().map(|m| m.value).sum();
        let output: u64 = self.outputs.iter().map(|m| m.value).sum();
        self.fee = input.checked_sub(output);
    }

    pub fn confirmations(&self, tip: u32) -> u32 {
        match self.height {
            Some(h) if tip >= h => tip - h + 1,
            _ => 0,
        }
    }

    /// Accounts touched through owned inputs or outputs.
    pub fn accounts(&self) -> BTreeSet<u32> {
        self.inputs
            .iter()
            .chain(&self.outputs)
            .filter_map(|m| m.path.as_ref().map(|p| p.account))
            .collect()
    }

    /// Net value received by the wallet.
    pub fn value(&self) -> i128 {
        let received: u64 = self
            .outputs
            .iter()
            .filter(|m| m.path.is_some())
            .map(|m| m.value)
            .sum();
        let sent: u64 = self
            .inputs
            .iter()
            .filter(|m| m.path.is_some())
            .map(|m| m.value)
            .sum();
        i128::from(received) - i128::from(sent)
    }

    /// Outpoints of the outputs the wallet owns.
    pub fn owned_outpoints(&self) -> Vec<OutPoint> {
        self.outputs
            .iter()
            .enumerate()
            .filter(|(_, m)| m.path.is_some())
            .map(|(i, _)| OutPoint::new(self.hash, i as u32))
            .collect()
    }

    pub fn to_json(&self, tip: u32) -> Result<serde_json::Value, WalletError> {
        let mut value =
            serde_json::to_value(self).map_err(|e| WalletError::Corrupt(e.to_string()))?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("confirmations".into(), self.confirmations(tip).into());
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::RECEIVE;
    use crate::records::BlockMeta;
    use tally_core::types::{TxInput, TxOutput};

    fn record() -> TxRecord {
        let tx = Transaction {
            version: 1,
            inputs: vec![TxInput::unsigned(OutPoint::new(Hash256([1; 32]), 0))],
            outputs: vec![
                TxOutput {
                    value: 600,
                    pubkey_hash: Hash256([2; 32]),
                },
                TxOutput {
                    value: 300,
                    pubkey_hash: Hash256([3; 32]),
                },
            ],
            lock_time: 0,
        };
        TxRecord::new(tx, 100).unwrap()
    }

    #[test]
    fn fee_needs_every_input() {
        let wtx = record();
        let mut details = TxDetails::new(1, &wtx, Network::Regtest).unwrap();
        details.finish();
        assert_eq!(details.fee, None);

        let coin = Coin {
            outpoint: OutPoint::new(Hash256([1; 32]), 0),
            value: 1_000,
            pubkey_hash: Hash256([9; 32]),
            height: Some(1),
            coinbase: false,
        };
        let path = Path::hd(0, coin.pubkey_hash, RECEIVE, 0);
        details.set_input(0, &coin, Some(path));
        details.set_output(1, Path::hd(2, Hash256([3; 32]), RECEIVE, 1));
        details.finish();
        assert_eq!(details.fee, Some(100));
        assert_eq!(details.value(), 300 - 1_000);
        assert_eq!(details.accounts().into_iter().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(details.owned_outpoints(), vec![OutPoint::new(wtx.hash, 1)]);
    }

    #[test]
    fn json_carries_confirmations() {
        let mut wtx = record();
        wtx.set_block(&BlockMeta::new(Hash256([4; 32]), 10, 50), 0);
        let details = TxDetails::new(1, &wtx, Network::Regtest).unwrap();
        let json = details.to_json(12).unwrap();
        assert_eq!(json["confirmations"], 3);
        assert_eq!(json["height"], 10);
        assert_eq!(json["time"], 50);
    }
}
