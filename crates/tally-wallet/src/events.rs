//! Events published by the wallet database after each committed batch.

use serde::Serialize;
use tally_core::address::Address;

use crate::credit::Balance;
use crate::details::TxDetails;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WalletEvent {
    /// A transaction entered the ledger.
    Tx {
        wid: u32,
        id: String,
        details: TxDetails,
    },
    /// A pending transaction was confirmed.
    Confirmed {
        wid: u32,
        id: String,
        details: TxDetails,
    },
    /// A confirmed transaction went back to pending.
    Unconfirmed {
        wid: u32,
        id: String,
        details: TxDetails,
    },
    /// A transaction was evicted by a double spend.
    Conflict {
        wid: u32,
        id: String,
        details: TxDetails,
    },
    /// A transaction was removed from the ledger.
    RemoveTx {
        wid: u32,
        id: String,
        details: TxDetails,
    },
    Balance {
        wid: u32,
        id: String,
        balance: Balance,
    },
    /// New addresses were derived or imported.
    Address {
        wid: u32,
        id: String,
        account: u32,
        addresses: Vec<Address>,
    },
}

impl WalletEvent {
    pub fn wid(&self) -> u32 {
        match self {
            Self::Tx { wid, .. }
            | Self::Confirmed { wid, .. }
            | Self::Unconfirmed { wid, .. }
            | Self::Conflict { wid, .. }
            | Self::RemoveTx { wid, .. }
            | Self::Balance { wid, .. }
            | Self::Address { wid, .. } => *wid,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Tx { .. } => "tx",
            Self::Confirmed { .. } => "confirmed",
            Self::Unconfirmed { .. } => "unconfirmed",
            Self::Conflict { .. } => "conflict",
            Self::RemoveTx { .. } => "remove tx",
            Self::Balance { .. } => "balance",
            Self::Address { .. } => "address",
        }
    }

    pub fn details(&self) -> Option<&TxDetails> {
        match self {
            Self::Tx { details, .. }
            | Self::Confirmed { details, .. }
            | Self::Unconfirmed { details, .. }
            | Self::Conflict { details, .. }
            | Self::RemoveTx { details, .. } => Some(details),
            Self::Balance { .. } | Self::Address { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_event_json() {
        let event = WalletEvent::Balance {
            wid: 2,
            id: "savings".into(),
            balance: Balance {
                unconfirmed: 5,
                ..Balance::default()
            },
        };
        assert_eq!(event.wid(), 2);
        assert_eq!(event.name(), "balance");
        assert!(event.details().is_none());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "balance");
        assert_eq!(json["id"], "savings");
        assert_eq!(json["balance"]["unconfirmed"], 5);
    }
}
