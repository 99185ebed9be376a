//! Spending: funding, signing, recording and relaying transactions.

use std::sync::Arc;

use tally_core::address::Address;
use tally_core::constants::{Network, MIN_FEE};
use tally_core::types::Hash256;
use tally_tests::helpers::*;
use tally_wallet::coin_selection::Selection;
use tally_wallet::{CreateOptions, FundOptions, Wallet, WalletDb, WalletError};

fn fund_wallet(db: &WalletDb, chain: &MemoryChain, wallet: &Wallet, values: &[u64]) {
    let to = wallet.receive_address(0).unwrap().pubkey_hash();
    let txs = values
        .iter()
        .enumerate()
        .map(|(i, value)| external_tx(i as u32, vec![(*value, to)]))
        .collect();
    let (entry, txs) = chain.mine(txs);
    db.add_block(&entry, &txs).unwrap();
}

fn recipient(seed: u8) -> Address {
    Address::from_pubkey_hash(pkh(seed), Network::Regtest)
}

#[test]
fn single_coin_send_pays_change_back() {
    let db = memory_db();
    let chain = Arc::new(MemoryChain::new());
    db.connect(chain.clone()).unwrap();
    let wallet = db.primary().unwrap();
    fund_wallet(&db, &chain, &wallet, &[100_000]);
    let change_hash = wallet.change_address(0).unwrap().pubkey_hash();

    let options = FundOptions {
        selection: Selection::Age,
        rate: Some(1_000),
        ..FundOptions::default()
    };
    let details = wallet.send(&[(recipient(9), 50_000)], &options, None).unwrap();

    assert_eq!(details.tx.inputs.len(), 1);
    let change: u64 = details
        .tx
        .outputs
        .iter()
        .filter(|o| o.pubkey_hash == change_hash)
        .map(|o| o.value)
        .sum();
    let fee = details.fee.unwrap();
    assert!(fee >= MIN_FEE);
    assert!(fee < 1_000);
    assert_eq!(change, 100_000 - 50_000 - fee);

    let sent = chain.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].txid().unwrap(), details.hash);

    let balance = wallet.get_balance(None).unwrap();
    assert_eq!(balance.confirmed, 100_000);
    assert_eq!(balance.unconfirmed, change);
    assert_eq!(wallet.get_pending(None).unwrap().len(), 1);

    // confirmation settles it
    let (entry, txs) = chain.mine(vec![sent[0].clone()]);
    db.add_block(&entry, &txs).unwrap();
    let balance = wallet.get_balance(None).unwrap();
    assert_eq!((balance.confirmed, balance.unconfirmed), (change, change));
    assert!(wallet.get_pending(None).unwrap().is_empty());
}

#[test]
fn change_of_pending_send_is_spendable() {
    let db = memory_db();
    let chain = Arc::new(MemoryChain::new());
    db.connect(chain.clone()).unwrap();
    let wallet = db.primary().unwrap();
    fund_wallet(&db, &chain, &wallet, &[60_000]);

    let options = FundOptions {
        rate: Some(1_000),
        ..FundOptions::default()
    };
    wallet.send(&[(recipient(1), 20_000)], &options, None).unwrap();
    // only the unconfirmed change of our own send is left
    let second = wallet.send(&[(recipient(2), 10_000)], &options, None).unwrap();
    assert_eq!(wallet.get_pending(None).unwrap().len(), 2);
    assert_eq!(chain.sent().len(), 2);
    assert!(second.inputs.iter().all(|input| input.path.is_some()));

    assert_eq!(db.resend().unwrap(), 2);
    assert_eq!(chain.sent().len(), 4);
}

#[test]
fn insufficient_funds_leave_ledger_untouched() {
    let db = memory_db();
    let chain = MemoryChain::new();
    let wallet = db.primary().unwrap();
    fund_wallet(&db, &chain, &wallet, &[10_000, 15_000]);
    let before = wallet.get_balance(None).unwrap();

    let err = wallet
        .send(&[(recipient(3), 30_000)], &FundOptions::default(), None)
        .unwrap_err();
    assert!(err.is_funding());
    assert!(matches!(err, WalletError::InsufficientFunds { available: 25_000, .. }));
    assert_eq!(wallet.get_balance(None).unwrap(), before);
    assert!(wallet.get_pending(None).unwrap().is_empty());
}

#[test]
fn subtract_fee_spends_everything() {
    let db = memory_db();
    let chain = MemoryChain::new();
    let wallet = db.primary().unwrap();
    fund_wallet(&db, &chain, &wallet, &[30_000, 20_000]);

    let options = FundOptions {
        selection: Selection::All,
        subtract_fee: true,
        rate: Some(2_000),
        ..FundOptions::default()
    };
    let details = wallet.send(&[(recipient(4), 50_000)], &options, None).unwrap();
    assert_eq!(details.tx.inputs.len(), 2);
    assert_eq!(details.tx.outputs.len(), 1);
    let fee = details.fee.unwrap();
    assert_eq!(details.tx.outputs[0].value, 50_000 - fee);
    assert_eq!(wallet.get_balance(None).unwrap().unconfirmed, 0);
}

#[test]
fn encrypted_wallet_needs_passphrase_to_send() {
    let db = memory_db();
    let chain = MemoryChain::new();
    let wallet = db
        .create(CreateOptions {
            id: Some("vault".into()),
            passphrase: Some("correct horse".into()),
            ..CreateOptions::default()
        })
        .unwrap();
    fund_wallet(&db, &chain, &wallet, &[40_000]);
    let outputs = [(recipient(5), 10_000)];
    let options = FundOptions::default();

    assert_eq!(wallet.send(&outputs, &options, None).unwrap_err(), WalletError::Locked);
    assert_eq!(
        wallet.send(&outputs, &options, Some("wrong")).unwrap_err(),
        WalletError::InvalidPassphrase
    );
    assert!(wallet.get_pending(None).unwrap().is_empty());

    let details = wallet.send(&outputs, &options, Some("correct horse")).unwrap();
    assert!(details.tx.inputs.iter().all(|i| i.signature.len() == 64));
    wallet.lock();
    assert!(wallet.is_locked());
}

#[test]
fn accounts_fund_separately() {
    let db = memory_db();
    let chain = MemoryChain::new();
    let wallet = db.primary().unwrap();
    let savings = wallet.create_account("savings", None).unwrap();
    let to_savings: Hash256 = wallet.receive_address(savings.index).unwrap().pubkey_hash();
    let (entry, txs) = chain.mine(vec![external_tx(1, vec![(70_000, to_savings)])]);
    db.add_block(&entry, &txs).unwrap();

    let from_default = FundOptions {
        account: Some(0),
        ..FundOptions::default()
    };
    assert!(wallet
        .send(&[(recipient(6), 1_000)], &from_default, None)
        .unwrap_err()
        .is_funding());

    let from_savings = FundOptions {
        account: Some(savings.index),
        ..FundOptions::default()
    };
    wallet.send(&[(recipient(6), 1_000)], &from_savings, None).unwrap();
    let change = wallet.get_balance(Some(savings.index)).unwrap().unconfirmed;
    assert!(change > 0 && change < 69_000);
    assert_eq!(wallet.get_balance(Some(0)).unwrap().unconfirmed, 0);
}
