//! Ledger scenarios: conflicts, confirmation round trips and reverts.
//!
//! Every test feeds blocks and transactions straight into a memory-backed
//! wallet database and checks balances against a recomputation from the
//! wallet's credits.

use std::sync::Arc;

use tally_core::types::{ChainEntry, Hash256, OutPoint, Transaction};
use tally_tests::helpers::*;
use tally_wallet::{Wallet, WalletDb};

/// Balances must match a recomputation from the credits, and the wallet
/// total must equal the sum over its accounts.
fn assert_consistent(wallet: &Wallet) {
    let total = wallet.get_balance(None).unwrap();
    let credits = wallet.get_credits(None).unwrap();
    assert_eq!(total.coin, credits.len() as u64);
    assert_eq!(
        total.unconfirmed,
        credits.iter().filter(|c| !c.spent).map(|c| c.value()).sum::<u64>()
    );
    assert_eq!(
        total.confirmed,
        credits.iter().filter(|c| c.coin.height.is_some()).map(|c| c.value()).sum::<u64>()
    );
    assert_eq!(total.tx, wallet.get_history(None).unwrap().len() as u64);

    let accounts = wallet.get_accounts().unwrap().len() as u32;
    let (mut tx, mut coin, mut unconfirmed, mut confirmed) = (0, 0, 0, 0);
    for account in 0..accounts {
        let balance = wallet.get_balance(Some(account)).unwrap();
        tx += balance.tx;
        coin += balance.coin;
        unconfirmed += balance.unconfirmed;
        confirmed += balance.confirmed;
    }
    assert_eq!((coin, unconfirmed, confirmed), (total.coin, total.unconfirmed, total.confirmed));
    // a tx touching two accounts is counted once per account
    assert!(tx >= total.tx);
}

fn fill_blocks(db: &WalletDb, chain: &MemoryChain, until: u32) -> Vec<ChainEntry> {
    let mut entries = Vec::new();
    while chain.height() < until {
        let (entry, txs) = chain.mine(Vec::new());
        db.add_block(&entry, &txs).unwrap();
        entries.push(entry);
    }
    entries
}

fn receive(wallet: &Arc<Wallet>) -> Hash256 {
    wallet.receive_address(0).unwrap().pubkey_hash()
}

#[test]
fn later_pending_double_spend_replaces_earlier() {
    let db = memory_db();
    let wallet = db.primary().unwrap();
    let to = receive(&wallet);
    let contested = OutPoint::new(pkh(0x70), 0);

    let t1 = make_tx(vec![contested], vec![(1_000, to)]);
    let t2 = make_tx(vec![contested], vec![(2_000, to), (10, pkh(9))]);
    assert_eq!(db.add_tx(&t1).unwrap(), 1);
    assert_eq!(db.add_tx(&t2).unwrap(), 1);

    assert!(wallet.get_tx(&t1.txid().unwrap()).unwrap().is_none());
    assert!(wallet.get_tx(&t2.txid().unwrap()).unwrap().is_some());
    let balance = wallet.get_balance(None).unwrap();
    assert_eq!(balance.unconfirmed, 2_000);
    assert_eq!(balance.tx, 1);
    assert_consistent(&wallet);
}

#[test]
fn payment_to_two_accounts_counts_once() {
    let db = memory_db();
    let wallet = db.primary().unwrap();
    let savings = wallet.create_account("savings", None).unwrap();
    let to_default = receive(&wallet);
    let to_savings = wallet.receive_address(savings.index).unwrap().pubkey_hash();

    let pay = external_tx(1, vec![(4_000, to_default), (6_000, to_savings)]);
    assert_eq!(db.add_tx(&pay).unwrap(), 1);
    assert_eq!(wallet.get_balance(None).unwrap().tx, 1);
    assert_eq!(wallet.get_balance(Some(0)).unwrap().tx, 1);
    assert_eq!(wallet.get_balance(Some(savings.index)).unwrap().tx, 1);
    assert_consistent(&wallet);

    wallet.abandon(&pay.txid().unwrap()).unwrap();
    assert_eq!(wallet.get_balance(None).unwrap().tx, 0);
    assert_consistent(&wallet);
}

#[test]
fn confirmed_spend_evicts_pending_and_rejects_later() {
    let db = memory_db();
    let chain = MemoryChain::new();
    let wallet = db.primary().unwrap();
    let to = receive(&wallet);

    let (entry, txs) = chain.mine(vec![external_tx(1, vec![(10_000, to)])]);
    db.add_block(&entry, &txs).unwrap();
    let coin = OutPoint::new(txs[0].txid().unwrap(), 0);

    let pending = make_tx(vec![coin], vec![(9_000, pkh(3))]);
    assert_eq!(db.add_tx(&pending).unwrap(), 1);
    assert!(wallet.get_credits(None).unwrap()[0].spent);
    assert_consistent(&wallet);

    let winner = make_tx(vec![coin], vec![(8_000, pkh(4))]);
    let (entry, txs) = chain.mine(vec![winner.clone()]);
    db.add_block(&entry, &txs).unwrap();
    assert!(wallet.get_tx(&pending.txid().unwrap()).unwrap().is_none());
    assert!(wallet.get_tx(&winner.txid().unwrap()).unwrap().is_some());
    assert!(wallet.get_credits(None).unwrap().is_empty());
    assert_eq!(wallet.get_balance(None).unwrap().confirmed, 0);

    let late = make_tx(vec![coin], vec![(7_000, pkh(5))]);
    assert_eq!(db.add_tx(&late).unwrap(), 0);
    assert!(wallet.get_tx(&late.txid().unwrap()).unwrap().is_none());
    assert_consistent(&wallet);
}

#[test]
fn confirm_then_disconnect_round_trips() {
    let db = memory_db();
    let chain = MemoryChain::new();
    let wallet = db.primary().unwrap();
    let to = receive(&wallet);
    fill_blocks(&db, &chain, 2);

    let pay = external_tx(7, vec![(25_000, to)]);
    db.add_tx(&pay).unwrap();
    let hash = pay.txid().unwrap();
    let before_balance = wallet.get_balance(None).unwrap();
    let before_record = wallet.get_tx(&hash).unwrap().unwrap();

    let (entry, txs) = chain.mine(vec![pay]);
    db.add_block(&entry, &txs).unwrap();
    let confirmed = wallet.get_tx(&hash).unwrap().unwrap();
    assert_eq!(confirmed.height(), Some(3));
    assert_eq!(wallet.get_balance(None).unwrap().confirmed, 25_000);
    assert!(wallet.get_pending(None).unwrap().is_empty());

    db.remove_block(&entry).unwrap();
    assert_eq!(wallet.get_balance(None).unwrap(), before_balance);
    assert_eq!(wallet.get_tx(&hash).unwrap().unwrap(), before_record);
    assert_eq!(wallet.get_pending(None).unwrap().len(), 1);
    assert_consistent(&wallet);
}

#[test]
fn rollback_below_confirmation_returns_tx_to_pending() {
    let db = memory_db();
    let chain = MemoryChain::new();
    let wallet = db.primary().unwrap();
    let to = receive(&wallet);

    fill_blocks(&db, &chain, 149);
    let (entry, txs) = chain.mine(vec![external_tx(150, vec![(40_000, to)])]);
    db.add_block(&entry, &txs).unwrap();
    fill_blocks(&db, &chain, 155);

    let before = wallet.get_balance(None).unwrap();
    assert_eq!(before.confirmed, 40_000);
    assert_eq!(before.unconfirmed, 40_000);

    assert_eq!(db.rollback(100).unwrap(), 1);
    assert_eq!(db.height(), 100);
    let after = wallet.get_balance(None).unwrap();
    assert_eq!(after.confirmed, before.confirmed - 40_000);
    assert_eq!(after.unconfirmed, 40_000);
    let pending = wallet.get_pending(None).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].hash, txs[0].txid().unwrap());
    assert!(db.get_block_meta(150).unwrap().is_none());
    assert!(db.get_block_meta(100).unwrap().is_some());
    assert_consistent(&wallet);
}

#[test]
fn chain_of_pending_spends_resolves_on_confirmation() {
    let db = memory_db();
    let chain = MemoryChain::new();
    let wallet = db.primary().unwrap();
    let to = receive(&wallet);
    let change = wallet.change_address(0).unwrap().pubkey_hash();

    let funding = external_tx(1, vec![(50_000, to)]);
    let (entry, txs) = chain.mine(vec![funding.clone()]);
    db.add_block(&entry, &txs).unwrap();

    let first = make_tx(
        vec![OutPoint::new(funding.txid().unwrap(), 0)],
        vec![(20_000, pkh(8)), (29_000, change)],
    );
    let second = make_tx(
        vec![OutPoint::new(first.txid().unwrap(), 1)],
        vec![(28_000, pkh(8))],
    );
    db.add_tx(&first).unwrap();
    db.add_tx(&second).unwrap();
    assert_eq!(wallet.get_pending(None).unwrap().len(), 2);
    assert_eq!(wallet.get_balance(None).unwrap().unconfirmed, 0);
    assert_consistent(&wallet);

    // parent and child confirmed together
    let (entry, txs) = chain.mine(vec![first, second]);
    db.add_block(&entry, &txs).unwrap();
    assert!(wallet.get_pending(None).unwrap().is_empty());
    let balance = wallet.get_balance(None).unwrap();
    assert_eq!((balance.coin, balance.confirmed, balance.unconfirmed), (0, 0, 0));
    assert_eq!(balance.tx, 3);
    assert_consistent(&wallet);

    db.remove_block(&entry).unwrap();
    assert_eq!(wallet.get_pending(None).unwrap().len(), 2);
    assert_eq!(wallet.get_balance(None).unwrap().confirmed, 50_000);
    assert_consistent(&wallet);
}

#[test]
fn abandon_and_zap_remove_pending() {
    let db = memory_db();
    let wallet = db.primary().unwrap();
    let to = receive(&wallet);

    let a = external_tx(1, vec![(1_000, to)]);
    let b = external_tx(2, vec![(2_000, to)]);
    db.add_tx(&a).unwrap();
    db.add_tx(&b).unwrap();

    let removed = wallet.abandon(&a.txid().unwrap()).unwrap();
    assert_eq!(removed.hash, a.txid().unwrap());
    assert_eq!(wallet.get_balance(None).unwrap().unconfirmed, 2_000);

    // age zero removes everything already seen
    let zapped = wallet.zap(None, 0).unwrap();
    assert_eq!(zapped, vec![b.txid().unwrap()]);
    assert_eq!(wallet.get_balance(None).unwrap(), tally_wallet::Balance::new(None));
    assert_consistent(&wallet);
}

#[test]
fn coinbase_is_removed_on_revert() {
    let db = memory_db();
    let chain = MemoryChain::new();
    let wallet = db.primary().unwrap();
    let to = receive(&wallet);

    fill_blocks(&db, &chain, 4);
    let coinbase: Transaction = make_coinbase(5_000_000, to, 5);
    let (entry, txs) = chain.mine(vec![coinbase.clone()]);
    db.add_block(&entry, &txs).unwrap();
    let coins = wallet.get_coins(None).unwrap();
    assert_eq!(coins.len(), 1);
    assert!(coins[0].coinbase);

    db.remove_block(&entry).unwrap();
    assert!(wallet.get_tx(&coinbase.txid().unwrap()).unwrap().is_none());
    assert_eq!(wallet.get_balance(None).unwrap().unconfirmed, 0);
    assert_consistent(&wallet);
}
