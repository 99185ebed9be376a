//! Coin selector properties across every strategy.

use proptest::prelude::*;
use std::collections::HashSet;
use tally_core::constants::{MAX_FEE, MIN_FEE};
use tally_core::types::{Coin, Hash256, OutPoint};
use tally_wallet::{CoinSelector, Selection, SelectorOptions, WalletError};

const BASE_SIZE: usize = 16 + 41;

fn coin_set(values: &[u64]) -> Vec<Coin> {
    values
        .iter()
        .enumerate()
        .map(|(i, value)| Coin {
            outpoint: OutPoint::new(Hash256([i as u8 + 1; 32]), i as u32),
            value: *value,
            pubkey_hash: Hash256([0xAA; 32]),
            height: Some(10 + i as u32),
            coinbase: false,
        })
        .collect()
}

fn strategy() -> impl Strategy<Value = Selection> {
    prop_oneof![
        Just(Selection::All),
        Just(Selection::Random),
        Just(Selection::Age),
        Just(Selection::Value),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn selection_covers_outputs_and_fee(
        values in prop::collection::vec(5_000u64..2_000_000, 1..30),
        output in 1_000u64..3_000_000,
        rate in 1_000u64..20_000,
        selection in strategy(),
    ) {
        let coins = coin_set(&values);
        let selector = CoinSelector::new(SelectorOptions {
            selection,
            rate,
            height: 100,
            ..SelectorOptions::default()
        });
        match selector.select(&coins, output, BASE_SIZE) {
            Ok(selected) => {
                prop_assert_eq!(selected.total, selected.coins.iter().map(|c| c.value).sum::<u64>());
                prop_assert!(selected.fee >= MIN_FEE && selected.fee <= MAX_FEE);
                prop_assert!(selected.total >= output + selected.fee);
                if selected.change > 0 {
                    prop_assert_eq!(selected.total - output - selected.fee, selected.change);
                    prop_assert!(selected.change >= selector.dust_threshold());
                }
                let unique: HashSet<_> = selected.coins.iter().map(|c| c.outpoint).collect();
                prop_assert_eq!(unique.len(), selected.coins.len());
                if selection == Selection::All {
                    prop_assert_eq!(selected.coins.len(), coins.len());
                }
            }
            Err(WalletError::InsufficientFunds { available, required }) => {
                prop_assert!(available < required);
                prop_assert!(required > output);
            }
            Err(other) => prop_assert!(false, "unexpected error {other}"),
        }
    }

    #[test]
    fn enough_funds_always_succeed(
        values in prop::collection::vec(50_000u64..500_000, 1..20),
        rate in 1_000u64..5_000,
        selection in strategy(),
    ) {
        let coins = coin_set(&values);
        let selector = CoinSelector::new(SelectorOptions {
            selection,
            rate,
            height: 100,
            ..SelectorOptions::default()
        });
        // every coin pays far more than its own input fee
        let total: u64 = values.iter().sum();
        let output = total / 2;
        prop_assert!(selector.select(&coins, output, BASE_SIZE).is_ok());
    }
}

#[test]
fn hard_fee_is_taken_verbatim() {
    let coins = coin_set(&[40_000, 30_000]);
    let selector = CoinSelector::new(SelectorOptions {
        hard_fee: Some(12_345),
        ..SelectorOptions::default()
    });
    let selected = selector.select(&coins, 50_000, BASE_SIZE).unwrap();
    assert_eq!(selected.fee, 12_345);
    assert_eq!(selected.total, 70_000);
    assert_eq!(selected.change, 70_000 - 50_000 - 12_345);
}

#[test]
fn max_fee_rejects_expensive_selection() {
    let coins = coin_set(&[1_000_000]);
    let selector = CoinSelector::new(SelectorOptions {
        rate: 50_000,
        max_fee: Some(1_000),
        ..SelectorOptions::default()
    });
    let err = selector.select(&coins, 10_000, BASE_SIZE).unwrap_err();
    assert!(matches!(err, WalletError::FeeTooHigh { max: 1_000, .. }));
}
