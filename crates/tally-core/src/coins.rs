//! In-memory coin lookup used for signing and fee computation.

use std::collections::HashMap;

use crate::error::TransactionError;
use crate::types::{Coin, OutPoint, Transaction};

/// Outpoint → coin map for the inputs of one or more transactions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CoinView {
    coins: HashMap<OutPoint, Coin>,
}

impl CoinView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_coin(&mut self, coin: Coin) {
        self.coins.insert(coin.outpoint, coin);
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&Coin> {
        self.coins.get(outpoint)
    }

    pub fn has(&self, outpoint: &OutPoint) -> bool {
        self.coins.contains_key(outpoint)
    }

    pub fn remove(&mut self, outpoint: &OutPoint) -> Option<Coin> {
        self.coins.remove(outpoint)
    }

    pub fn len(&self) -> usize {
        self.coins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coins.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Coin> {
        self.coins.values()
    }

    /// Whether every input of `tx` has a coin in this view.
    pub fn has_inputs(&self, tx: &Transaction) -> bool {
        tx.inputs.iter().all(|i| self.has(&i.previous_output))
    }

    /// Sum of the coins spent by `tx`.
    pub fn input_value(&self, tx: &Transaction) -> Result<u64, TransactionError> {
        tx.inputs.iter().enumerate().try_fold(0u64, |acc, (index, input)| {
            let coin = self
                .get(&input.previous_output)
                .ok_or(TransactionError::MissingCoin { index })?;
            acc.checked_add(coin.value)
                .ok_or(TransactionError::ValueOverflow)
        })
    }

    /// Input value minus output value.
    pub fn fee(&self, tx: &Transaction) -> Result<u64, TransactionError> {
        let input = self.input_value(tx)?;
        let output = tx
            .total_output_value()
            .ok_or(TransactionError::ValueOverflow)?;
        input.checked_sub(output).ok_or(TransactionError::ValueOverflow)
    }
}
