//! Transaction drafts: outputs first, then funding, change and signing.
//!
//! ```ignore
//! let mut draft = TxDraft::new();
//! draft.add_output(&address, 5 * COIN)?;
//! draft.fund(&coins, &options, change_hash)?;
//! draft.sign(|hash| keys.get(hash).cloned())?;
//! let tx = draft.finalize()?;
//! ```

use tally_core::address::Address;
use tally_core::coins::CoinView;
use tally_core::constants::{INPUT_SIZE, OUTPUT_SIZE, TX_OVERHEAD};
use tally_core::crypto::{PrivateKey, sign_transaction_input};
use tally_core::types::{Coin, Hash256, Transaction, TxInput, TxOutput};

use crate::coin_selection::{CoinSelector, Selected, SelectorOptions};
use crate::error::WalletError;

/// A mutable transaction being assembled by a wallet.
#[derive(Debug, Clone)]
pub struct TxDraft {
    tx: Transaction,
    view: CoinView,
    change_index: Option<usize>,
}

impl Default for TxDraft {
    fn default() -> Self {
        Self::new()
    }
}

impl TxDraft {
    pub fn new() -> Self {
        Self {
            tx: Transaction {
                version: 1,
                inputs: Vec::new(),
                outputs: Vec::new(),
                lock_time: 0,
            },
            view: CoinView::new(),
            change_index: None,
        }
    }

    pub fn add_output(&mut self, address: &Address, value: u64) -> Result<&mut Self, WalletError> {
        self.add_output_hash(address.pubkey_hash(), value)
    }

    pub fn add_output_hash(&mut self, hash: Hash256, value: u64) -> Result<&mut Self, WalletError> {
        if value == 0 {
            return Err(WalletError::InvalidAmount("output value is zero".into()));
        }
        self.tx.outputs.push(TxOutput {
            value,
            pubkey_hash: hash,
        });
        Ok(self)
    }

    /// Spend `coin` as the next input.
    pub fn add_coin(&mut self, coin: Coin) -> &mut Self {
        self.tx.inputs.push(TxInput::unsigned(coin.outpoint));
        self.view.add_coin(coin);
        self
    }

    pub fn set_lock_time(&mut self, lock_time: u32) -> &mut Self {
        self.tx.lock_time = lock_time;
        self
    }

    pub fn tx(&self) -> &Transaction {
        &self.tx
    }

    pub fn view(&self) -> &CoinView {
        &self.view
    }

    pub fn change_index(&self) -> Option<usize> {
        self.change_index
    }

    pub fn output_value(&self) -> Result<u64, WalletError> {
        self.tx
            .total_output_value()
            .ok_or_else(|| WalletError::InvalidAmount("output total overflow".into()))
    }

    /// Estimated size of the draft as it stands, with inputs signed.
    pub fn estimate_size(&self) -> usize {
        TX_OVERHEAD + self.tx.inputs.len() * INPUT_SIZE + self.tx.outputs.len() * OUTPUT_SIZE
    }

    /// Select coins for the outputs, then add inputs and change. On error
    /// the draft is left as it was.
    pub fn fund(
        &mut self,
        coins: &[Coin],
        options: &SelectorOptions,
        change: Hash256,
    ) -> Result<Selected, WalletError> {
        if self.tx.outputs.is_empty() {
            return Err(WalletError::InvalidState("draft has no outputs".into()));
        }
        if !self.tx.inputs.is_empty() {
            return Err(WalletError::InvalidState("draft is already funded".into()));
        }

        let selector = CoinSelector::new(options.clone());
        let selected = selector.select(coins, self.output_value()?, self.estimate_size())?;

        let mut outputs = self.tx.outputs.clone();
        if options.subtract_fee {
            subtract_fee(
                &mut outputs,
                selected.fee,
                options.subtract_index,
                selector.dust_threshold(),
            )?;
        }

        self.tx.outputs = outputs;
        for coin in &selected.coins {
            self.add_coin(coin.clone());
        }
        if selected.change > 0 {
            self.tx.outputs.push(TxOutput {
                value: selected.change,
                pubkey_hash: change,
            });
            self.change_index = Some(self.tx.outputs.len() - 1);
        }
        Ok(selected)
    }

    /// Input value minus output value.
    pub fn fee(&self) -> Result<u64, WalletError> {
        Ok(self.view.fee(&self.tx)?)
    }

    /// Sign every input whose coin hash `key_for` can provide a key for.
    /// Returns the number of inputs signed.
    pub fn sign<F>(&mut self, mut key_for: F) -> Result<usize, WalletError>
    where
        F: FnMut(&Hash256) -> Option<PrivateKey>,
    {
        let mut signed = 0;
        for i in 0..self.tx.inputs.len() {
            let outpoint = self.tx.inputs[i].previous_output;
            let Some(coin) = self.view.get(&outpoint) else {
                continue;
            };
            let Some(key) = key_for(&coin.pubkey_hash) else {
                continue;
            };
            if key.public_key().pubkey_hash() != coin.pubkey_hash {
                return Err(WalletError::InvalidState(format!(
                    "key does not match coin {outpoint}"
                )));
            }
            sign_transaction_input(&mut self.tx, i, &key)?;
            signed += 1;
        }
        Ok(signed)
    }

    pub fn is_signed(&self) -> bool {
        !self.tx.inputs.is_empty()
            && self
                .tx
                .inputs
                .iter()
                .all(|i| !i.signature.is_empty() && !i.public_key.is_empty())
    }

    /// The finished transaction. Every input must be signed.
    pub fn finalize(self) -> Result<Transaction, WalletError> {
        if !self.is_signed() {
            return Err(WalletError::InvalidState("draft is not fully signed".into()));
        }
        Ok(self.tx)
    }
}

/// Take `fee` out of output `index`, or spread it over every output.
fn subtract_fee(
    outputs: &mut [TxOutput],
    fee: u64,
    index: Option<usize>,
    dust: u64,
) -> Result<(), WalletError> {
    let charge = |output: &mut TxOutput, amount: u64| -> Result<(), WalletError> {
        match output.value.checked_sub(amount) {
            Some(left) if left >= dust => {
                output.value = left;
                Ok(())
            }
            _ => Err(WalletError::InvalidAmount(format!(
                "output of {} cannot pay fee share {amount}",
                output.value
            ))),
        }
    };

    match index {
        Some(i) => {
            let len = outputs.len();
            let output = outputs.get_mut(i).ok_or_else(|| {
                WalletError::InvalidAmount(format!("subtract index {i} out of range ({len})"))
            })?;
            charge(output, fee)
        }
        None => {
            let n = outputs.len() as u64;
            let share = fee / n;
            let rest = fee % n;
            for (i, output) in outputs.iter_mut().enumerate() {
                let amount = if i == 0 { share + rest } else { share };
                charge(output, amount)?;
            }
            Ok(())
        }
    }
}
