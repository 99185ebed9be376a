//! Coin selection.
//!
//! Picks coins to cover an output value plus the fee for the resulting
//! transaction size. The fee depends on how many inputs get selected, so
//! selection runs as a fixed-point loop: take coins until the current fee is
//! covered, re-estimate the size, recompute the fee, repeat until stable.
//!
//! Strategies:
//! - [`Selection::All`]: every spendable coin.
//! - [`Selection::Random`]: shuffled order.
//! - [`Selection::Age`]: oldest confirmations first, unconfirmed last.
//! - [`Selection::Value`]: branch-and-bound search for a changeless input
//!   set with minimal waste, falling back to lowest-larger.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tally_core::constants::{
    COINBASE_MATURITY, INPUT_SIZE, MAX_FEE, MIN_FEE, MIN_RELAY, OUTPUT_SIZE,
};
use tally_core::types::Coin;

use crate::error::WalletError;

/// Iteration bound for the branch-and-bound search.
pub const BNB_MAX_TRIES: usize = 1_000_000;

/// Coin ordering strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Selection {
    All,
    Random,
    #[default]
    Age,
    Value,
}

/// Selection and fee policy for funding a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorOptions {
    pub selection: Selection,
    /// Take the fee out of the outputs instead of adding inputs for it.
    pub subtract_fee: bool,
    /// Output paying the whole fee when subtracting; all outputs share it
    /// when `None`.
    pub subtract_index: Option<usize>,
    /// Current chain height.
    pub height: u32,
    /// Minimum confirmations for a coin to be spent.
    pub depth: Option<u32>,
    /// Fixed fee overriding the rate.
    pub hard_fee: Option<u64>,
    /// Fee rate per 1000 bytes.
    pub rate: u64,
    /// Fee rate per 1000 bytes expected in the long run, for waste scoring.
    pub long_term_rate: u64,
    pub max_fee: Option<u64>,
    /// Charge the rate per started kilobyte.
    pub round: bool,
    pub coinbase_maturity: u32,
}

impl Default for SelectorOptions {
    fn default() -> Self {
        Self {
            selection: Selection::Age,
            subtract_fee: false,
            subtract_index: None,
            height: 0,
            depth: None,
            hard_fee: None,
            rate: MIN_RELAY,
            long_term_rate: MIN_RELAY,
            max_fee: None,
            round: false,
            coinbase_maturity: COINBASE_MATURITY,
        }
    }
}

/// Outcome of a successful selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selected {
    pub coins: Vec<Coin>,
    /// Sum of the selected coin values.
    pub total: u64,
    /// Fee charged for the estimated size. Taken from the outputs when
    /// subtracting.
    pub fee: u64,
    /// Change output value. Zero when no change output should be added;
    /// dust-sized change is left to the fee.
    pub change: u64,
}

/// Pure coin selector over a set of candidate coins.
#[derive(Debug, Clone)]
pub struct CoinSelector {
    options: SelectorOptions,
}

impl CoinSelector {
    pub fn new(options: SelectorOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SelectorOptions {
        &self.options
    }

    /// Fee for `size` bytes at the configured rate, clamped to
    /// `[MIN_FEE, MAX_FEE]`.
    pub fn get_fee(&self, size: usize) -> u64 {
        let size = size as u64;
        let fee = if self.options.round {
            self.options.rate.saturating_mul(size.div_ceil(1000))
        } else {
            self.options.rate.saturating_mul(size) / 1000
        };
        fee.clamp(MIN_FEE, MAX_FEE)
    }

    fn input_fee(&self) -> i64 {
        rate_cost(self.options.rate, INPUT_SIZE)
    }

    fn long_term_input_fee(&self) -> i64 {
        rate_cost(self.options.long_term_rate, INPUT_SIZE)
    }

    /// Value minus the cost of spending the coin.
    pub fn effective_value(&self, coin: &Coin) -> i64 {
        i64::try_from(coin.value).unwrap_or(i64::MAX) - self.input_fee()
    }

    /// Creating a change output now plus spending it later.
    pub fn cost_of_change(&self) -> u64 {
        (rate_cost(self.options.rate, OUTPUT_SIZE) + self.long_term_input_fee()) as u64
    }

    /// Change below this is added to the fee.
    pub fn dust_threshold(&self) -> u64 {
        let rate = self.options.rate.max(MIN_RELAY);
        3 * (INPUT_SIZE + OUTPUT_SIZE) as u64 * rate / 1000
    }

    pub fn is_spendable(&self, coin: &Coin) -> bool {
        if self.effective_value(coin) <= 0 {
            return false;
        }
        let tip = self.options.height;
        if let Some(depth) = self.options.depth.filter(|d| *d > 0) {
            if coin.height.is_none() || coin.depth(tip) < depth {
                return false;
            }
        }
        if coin.coinbase {
            if coin.height.is_none() || coin.depth(tip) < self.options.coinbase_maturity {
                return false;
            }
        }
        true
    }

    /// Waste of spending `selected` towards `target` (an effective value).
    /// `cost_of_change` of zero means no change output is made, so the
    /// excess over the target is wasted instead.
    pub fn get_waste(&self, selected: &[Coin], cost_of_change: u64, target: u64) -> i64 {
        let per_input = self.input_fee() - self.long_term_input_fee();
        let mut waste = 0i64;
        let mut effective = 0i64;
        for coin in selected {
            waste += per_input;
            effective += self.effective_value(coin);
        }
        if cost_of_change > 0 {
            waste + cost_of_change as i64
        } else {
            waste + (effective - target as i64)
        }
    }

    /// Size of a transaction with `inputs` inputs on top of `base_size`.
    fn estimate(&self, base_size: usize, inputs: usize, change: bool) -> usize {
        base_size + inputs * INPUT_SIZE + if change { OUTPUT_SIZE } else { 0 }
    }

    /// Select coins paying `output_value`. `base_size` is the serialized
    /// size of the transaction before any inputs or change are added.
    pub fn select(
        &self,
        coins: &[Coin],
        output_value: u64,
        base_size: usize,
    ) -> Result<Selected, WalletError> {
        let spendable: Vec<Coin> = coins
            .iter()
            .filter(|coin| self.is_spendable(coin))
            .cloned()
            .collect();
        let available = spendable
            .iter()
            .try_fold(0u64, |acc, c| acc.checked_add(c.value))
            .ok_or_else(|| WalletError::InvalidAmount("coin total overflow".into()))?;

        let order = match self.options.selection {
            Selection::All => spendable,
            Selection::Random => {
                let mut coins = spendable;
                coins.shuffle(&mut rand::thread_rng());
                coins
            }
            Selection::Age => {
                let mut coins = spendable;
                coins.sort_by_key(|c| c.height.unwrap_or(u32::MAX));
                coins
            }
            Selection::Value => {
                if self.options.hard_fee.is_none() && !self.options.subtract_fee {
                    if let Some(found) = self.branch_and_bound(&spendable, output_value, base_size)
                    {
                        self.check_max_fee(found.fee)?;
                        return Ok(found);
                    }
                }
                let target = output_value
                    .saturating_add(self.get_fee(self.estimate(base_size, 0, true)));
                self.lowest_larger(spendable, target)
            }
        };

        self.fund(order, output_value, base_size, available)
    }

    fn check_max_fee(&self, fee: u64) -> Result<(), WalletError> {
        match self.options.max_fee {
            Some(max) if fee > max => Err(WalletError::FeeTooHigh { fee, max }),
            _ => Ok(()),
        }
    }

    fn required(&self, output_value: u64, fee: u64) -> u64 {
        if self.options.subtract_fee {
            output_value
        } else {
            output_value.saturating_add(fee)
        }
    }

    /// Fee-estimate loop over an ordered candidate list.
    fn fund(
        &self,
        order: Vec<Coin>,
        output_value: u64,
        base_size: usize,
        available: u64,
    ) -> Result<Selected, WalletError> {
        let take_all = self.options.selection == Selection::All;
        let with_change = !self.options.subtract_fee;
        let mut chosen: Vec<Coin> = Vec::new();
        let mut total = 0u64;
        let mut next = 0usize;
        let mut fee = self.options.hard_fee.unwrap_or(0);

        loop {
            while next < order.len() && (take_all || total < self.required(output_value, fee)) {
                total += order[next].value;
                chosen.push(order[next].clone());
                next += 1;
            }
            if self.options.hard_fee.is_some() {
                break;
            }
            let size = self.estimate(base_size, chosen.len(), with_change);
            fee = self.get_fee(size);
            if total >= self.required(output_value, fee) || next >= order.len() {
                break;
            }
        }

        self.check_max_fee(fee)?;

        let required = self.required(output_value, fee);
        if total < required {
            return Err(WalletError::InsufficientFunds {
                available,
                required,
            });
        }

        let mut change = total - required;
        if change < self.dust_threshold() {
            change = 0;
        }

        Ok(Selected {
            coins: chosen,
            total,
            fee,
            change,
        })
    }

    /// Smallest coin covering `target` on its own goes first; the rest
    /// follow smallest to largest.
    fn lowest_larger(&self, mut coins: Vec<Coin>, target: u64) -> Vec<Coin> {
        coins.sort_by_key(|c| self.effective_value(c));
        let target = i64::try_from(target).unwrap_or(i64::MAX);
        let at = coins.partition_point(|c| self.effective_value(c) < target);
        if at < coins.len() {
            let larger = coins.remove(at);
            coins.insert(0, larger);
        }
        coins
    }

    /// Depth-first search for an input set whose effective value lands in
    /// `[target, target + cost_of_change]`, so no change output is needed.
    fn branch_and_bound(
        &self,
        coins: &[Coin],
        output_value: u64,
        base_size: usize,
    ) -> Option<Selected> {
        let mut pool: Vec<(i64, &Coin)> = coins
            .iter()
            .map(|c| (self.effective_value(c), c))
            .filter(|(eff, _)| *eff > 0)
            .collect();
        pool.sort_by(|a, b| b.0.cmp(&a.0));

        let target = i64::try_from(output_value)
            .ok()?
            .checked_add(rate_cost(self.options.rate, base_size))?;
        let cost_of_change = self.cost_of_change() as i64;
        let fee_delta = self.input_fee() - self.long_term_input_fee();

        let mut available: i64 = pool.iter().map(|(eff, _)| *eff).sum();
        if available < target {
            return None;
        }

        let mut value = 0i64;
        let mut waste = 0i64;
        let mut selection: Vec<bool> = Vec::with_capacity(pool.len());
        let mut best: Option<Vec<bool>> = None;
        let mut best_waste = i64::MAX;
        let mut best_count = usize::MAX;

        for _ in 0..BNB_MAX_TRIES {
            let mut backtrack = false;
            if value + available < target
                || value > target + cost_of_change
                || (waste > best_waste && fee_delta > 0)
            {
                backtrack = true;
            } else if value >= target {
                let total_waste = waste + (value - target);
                let count = selection.iter().filter(|s| **s).count();
                if total_waste < best_waste || (total_waste == best_waste && count < best_count) {
                    best = Some(selection.clone());
                    best_waste = total_waste;
                    best_count = count;
                }
                backtrack = true;
            }

            if backtrack {
                while selection.last() == Some(&false) {
                    selection.pop();
                    available += pool[selection.len()].0;
                }
                let Some(last) = selection.last_mut() else {
                    break;
                };
                *last = false;
                let i = selection.len() - 1;
                value -= pool[i].0;
                waste -= fee_delta;
            } else {
                let i = selection.len();
                let eff = pool[i].0;
                available -= eff;
                // an omitted coin of equal value makes including this one
                // a duplicate branch
                if i > 0 && !selection[i - 1] && eff == pool[i - 1].0 {
                    selection.push(false);
                } else {
                    selection.push(true);
                    value += eff;
                    waste += fee_delta;
                }
            }
        }

        let best = best?;
        let chosen: Vec<Coin> = pool
            .iter()
            .zip(&best)
            .filter(|(_, take)| **take)
            .map(|((_, coin), _)| (*coin).clone())
            .collect();
        let total: u64 = chosen.iter().map(|c| c.value).sum();
        let fee = total.checked_sub(output_value)?;
        if fee < self.get_fee(self.estimate(base_size, chosen.len(), false)) {
            return None;
        }
        Some(Selected {
            coins: chosen,
            total,
            fee,
            change: 0,
        })
    }
}

fn rate_cost(rate: u64, size: usize) -> i64 {
    i64::try_from(rate.saturating_mul(size as u64) / 1000).unwrap_or(i64::MAX)
}
