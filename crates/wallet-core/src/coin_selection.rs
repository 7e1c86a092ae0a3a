//! Coin selection strategies for transaction building.

use bitcoin::{Amount, FeeRate, OutPoint, Weight};
use rand::seq::SliceRandom;
use thiserror::Error;

/// Weight of a transaction input minus its satisfaction data: the 36-byte
/// outpoint, 4-byte sequence and 1-byte scriptSig length (non-witness, ×4),
/// plus one witness stack-size byte.
pub const TXIN_BASE_WEIGHT: u64 = (36 + 4 + 1) * 4 + 1;

/// UTXO selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// Largest outputs first (fewest inputs, lowest fee).
    LargestFirst,
    /// Smallest outputs first (consolidates the UTXO set).
    SmallestFirst,
    /// Most confirmations first.
    OldestFirst,
    /// Search for a changeless exact match, falling back to accumulation.
    BranchAndBound,
    /// Shuffled selection, for privacy.
    Random,
}

/// A spendable output offered to the selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub outpoint: OutPoint,
    pub value: Amount,
    /// Worst-case witness + scriptSig weight to spend this output.
    pub satisfaction_weight: Weight,
    /// Confirmation height; `None` while unconfirmed.
    pub confirmation_height: Option<u32>,
}

impl Candidate {
    /// Total weight this input adds to a transaction.
    pub fn input_weight(&self) -> Weight {
        Weight::from_wu(TXIN_BASE_WEIGHT) + self.satisfaction_weight
    }
}

/// Result of a successful selection.
#[derive(Debug, Clone)]
pub struct Selection {
    pub selected: Vec<Candidate>,
    /// Sum of the selected output values.
    pub total: Amount,
    /// Fee attributable to the selected inputs at the requested fee rate.
    pub input_fee: Amount,
    /// Whether the selection hit the target exactly (no change needed).
    pub exact_match: bool,
}

/// Coin selection errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("no spendable outputs available")]
    NoUtxosAvailable,

    #[error("insufficient funds: available {available}, required {required}")]
    InsufficientFunds {
        available: Amount,
        required: Amount,
    },
}

/// Chooses which outputs fund a transaction.
pub struct CoinSelector {
    strategy: SelectionStrategy,
    min_confirmations: u32,
    allow_unconfirmed: bool,
    dust_threshold: Amount,
}

impl CoinSelector {
    pub fn new(strategy: SelectionStrategy) -> Self {
        Self {
            strategy,
            min_confirmations: 0,
            allow_unconfirmed: true,
            dust_threshold: Amount::from_sat(546),
        }
    }

    /// Require at least `confirmations` confirmations per input.
    pub fn with_min_confirmations(mut self, confirmations: u32) -> Self {
        self.min_confirmations = confirmations;
        self
    }

    /// Skip unconfirmed outputs entirely.
    pub fn exclude_unconfirmed(mut self) -> Self {
        self.allow_unconfirmed = false;
        self
    }

    /// Overshoot tolerance for the branch-and-bound exact-match window.
    pub fn with_dust_threshold(mut self, threshold: Amount) -> Self {
        self.dust_threshold = threshold;
        self
    }

    /// Select outputs worth at least `target` plus the input-side fee at
    /// `fee_rate`. `target` must already include the output-side fee.
    pub fn select_coins(
        &self,
        candidates: &[Candidate],
        target: Amount,
        fee_rate: FeeRate,
        tip_height: u32,
    ) -> Result<Selection, SelectionError> {
        let mut eligible: Vec<Candidate> = candidates
            .iter()
            .filter(|c| self.is_eligible(c, tip_height))
            .cloned()
            .collect();

        if eligible.is_empty() {
            return Err(SelectionError::NoUtxosAvailable);
        }

        match self.strategy {
            SelectionStrategy::LargestFirst => {
                eligible.sort_by_key(|c| std::cmp::Reverse(c.value));
                self.accumulate(eligible, target, fee_rate)
            }
            SelectionStrategy::SmallestFirst => {
                eligible.sort_by_key(|c| c.value);
                self.accumulate(eligible, target, fee_rate)
            }
            SelectionStrategy::OldestFirst => {
                eligible.sort_by_key(|c| c.confirmation_height.unwrap_or(u32::MAX));
                self.accumulate(eligible, target, fee_rate)
            }
            SelectionStrategy::Random => {
                eligible.shuffle(&mut rand::thread_rng());
                self.accumulate(eligible, target, fee_rate)
            }
            SelectionStrategy::BranchAndBound => {
                let mut sorted = eligible;
                sorted.sort_by_key(|c| std::cmp::Reverse(c.value));
                match self.exact_match(&sorted, target, fee_rate) {
                    Some(selection) => Ok(selection),
                    None => self.accumulate(sorted, target, fee_rate),
                }
            }
        }
    }

    fn is_eligible(&self, candidate: &Candidate, tip_height: u32) -> bool {
        match candidate.confirmation_height {
            Some(height) => {
                let confirmations = (tip_height + 1).saturating_sub(height);
                confirmations >= self.min_confirmations
            }
            None => self.allow_unconfirmed && self.min_confirmations == 0,
        }
    }

    fn accumulate(
        &self,
        candidates: Vec<Candidate>,
        target: Amount,
        fee_rate: FeeRate,
    ) -> Result<Selection, SelectionError> {
        let mut selected = Vec::new();
        let mut total = Amount::ZERO;
        let mut weight = Weight::ZERO;

        for candidate in candidates {
            total += candidate.value;
            weight += candidate.input_weight();
            selected.push(candidate);

            let input_fee = fee_for(fee_rate, weight);
            if let Some(required) = target.checked_add(input_fee) {
                if total >= required {
                    return Ok(Selection {
                        selected,
                        total,
                        input_fee,
                        exact_match: total == required,
                    });
                }
            }
        }

        Err(SelectionError::InsufficientFunds {
            available: total,
            required: target + fee_for(fee_rate, weight),
        })
    }

    /// Depth-first search for a selection whose value lands inside
    /// `[target + fee, target + fee + dust]`, making a change output
    /// unnecessary. Capped by an attempt limit to stay fast in practice.
    fn exact_match(
        &self,
        sorted: &[Candidate],
        target: Amount,
        fee_rate: FeeRate,
    ) -> Option<Selection> {
        let mut tries = 100_000u32;
        let mut picked: Vec<usize> = Vec::new();
        let found = self.search(
            sorted,
            target,
            fee_rate,
            0,
            Amount::ZERO,
            Weight::ZERO,
            &mut picked,
            &mut tries,
        )?;

        let selected: Vec<Candidate> = picked.iter().map(|&i| sorted[i].clone()).collect();
        Some(Selection {
            selected,
            total: found.0,
            input_fee: found.1,
            exact_match: true,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn search(
        &self,
        sorted: &[Candidate],
        target: Amount,
        fee_rate: FeeRate,
        index: usize,
        total: Amount,
        weight: Weight,
        picked: &mut Vec<usize>,
        tries: &mut u32,
    ) -> Option<(Amount, Amount)> {
        if *tries == 0 {
            return None;
        }
        *tries -= 1;

        let input_fee = fee_for(fee_rate, weight);
        let required = target.checked_add(input_fee)?;
        if !picked.is_empty() && total >= required {
            // Inside the changeless window?
            if total <= required + self.dust_threshold {
                return Some((total, input_fee));
            }
            return None;
        }

        for i in index..sorted.len() {
            picked.push(i);
            let result = self.search(
                sorted,
                target,
                fee_rate,
                i + 1,
                total + sorted[i].value,
                weight + sorted[i].input_weight(),
                picked,
                tries,
            );
            if result.is_some() {
                return result;
            }
            picked.pop();
        }
        None
    }
}

fn fee_for(fee_rate: FeeRate, weight: Weight) -> Amount {
    fee_rate.fee_wu(weight).unwrap_or(Amount::MAX)
}
