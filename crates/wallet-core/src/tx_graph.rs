use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use bitcoin::{Amount, OutPoint, Transaction, TxOut, Txid};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::{ChainPosition, ConfirmationBlockTime, LocalChain};

/// Coinbase outputs become spendable after this many confirmations.
pub const COINBASE_MATURITY: u32 = 100;

/// Fee calculation errors.
#[derive(Debug, Error)]
pub enum CalculateFeeError {
    #[error("prevouts unknown for inputs: {0:?}")]
    MissingTxOut(Vec<OutPoint>),

    #[error("inputs ({inputs}) are worth less than outputs ({outputs})")]
    NegativeFee { inputs: Amount, outputs: Amount },
}

/// Incremental transaction-graph state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxGraphChangeSet {
    pub txs: Vec<Transaction>,
    pub txouts: BTreeMap<OutPoint, TxOut>,
    pub anchors: BTreeSet<(Txid, ConfirmationBlockTime)>,
    pub last_seen: BTreeMap<Txid, u64>,
}

impl TxGraphChangeSet {
    pub fn merge(&mut self, other: TxGraphChangeSet) {
        let mut known: HashSet<Txid> = self.txs.iter().map(|tx| tx.compute_txid()).collect();
        for tx in other.txs {
            if known.insert(tx.compute_txid()) {
                self.txs.push(tx);
            }
        }
        self.txouts.extend(other.txouts);
        self.anchors.extend(other.anchors);
        for (txid, seen) in other.last_seen {
            let entry = self.last_seen.entry(txid).or_insert(seen);
            *entry = (*entry).max(seen);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
            && self.txouts.is_empty()
            && self.anchors.is_empty()
            && self.last_seen.is_empty()
    }
}

/// A transaction with its resolved position in the canonical history.
#[derive(Debug, Clone, Copy)]
pub struct CanonicalTx<'g> {
    pub txid: Txid,
    pub tx: &'g Transaction,
    pub position: ChainPosition,
}

/// Graph of wallet-relevant transactions.
///
/// Holds full transactions, floating prevouts of foreign inputs,
/// confirmation anchors, mempool last-seen stamps, and which outpoints each
/// transaction spends. Nothing is ever deleted; reorgs and conflicts are
/// resolved at query time against a [`LocalChain`].
#[derive(Debug, Clone, Default)]
pub struct TxGraph {
    txs: BTreeMap<Txid, Transaction>,
    txouts: BTreeMap<OutPoint, TxOut>,
    anchors: BTreeMap<Txid, BTreeSet<ConfirmationBlockTime>>,
    last_seen: BTreeMap<Txid, u64>,
    spends: BTreeMap<OutPoint, BTreeSet<Txid>>,
}

impl TxGraph {
    pub fn insert_tx(&mut self, tx: Transaction) -> TxGraphChangeSet {
        let txid = tx.compute_txid();
        let mut changeset = TxGraphChangeSet::default();
        if self.txs.contains_key(&txid) {
            return changeset;
        }
        if !tx.is_coinbase() {
            for input in &tx.input {
                self.spends
                    .entry(input.previous_output)
                    .or_default()
                    .insert(txid);
            }
        }
        changeset.txs.push(tx.clone());
        self.txs.insert(txid, tx);
        changeset
    }

    /// Record a prevout of a transaction the graph does not hold in full.
    pub fn insert_txout(&mut self, outpoint: OutPoint, txout: TxOut) -> TxGraphChangeSet {
        let mut changeset = TxGraphChangeSet::default();
        if self.txs.contains_key(&outpoint.txid) || self.txouts.contains_key(&outpoint) {
            return changeset;
        }
        self.txouts.insert(outpoint, txout.clone());
        changeset.txouts.insert(outpoint, txout);
        changeset
    }

    pub fn insert_anchor(&mut self, txid: Txid, anchor: ConfirmationBlockTime) -> TxGraphChangeSet {
        let mut changeset = TxGraphChangeSet::default();
        if self.anchors.entry(txid).or_default().insert(anchor) {
            changeset.anchors.insert((txid, anchor));
        }
        changeset
    }

    /// Stamp a transaction as seen in the mempool at `seen_at` (unix time).
    pub fn insert_seen_at(&mut self, txid: Txid, seen_at: u64) -> TxGraphChangeSet {
        let mut changeset = TxGraphChangeSet::default();
        let current = self.last_seen.get(&txid).copied();
        if current.map_or(true, |t| seen_at > t) {
            self.last_seen.insert(txid, seen_at);
            changeset.last_seen.insert(txid, seen_at);
        }
        changeset
    }

    pub fn apply_changeset(&mut self, changeset: TxGraphChangeSet) {
        for tx in changeset.txs {
            self.insert_tx(tx);
        }
        for (outpoint, txout) in changeset.txouts {
            self.insert_txout(outpoint, txout);
        }
        for (txid, anchor) in changeset.anchors {
            self.insert_anchor(txid, anchor);
        }
        for (txid, seen) in changeset.last_seen {
            self.insert_seen_at(txid, seen);
        }
    }

    pub fn get_tx(&self, txid: Txid) -> Option<&Transaction> {
        self.txs.get(&txid)
    }

    /// Every full transaction in the graph, canonical or not.
    pub fn full_txs(&self) -> impl Iterator<Item = (Txid, &Transaction)> {
        self.txs.iter().map(|(&txid, tx)| (txid, tx))
    }

    /// Resolve a prevout from a full transaction or a floating entry.
    pub fn get_txout(&self, outpoint: OutPoint) -> Option<&TxOut> {
        self.txs
            .get(&outpoint.txid)
            .and_then(|tx| tx.output.get(outpoint.vout as usize))
            .or_else(|| self.txouts.get(&outpoint))
    }

    /// The transaction's best in-chain anchor, if any survives reorgs.
    fn best_chain_anchor(&self, chain: &LocalChain, txid: Txid) -> Option<ConfirmationBlockTime> {
        self.anchors
            .get(&txid)?
            .iter()
            .filter(|anchor| chain.contains(anchor.block))
            .max_by_key(|anchor| anchor.block.height)
            .copied()
    }

    /// Raw position of a known transaction against `chain`.
    ///
    /// Unlike [`canonical_txs`](Self::canonical_txs) this does not resolve
    /// conflicts; an unconfirmed double-spend still reports `Unconfirmed`.
    pub fn chain_position(&self, chain: &LocalChain, txid: Txid) -> Option<ChainPosition> {
        if !self.txs.contains_key(&txid) {
            return None;
        }
        Some(match self.best_chain_anchor(chain, txid) {
            Some(anchor) => ChainPosition::Confirmed { anchor },
            None => ChainPosition::Unconfirmed {
                last_seen: self.last_seen.get(&txid).copied(),
            },
        })
    }

    /// The conflict-free transaction history against `chain`.
    ///
    /// Confirmed transactions come first in height order. Unconfirmed
    /// transactions follow in most-recently-seen order, dropping any that
    /// double-spend an outpoint already claimed by a canonical transaction.
    /// A transaction whose anchor was reorged out is demoted to unconfirmed,
    /// not dropped.
    pub fn canonical_txs<'g>(&'g self, chain: &LocalChain) -> Vec<CanonicalTx<'g>> {
        let mut confirmed: Vec<(ConfirmationBlockTime, Txid)> = self
            .txs
            .keys()
            .filter_map(|&txid| self.best_chain_anchor(chain, txid).map(|a| (a, txid)))
            .collect();
        confirmed.sort_by_key(|(anchor, txid)| (anchor.block.height, *txid));

        let mut canonical = Vec::with_capacity(self.txs.len());
        let mut claimed: HashMap<OutPoint, Txid> = HashMap::new();

        for (anchor, txid) in &confirmed {
            let tx = &self.txs[txid];
            if !tx.is_coinbase() {
                for input in &tx.input {
                    claimed.insert(input.previous_output, *txid);
                }
            }
            canonical.push(CanonicalTx {
                txid: *txid,
                tx,
                position: ChainPosition::Confirmed { anchor: *anchor },
            });
        }

        let confirmed_ids: HashSet<Txid> = confirmed.iter().map(|(_, txid)| *txid).collect();
        let mut candidates: Vec<(Option<u64>, Txid)> = self
            .txs
            .iter()
            .filter(|&(txid, tx)| !confirmed_ids.contains(txid) && !tx.is_coinbase())
            .map(|(&txid, _)| (self.last_seen.get(&txid).copied(), txid))
            .collect();
        // Most recently seen first; unseen transactions last; txid breaks ties.
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        for (last_seen, txid) in candidates {
            let tx = &self.txs[&txid];
            let conflicts = tx
                .input
                .iter()
                .any(|input| claimed.contains_key(&input.previous_output));
            if conflicts {
                continue;
            }
            for input in &tx.input {
                claimed.insert(input.previous_output, txid);
            }
            canonical.push(CanonicalTx {
                txid,
                tx,
                position: ChainPosition::Unconfirmed { last_seen },
            });
        }

        canonical
    }

    /// Unspent canonical outputs: `(outpoint, txout, position, is_coinbase)`.
    pub fn canonical_unspents<'g>(
        &'g self,
        chain: &LocalChain,
    ) -> Vec<(OutPoint, &'g TxOut, ChainPosition, bool)> {
        let canonical = self.canonical_txs(chain);
        let spent: HashSet<OutPoint> = canonical
            .iter()
            .filter(|c| !c.tx.is_coinbase())
            .flat_map(|c| c.tx.input.iter().map(|i| i.previous_output))
            .collect();

        let mut unspents = Vec::new();
        for entry in &canonical {
            for (vout, txout) in entry.tx.output.iter().enumerate() {
                let outpoint = OutPoint::new(entry.txid, vout as u32);
                if !spent.contains(&outpoint) {
                    unspents.push((outpoint, txout, entry.position, entry.tx.is_coinbase()));
                }
            }
        }
        unspents
    }

    /// The absolute fee of `tx`, resolved from known prevouts.
    pub fn calculate_fee(&self, tx: &Transaction) -> Result<Amount, CalculateFeeError> {
        if tx.is_coinbase() {
            return Ok(Amount::ZERO);
        }

        let mut inputs = Amount::ZERO;
        let mut missing = Vec::new();
        for input in &tx.input {
            match self.get_txout(input.previous_output) {
                Some(txout) => inputs += txout.value,
                None => missing.push(input.previous_output),
            }
        }
        if !missing.is_empty() {
            return Err(CalculateFeeError::MissingTxOut(missing));
        }

        let outputs: Amount = tx.output.iter().map(|o| o.value).sum();
        inputs
            .checked_sub(outputs)
            .ok_or(CalculateFeeError::NegativeFee { inputs, outputs })
    }
}
