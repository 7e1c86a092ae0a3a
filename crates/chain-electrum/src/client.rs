use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::{FeeRate, Transaction, Txid};
use electrum_client::{Client as RawClient, ElectrumApi};

use wallet_core::chain::{BlockId, ConfirmationBlockTime};
use wallet_core::sync::{FullScanRequest, SyncRequest, Update};

use crate::error::ElectrumError;

/// How many scripts to query per batched history request.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Blocking Electrum chain source.
pub struct ElectrumClient {
    inner: RawClient,
}

impl ElectrumClient {
    /// Connect to an Electrum server (`tcp://host:port` or
    /// `ssl://host:port`).
    pub fn new(url: &str) -> Result<Self, ElectrumError> {
        Ok(Self {
            inner: RawClient::new(url)?,
        })
    }

    /// The server's current chain tip.
    pub fn tip(&self) -> Result<BlockId, ElectrumError> {
        let notification = self.inner.block_headers_subscribe()?;
        Ok(BlockId {
            height: notification.height as u32,
            hash: notification.header.block_hash(),
        })
    }

    /// Walk every keychain until `stop_gap` consecutive scripts come back
    /// without history (initial address discovery).
    pub fn full_scan(
        &self,
        request: FullScanRequest,
        stop_gap: usize,
        batch_size: usize,
    ) -> Result<Update, ElectrumError> {
        let mut update = Update::default();
        let mut tx_heights: BTreeMap<Txid, i32> = BTreeMap::new();

        for (keychain, mut spks) in request.spks_by_keychain {
            let mut gap = 0usize;
            let mut last_active = None;

            'keychain: loop {
                let batch: Vec<_> = spks.by_ref().take(batch_size).collect();
                if batch.is_empty() {
                    break;
                }
                let histories = self
                    .inner
                    .batch_script_get_history(batch.iter().map(|(_, spk)| spk.as_script()))?;

                for ((index, _), history) in batch.iter().zip(histories) {
                    if history.is_empty() {
                        gap += 1;
                        if gap >= stop_gap {
                            break 'keychain;
                        }
                        continue;
                    }
                    gap = 0;
                    last_active = Some(*index);
                    for entry in history {
                        tx_heights.insert(entry.tx_hash, entry.height);
                    }
                }
            }

            log::debug!("full scan of {keychain} keychain: last active index {last_active:?}");
            if let Some(index) = last_active {
                update.last_active_indices.insert(keychain, index);
            }
        }

        self.populate_txs(&mut update, tx_heights)?;
        update.chain.push(self.tip()?);
        Ok(update)
    }

    /// Refresh everything named in a [`SyncRequest`].
    pub fn sync(&self, request: SyncRequest) -> Result<Update, ElectrumError> {
        let mut update = Update::default();
        let mut tx_heights: BTreeMap<Txid, i32> = BTreeMap::new();

        for spk in &request.spks {
            for entry in self.inner.script_get_history(spk.as_script())? {
                tx_heights.insert(entry.tx_hash, entry.height);
            }
        }

        // Electrum has no direct status query for a txid; its containing
        // script's history carries the confirmation height.
        let mut watched: Vec<Txid> = request.txids;
        watched.extend(request.outpoints.iter().map(|op| op.txid));
        for txid in watched {
            let tx = match self.inner.transaction_get(&txid) {
                Ok(tx) => tx,
                Err(e) => {
                    // Evicted from the mempool; nothing to report.
                    log::debug!("transaction {txid} not found upstream: {e}");
                    continue;
                }
            };
            if let Some(output) = tx.output.first() {
                for entry in self.inner.script_get_history(&output.script_pubkey)? {
                    tx_heights.insert(entry.tx_hash, entry.height);
                }
            }
        }

        self.populate_txs(&mut update, tx_heights)?;
        update.chain.push(self.tip()?);
        Ok(update)
    }

    /// Submit a transaction to the network.
    pub fn broadcast(&self, tx: &Transaction) -> Result<Txid, ElectrumError> {
        let txid = self.inner.transaction_broadcast(tx)?;
        log::info!("broadcast transaction {txid}");
        Ok(txid)
    }

    /// Fee rate estimated to confirm within `target_blocks`.
    pub fn estimate_fee(&self, target_blocks: usize) -> Result<FeeRate, ElectrumError> {
        let btc_per_kvb = self.inner.estimate_fee(target_blocks)?;
        btc_per_kvb_to_fee_rate(btc_per_kvb).ok_or(ElectrumError::FeeEstimationFailed {
            target: target_blocks,
        })
    }

    /// Fetch full transactions, their confirmation anchors, and the
    /// prevouts needed for fee resolution.
    fn populate_txs(
        &self,
        update: &mut Update,
        tx_heights: BTreeMap<Txid, i32>,
    ) -> Result<(), ElectrumError> {
        let now = unix_now();
        let mut parent_cache: BTreeMap<Txid, Transaction> = BTreeMap::new();

        for (txid, height) in tx_heights {
            let tx = self.inner.transaction_get(&txid)?;

            if !tx.is_coinbase() {
                for txin in &tx.input {
                    let parent_id = txin.previous_output.txid;
                    if !parent_cache.contains_key(&parent_id) {
                        match self.inner.transaction_get(&parent_id) {
                            Ok(parent) => {
                                parent_cache.insert(parent_id, parent);
                            }
                            Err(e) => {
                                log::debug!("prevout source {parent_id} unavailable: {e}");
                                continue;
                            }
                        }
                    }
                    if let Some(txout) = parent_cache
                        .get(&parent_id)
                        .and_then(|p| p.output.get(txin.previous_output.vout as usize))
                    {
                        update.txouts.insert(txin.previous_output, txout.clone());
                    }
                }
            }

            if height > 0 {
                let height = height as u32;
                let header = self
                    .inner
                    .block_header(height as usize)
                    .map_err(|_| ElectrumError::InvalidHeader { height })?;
                let block = BlockId {
                    height,
                    hash: header.block_hash(),
                };
                update.chain.push(block);
                update.anchors.insert((
                    txid,
                    ConfirmationBlockTime {
                        block,
                        confirmation_time: header.time as u64,
                    },
                ));
            } else {
                update.seen_at.insert(txid, now);
            }

            update.txs.push(tx);
        }
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Convert an Electrum `BTC/kvB` estimate into a [`FeeRate`].
///
/// Servers answer `-1` when they have no estimate for the target.
fn btc_per_kvb_to_fee_rate(btc_per_kvb: f64) -> Option<FeeRate> {
    if !btc_per_kvb.is_finite() || btc_per_kvb <= 0.0 {
        return None;
    }
    let sat_per_kvb = (btc_per_kvb * 100_000_000.0).round() as u64;
    Some(FeeRate::from_sat_per_kwu(sat_per_kvb / 4))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_conversion_one_sat_per_vb() {
        // 0.00001 BTC/kvB == 1000 sat/kvB == 1 sat/vb.
        let rate = btc_per_kvb_to_fee_rate(0.00001).unwrap();
        assert_eq!(rate.to_sat_per_vb_ceil(), 1);
    }

    #[test]
    fn fee_conversion_scales() {
        let rate = btc_per_kvb_to_fee_rate(0.0005).unwrap();
        assert_eq!(rate.to_sat_per_vb_ceil(), 50);
    }

    #[test]
    fn fee_conversion_rejects_missing_estimates() {
        assert!(btc_per_kvb_to_fee_rate(-1.0).is_none());
        assert!(btc_per_kvb_to_fee_rate(0.0).is_none());
        assert!(btc_per_kvb_to_fee_rate(f64::NAN).is_none());
    }

    #[test]
    fn default_urls_are_wellformed() {
        for url in [crate::MAINNET_URL, crate::TESTNET_URL, crate::SIGNET_URL] {
            assert!(url.starts_with("ssl://"));
            assert!(url.contains(':'));
        }
    }
}
