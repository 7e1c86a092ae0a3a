use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::hashes::{sha256, Hash};
use bitcoin::{consensus, BlockHash, FeeRate, Script, Transaction, Txid};
use reqwest::blocking::Client as HttpClient;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use wallet_core::chain::{BlockId, ConfirmationBlockTime};
use wallet_core::sync::{FullScanRequest, SyncRequest, Update};

use crate::api::{HistoryTx, OutSpend, TxStatus};
use crate::error::EsploraError;

/// Confirmed entries per history page; a full page means more may follow.
const PAGE_SIZE: usize = 25;

/// Blocking Esplora chain source.
pub struct EsploraClient {
    http: HttpClient,
    base_url: String,
}

impl EsploraClient {
    /// Point the client at an Esplora base URL (no trailing slash needed).
    pub fn new(base_url: &str) -> Self {
        Self {
            http: HttpClient::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn get_text(&self, path: &str) -> Result<String, EsploraError> {
        let url = format!("{}{path}", self.base_url);
        Ok(self.http.get(&url).send()?.error_for_status()?.text()?)
    }

    fn get_text_opt(&self, path: &str) -> Result<Option<String>, EsploraError> {
        let url = format!("{}{path}", self.base_url);
        let response = self.http.get(&url).send()?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.text()?))
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, EsploraError> {
        let url = format!("{}{path}", self.base_url);
        Ok(self.http.get(&url).send()?.error_for_status()?.json()?)
    }

    fn get_json_opt<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, EsploraError> {
        let url = format!("{}{path}", self.base_url);
        let response = self.http.get(&url).send()?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json()?))
    }

    /// The server's current chain tip.
    pub fn tip(&self) -> Result<BlockId, EsploraError> {
        let height: u32 = self
            .get_text("/blocks/tip/height")?
            .trim()
            .parse()
            .map_err(|e| EsploraError::decode("/blocks/tip/height", e))?;
        let hash: BlockHash = self
            .get_text("/blocks/tip/hash")?
            .trim()
            .parse()
            .map_err(|e| EsploraError::decode("/blocks/tip/hash", e))?;
        Ok(BlockId { height, hash })
    }

    /// Fetch a raw transaction; `None` when the server does not know it.
    pub fn tx(&self, txid: Txid) -> Result<Option<Transaction>, EsploraError> {
        let path = format!("/tx/{txid}/hex");
        let Some(tx_hex) = self.get_text_opt(&path)? else {
            return Ok(None);
        };
        let bytes =
            hex::decode(tx_hex.trim()).map_err(|e| EsploraError::decode(&path, e))?;
        consensus::deserialize(&bytes)
            .map(Some)
            .map_err(|e| EsploraError::decode(&path, e))
    }

    /// Paginated history of one script.
    fn script_history(&self, spk: &Script) -> Result<Vec<HistoryTx>, EsploraError> {
        let script_hash = sha256::Hash::hash(spk.as_bytes());
        let mut page: Vec<HistoryTx> =
            self.get_json(&format!("/scripthash/{script_hash:x}/txs"))?;
        let mut history = Vec::new();

        loop {
            let confirmed = page.iter().filter(|t| t.status.confirmed).count();
            let anchor = page.iter().rev().find(|t| t.status.confirmed).map(|t| t.txid);
            history.extend(page);
            if confirmed < PAGE_SIZE {
                break;
            }
            let Some(anchor) = anchor else { break };
            page = self.get_json(&format!(
                "/scripthash/{script_hash:x}/txs/chain/{anchor}"
            ))?;
            if page.is_empty() {
                break;
            }
        }
        Ok(history)
    }

    /// Walk every keychain until `stop_gap` consecutive scripts come back
    /// without history (initial address discovery).
    pub fn full_scan(
        &self,
        request: FullScanRequest,
        stop_gap: usize,
    ) -> Result<Update, EsploraError> {
        let mut update = Update::default();
        let mut statuses: BTreeMap<Txid, TxStatus> = BTreeMap::new();

        for (keychain, spks) in request.spks_by_keychain {
            let mut gap = 0usize;
            let mut last_active = None;

            for (index, spk) in spks {
                let history = self.script_history(&spk)?;
                if history.is_empty() {
                    gap += 1;
                    if gap >= stop_gap {
                        break;
                    }
                    continue;
                }
                gap = 0;
                last_active = Some(index);
                for entry in history {
                    statuses.insert(entry.txid, entry.status);
                }
            }

            log::debug!("full scan of {keychain} keychain: last active index {last_active:?}");
            if let Some(index) = last_active {
                update.last_active_indices.insert(keychain, index);
            }
        }

        self.populate_txs(&mut update, statuses)?;
        update.chain.push(self.tip()?);
        Ok(update)
    }

    /// Refresh everything named in a [`SyncRequest`].
    pub fn sync(&self, request: SyncRequest) -> Result<Update, EsploraError> {
        let mut update = Update::default();
        let mut statuses: BTreeMap<Txid, TxStatus> = BTreeMap::new();

        for spk in &request.spks {
            for entry in self.script_history(spk)? {
                statuses.insert(entry.txid, entry.status);
            }
        }

        for txid in &request.txids {
            if let Some(status) = self.get_json_opt::<TxStatus>(&format!("/tx/{txid}/status"))? {
                statuses.insert(*txid, status);
            }
        }

        for outpoint in &request.outpoints {
            let path = format!("/tx/{}/outspend/{}", outpoint.txid, outpoint.vout);
            let Some(outspend) = self.get_json_opt::<OutSpend>(&path)? else {
                continue;
            };
            if let (true, Some(spender)) = (outspend.spent, outspend.txid) {
                let status = outspend.status.unwrap_or(TxStatus {
                    confirmed: false,
                    block_height: None,
                    block_hash: None,
                    block_time: None,
                });
                statuses.insert(spender, status);
            }
        }

        self.populate_txs(&mut update, statuses)?;
        update.chain.push(self.tip()?);
        Ok(update)
    }

    /// Submit a transaction to the network.
    pub fn broadcast(&self, tx: &Transaction) -> Result<Txid, EsploraError> {
        let url = format!("{}/tx", self.base_url);
        let body = hex::encode(consensus::serialize(tx));
        let response = self.http.post(&url).body(body).send()?.error_for_status()?;
        let txid = response
            .text()?
            .trim()
            .parse()
            .map_err(|e| EsploraError::decode("/tx", e))?;
        log::info!("broadcast transaction {txid}");
        Ok(txid)
    }

    /// Fee rate estimated to confirm within `target` blocks.
    pub fn estimate_fee(&self, target: u16) -> Result<FeeRate, EsploraError> {
        let raw: BTreeMap<String, f64> = self.get_json("/fee-estimates")?;
        let estimates: BTreeMap<u16, f64> = raw
            .into_iter()
            .filter_map(|(k, v)| k.parse().ok().map(|k: u16| (k, v)))
            .collect();
        pick_fee_estimate(&estimates, target)
            .and_then(sat_per_vb_to_fee_rate)
            .ok_or(EsploraError::FeeEstimationFailed { target })
    }

    /// Fetch full transactions, their anchors, and prevouts for fee
    /// resolution.
    fn populate_txs(
        &self,
        update: &mut Update,
        statuses: BTreeMap<Txid, TxStatus>,
    ) -> Result<(), EsploraError> {
        let now = unix_now();
        let mut parent_cache: BTreeMap<Txid, Transaction> = BTreeMap::new();

        for (txid, status) in statuses {
            let Some(tx) = self.tx(txid)? else {
                log::debug!("transaction {txid} disappeared upstream");
                continue;
            };

            if !tx.is_coinbase() {
                for txin in &tx.input {
                    let parent_id = txin.previous_output.txid;
                    if !parent_cache.contains_key(&parent_id) {
                        if let Some(parent) = self.tx(parent_id)? {
                            parent_cache.insert(parent_id, parent);
                        } else {
                            continue;
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

            match anchor_from_status(&status) {
                Some(anchor) => {
                    update.chain.push(anchor.block);
                    update.anchors.insert((txid, anchor));
                }
                None => {
                    update.seen_at.insert(txid, now);
                }
            }
            update.txs.push(tx);
        }
        Ok(())
    }
}

fn anchor_from_status(status: &TxStatus) -> Option<ConfirmationBlockTime> {
    if !status.confirmed {
        return None;
    }
    Some(ConfirmationBlockTime {
        block: BlockId {
            height: status.block_height?,
            hash: status.block_hash?,
        },
        confirmation_time: status.block_time?,
    })
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Largest known target at or below the requested one, falling back to the
/// next faster estimate.
fn pick_fee_estimate(estimates: &BTreeMap<u16, f64>, target: u16) -> Option<f64> {
    estimates
        .range(..=target)
        .next_back()
        .or_else(|| estimates.range(target..).next())
        .map(|(_, &rate)| rate)
}

fn sat_per_vb_to_fee_rate(sat_per_vb: f64) -> Option<FeeRate> {
    if !sat_per_vb.is_finite() || sat_per_vb <= 0.0 {
        return None;
    }
    Some(FeeRate::from_sat_per_kwu((sat_per_vb * 250.0).round() as u64))
}
