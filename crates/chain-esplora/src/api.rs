//! Wire types for the Esplora REST API.

use bitcoin::{BlockHash, Txid};
use serde::Deserialize;

/// Confirmation status attached to transactions and outspends.
#[derive(Debug, Clone, Deserialize)]
pub struct TxStatus {
    pub confirmed: bool,
    pub block_height: Option<u32>,
    pub block_hash: Option<BlockHash>,
    pub block_time: Option<u64>,
}

/// One entry of a script-hash history page. The full transaction body is
/// fetched separately as raw hex.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryTx {
    pub txid: Txid,
    pub status: TxStatus,
}

/// Response of `/tx/:txid/outspend/:vout`.
#[derive(Debug, Clone, Deserialize)]
pub struct OutSpend {
    pub spent: bool,
    pub txid: Option<Txid>,
    pub status: Option<TxStatus>,
}
