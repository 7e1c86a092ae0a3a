//! The seam between the wallet and chain sources.
//!
//! The wallet builds a request describing what to look at; a chain source
//! (Electrum, Esplora) answers with an [`Update`] that the wallet merges via
//! [`Wallet::apply_update`].
//!
//! [`Wallet::apply_update`]: crate::wallet::Wallet::apply_update

use std::collections::{BTreeMap, BTreeSet};

use bitcoin::{OutPoint, ScriptBuf, Transaction, TxOut, Txid};

use crate::chain::{BlockId, ConfirmationBlockTime};
use crate::keychain::{KeychainKind, SpkIterator};

/// Default stop gap for full scans: discovery ends after this many
/// consecutive scripts without history.
pub const DEFAULT_STOP_GAP: usize = 20;

/// Targets for an incremental sync: refresh known scripts, transactions and
/// outpoints without walking the keychains.
pub struct SyncRequest {
    /// Revealed scripts to check for new history.
    pub spks: Vec<ScriptBuf>,
    /// Transactions whose confirmation status may have changed.
    pub txids: Vec<Txid>,
    /// Tracked outputs to watch for spends.
    pub outpoints: Vec<OutPoint>,
}

/// Per-keychain unbounded script streams for initial address discovery.
pub struct FullScanRequest {
    pub spks_by_keychain: BTreeMap<KeychainKind, SpkIterator>,
}

/// Chain data reported by a chain source.
#[derive(Debug, Clone, Default)]
pub struct Update {
    /// Checkpoints to merge into the local chain: the source's tip plus the
    /// anchor blocks referenced below.
    pub chain: Vec<BlockId>,
    /// Full transactions relevant to the wallet.
    pub txs: Vec<Transaction>,
    /// Prevouts of foreign inputs, for fee resolution.
    pub txouts: BTreeMap<OutPoint, TxOut>,
    /// Confirmation anchors for the transactions above.
    pub anchors: BTreeSet<(Txid, ConfirmationBlockTime)>,
    /// Mempool sighting timestamps for unconfirmed transactions.
    pub seen_at: BTreeMap<Txid, u64>,
    /// Highest script index with on-chain activity, per keychain. Only full
    /// scans populate this.
    pub last_active_indices: BTreeMap<KeychainKind, u32>,
}

impl Update {
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
            && self.txs.is_empty()
            && self.txouts.is_empty()
            && self.anchors.is_empty()
            && self.seen_at.is_empty()
            && self.last_active_indices.is_empty()
    }
}
