use std::collections::BTreeMap;

use bitcoin::{BlockHash, Network};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A block identified by height and hash.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlockId {
    pub height: u32,
    pub hash: BlockHash,
}

/// Confirmation anchor: the block a transaction was confirmed in, plus that
/// block's timestamp.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ConfirmationBlockTime {
    pub block: BlockId,
    pub confirmation_time: u64,
}

/// Where a transaction sits relative to the local chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainPosition {
    Confirmed { anchor: ConfirmationBlockTime },
    Unconfirmed { last_seen: Option<u64> },
}

impl ChainPosition {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, ChainPosition::Confirmed { .. })
    }

    pub fn confirmation_height(&self) -> Option<u32> {
        match self {
            ChainPosition::Confirmed { anchor } => Some(anchor.block.height),
            ChainPosition::Unconfirmed { .. } => None,
        }
    }
}

/// Incremental chain state: inserted checkpoints (`Some`) and evicted
/// heights (`None`).
pub type ChainChangeSet = BTreeMap<u32, Option<BlockHash>>;

/// The update chain contradicts the stored genesis block.
#[derive(Debug, Error)]
#[error("update chain does not connect: it replaces the genesis checkpoint of {genesis}")]
pub struct CannotConnectError {
    pub genesis: BlockHash,
}

/// Sparse checkpoint view of the best chain, anchored at genesis.
///
/// Only blocks the wallet cares about are stored: the genesis block, anchor
/// blocks of wallet transactions, and chain tips reported by chain sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalChain {
    blocks: BTreeMap<u32, BlockHash>,
}

impl LocalChain {
    /// Start a chain at the network's genesis block.
    pub fn from_genesis(network: Network) -> (Self, ChainChangeSet) {
        let hash = bitcoin::constants::genesis_block(network).block_hash();
        let chain = Self {
            blocks: BTreeMap::from([(0, hash)]),
        };
        let changeset = BTreeMap::from([(0, Some(hash))]);
        (chain, changeset)
    }

    /// Rebuild a chain from persisted changes. Returns `None` when the
    /// changes never established a genesis checkpoint.
    pub fn from_changeset(changeset: &ChainChangeSet) -> Option<Self> {
        let mut blocks = BTreeMap::new();
        for (&height, hash) in changeset {
            match hash {
                Some(hash) => blocks.insert(height, *hash),
                None => blocks.remove(&height),
            };
        }
        if !blocks.contains_key(&0) {
            return None;
        }
        Some(Self { blocks })
    }

    /// The highest checkpoint.
    pub fn tip(&self) -> BlockId {
        let (&height, &hash) = self
            .blocks
            .iter()
            .next_back()
            .expect("chain always contains genesis");
        BlockId { height, hash }
    }

    pub fn get(&self, height: u32) -> Option<BlockId> {
        self.blocks
            .get(&height)
            .map(|&hash| BlockId { height, hash })
    }

    /// Whether `block` is a stored checkpoint of this chain.
    pub fn contains(&self, block: BlockId) -> bool {
        self.blocks.get(&block.height) == Some(&block.hash)
    }

    pub fn blocks(&self) -> &BTreeMap<u32, BlockHash> {
        &self.blocks
    }

    /// Merge checkpoints reported by a chain source.
    ///
    /// A hash mismatch at a stored height means that block was reorged out;
    /// every checkpoint at or above the deepest mismatch is evicted before
    /// the update blocks are installed. Evictions are recorded as `None`
    /// entries in the returned changeset. Replacing genesis is refused.
    pub fn apply_update(&mut self, update: &[BlockId]) -> Result<ChainChangeSet, CannotConnectError> {
        let mut incoming: BTreeMap<u32, BlockHash> = BTreeMap::new();
        for block in update {
            incoming.insert(block.height, block.hash);
        }

        let conflict = incoming
            .iter()
            .find(|&(height, hash)| {
                self.blocks
                    .get(height)
                    .is_some_and(|stored| stored != hash)
            })
            .map(|(&height, _)| height);

        let mut changeset = ChainChangeSet::new();

        if let Some(height) = conflict {
            if height == 0 {
                return Err(CannotConnectError {
                    genesis: self.blocks[&0],
                });
            }
            log::debug!("chain reorg detected at height {height}");
            let evicted: Vec<u32> = self.blocks.range(height..).map(|(&h, _)| h).collect();
            for h in evicted {
                self.blocks.remove(&h);
                changeset.insert(h, None);
            }
        }

        for (height, hash) in incoming {
            if self.blocks.get(&height) != Some(&hash) {
                self.blocks.insert(height, hash);
                changeset.insert(height, Some(hash));
            }
        }

        Ok(changeset)
    }
}
