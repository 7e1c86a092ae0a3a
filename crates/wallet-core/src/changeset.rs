use bitcoin::Network;
use serde::{Deserialize, Serialize};

use crate::chain::ChainChangeSet;
use crate::keychain::IndexChangeSet;
use crate::tx_graph::TxGraphChangeSet;

/// The mergeable union of every piece of incremental wallet state.
///
/// Each wallet mutation stages one of these; persisting appends the staged
/// changeset to the store, and replaying a stored sequence with [`merge`]
/// reconstructs the wallet. Descriptors are recorded in their public form
/// only; secret keys never enter a changeset.
///
/// [`merge`]: ChangeSet::merge
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub descriptor: Option<String>,
    pub change_descriptor: Option<String>,
    pub network: Option<Network>,
    #[serde(default)]
    pub chain: ChainChangeSet,
    #[serde(default)]
    pub tx_graph: TxGraphChangeSet,
    #[serde(default)]
    pub index: IndexChangeSet,
}

impl ChangeSet {
    /// Fold `other` into `self`. Later values win for the scalar fields;
    /// the component changesets merge by their own rules.
    pub fn merge(&mut self, other: ChangeSet) {
        if other.descriptor.is_some() {
            self.descriptor = other.descriptor;
        }
        if other.change_descriptor.is_some() {
            self.change_descriptor = other.change_descriptor;
        }
        if other.network.is_some() {
            self.network = other.network;
        }
        self.chain.extend(other.chain);
        self.tx_graph.merge(other.tx_graph);
        self.index.merge(other.index);
    }

    pub fn is_empty(&self) -> bool {
        self.descriptor.is_none()
            && self.change_descriptor.is_none()
            && self.network.is_none()
            && self.chain.is_empty()
            && self.tx_graph.is_empty()
            && self.index.is_empty()
    }
}
