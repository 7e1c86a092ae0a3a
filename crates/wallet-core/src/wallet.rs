use std::collections::BTreeMap;

use bitcoin::bip32::Xpriv;
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Address, Amount, Network, OutPoint, Psbt, Script, Transaction, TxOut, Txid};
use thiserror::Error;

use crate::address::{self, AddressError};
use crate::chain::{BlockId, CannotConnectError, ChainPosition, LocalChain};
use crate::changeset::ChangeSet;
use crate::descriptor::{DescriptorError, WalletDescriptor};
use crate::keychain::{KeychainIndex, KeychainKind, DEFAULT_LOOKAHEAD};
use crate::signer::{self, SignOptions, SignerError};
use crate::store::{Store, StoreError};
use crate::sync::{FullScanRequest, SyncRequest, Update};
use crate::tx_builder::TxBuilder;
use crate::tx_graph::{CalculateFeeError, TxGraph, COINBASE_MATURITY};

/// Wallet balance, bucketed by spendability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Balance {
    /// Confirmed, spendable value.
    pub confirmed: Amount,
    /// Coinbase value still maturing.
    pub immature: Amount,
    /// Unconfirmed value on the internal (change) keychain.
    pub trusted_pending: Amount,
    /// Unconfirmed value received from third parties.
    pub untrusted_pending: Amount,
}

impl Balance {
    pub fn total(&self) -> Amount {
        self.confirmed + self.immature + self.trusted_pending + self.untrusted_pending
    }

    /// Value spendable without waiting on third parties.
    pub fn trusted_spendable(&self) -> Amount {
        self.confirmed + self.trusted_pending
    }
}

/// A derived address and where it came from.
#[derive(Debug, Clone)]
pub struct AddressInfo {
    pub index: u32,
    pub address: Address,
    pub keychain: KeychainKind,
}

/// An unspent output owned by the wallet.
#[derive(Debug, Clone)]
pub struct LocalOutput {
    pub outpoint: OutPoint,
    pub txout: TxOut,
    pub keychain: KeychainKind,
    pub derivation_index: u32,
    pub chain_position: ChainPosition,
    pub is_coinbase: bool,
}

impl LocalOutput {
    /// Confirmations at `tip_height`; zero while unconfirmed.
    pub fn confirmations(&self, tip_height: u32) -> u32 {
        match self.chain_position.confirmation_height() {
            Some(height) => (tip_height + 1).saturating_sub(height),
            None => 0,
        }
    }
}

/// Summary of a canonical wallet transaction.
#[derive(Debug, Clone)]
pub struct TxDetails {
    pub txid: Txid,
    /// Value of wallet-owned inputs this transaction spends.
    pub sent: Amount,
    /// Value paid to wallet-owned outputs.
    pub received: Amount,
    /// Absolute fee, when every prevout is known.
    pub fee: Option<Amount>,
    pub position: ChainPosition,
}

/// Errors rebuilding a wallet from persisted state.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("stored state carries no descriptor")]
    MissingDescriptor,

    #[error("stored state carries no network")]
    MissingNetwork,

    #[error("stored state carries no chain genesis")]
    MissingGenesis,

    #[error("supplied {keychain} descriptor does not match the stored one")]
    DescriptorMismatch { keychain: KeychainKind },

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

/// Errors merging a chain-source update.
#[derive(Debug, Error)]
pub enum ApplyUpdateError {
    #[error(transparent)]
    CannotConnect(#[from] CannotConnectError),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

/// A descriptor-based Bitcoin wallet.
///
/// Combines the keychain script index, the transaction graph, and the local
/// checkpoint chain into one engine: address derivation, balance and
/// history queries, transaction building and signing, and incremental
/// persistence through staged [`ChangeSet`]s.
///
/// The wallet is not internally synchronized; callers sharing one across
/// threads wrap it in their own lock.
#[derive(Debug)]
pub struct Wallet {
    pub(crate) secp: Secp256k1<All>,
    pub(crate) network: Network,
    pub(crate) chain: LocalChain,
    pub(crate) graph: TxGraph,
    pub(crate) index: KeychainIndex,
    pub(crate) stage: ChangeSet,
}

impl Wallet {
    /// Create a new wallet from descriptor strings (secret or public form).
    pub fn create(
        descriptor: &str,
        change_descriptor: &str,
        network: Network,
    ) -> Result<Self, DescriptorError> {
        let secp = Secp256k1::new();
        let external = WalletDescriptor::parse(&secp, descriptor)?;
        let internal = WalletDescriptor::parse(&secp, change_descriptor)?;
        Self::init(secp, external, internal, network)
    }

    /// Create a BIP-84 (native segwit) wallet from a master key.
    pub fn create_bip84(xprv: Xpriv, network: Network) -> Result<Self, DescriptorError> {
        let secp = Secp256k1::new();
        let external = WalletDescriptor::bip84(&secp, xprv, KeychainKind::External, network)?;
        let internal = WalletDescriptor::bip84(&secp, xprv, KeychainKind::Internal, network)?;
        Self::init(secp, external, internal, network)
    }

    /// Create a BIP-86 (taproot) wallet from a master key.
    pub fn create_bip86(xprv: Xpriv, network: Network) -> Result<Self, DescriptorError> {
        let secp = Secp256k1::new();
        let external = WalletDescriptor::bip86(&secp, xprv, KeychainKind::External, network)?;
        let internal = WalletDescriptor::bip86(&secp, xprv, KeychainKind::Internal, network)?;
        Self::init(secp, external, internal, network)
    }

    fn init(
        secp: Secp256k1<All>,
        external: WalletDescriptor,
        internal: WalletDescriptor,
        network: Network,
    ) -> Result<Self, DescriptorError> {
        let (chain, chain_changeset) = LocalChain::from_genesis(network);

        let stage = ChangeSet {
            descriptor: Some(external.to_string()),
            change_descriptor: Some(internal.to_string()),
            network: Some(network),
            chain: chain_changeset,
            ..Default::default()
        };

        let mut descriptors = BTreeMap::new();
        descriptors.insert(KeychainKind::External, external);
        descriptors.insert(KeychainKind::Internal, internal);
        let index = KeychainIndex::new(descriptors, DEFAULT_LOOKAHEAD)?;

        Ok(Self {
            secp,
            network,
            chain,
            graph: TxGraph::default(),
            index,
            stage,
        })
    }

    /// Rebuild a watch-only wallet from an aggregated changeset.
    pub fn load(changeset: ChangeSet) -> Result<Self, LoadError> {
        Self::load_inner(changeset, None)
    }

    /// Rebuild a signing wallet: `changeset` supplies the state, the
    /// descriptor strings re-supply the secret keys (which are never
    /// persisted). The public form of each descriptor must match the
    /// stored one.
    pub fn load_with_descriptors(
        changeset: ChangeSet,
        descriptor: &str,
        change_descriptor: &str,
    ) -> Result<Self, LoadError> {
        Self::load_inner(changeset, Some((descriptor, change_descriptor)))
    }

    fn load_inner(
        changeset: ChangeSet,
        descriptors: Option<(&str, &str)>,
    ) -> Result<Self, LoadError> {
        let secp = Secp256k1::new();
        let stored_external = changeset.descriptor.ok_or(LoadError::MissingDescriptor)?;
        let stored_internal = changeset
            .change_descriptor
            .ok_or(LoadError::MissingDescriptor)?;
        let network = changeset.network.ok_or(LoadError::MissingNetwork)?;

        let (external, internal) = match descriptors {
            None => (
                WalletDescriptor::parse(&secp, &stored_external)?,
                WalletDescriptor::parse(&secp, &stored_internal)?,
            ),
            Some((descriptor, change_descriptor)) => {
                let external = WalletDescriptor::parse(&secp, descriptor)?;
                let internal = WalletDescriptor::parse(&secp, change_descriptor)?;
                let stored_ext = WalletDescriptor::parse(&secp, &stored_external)?;
                let stored_int = WalletDescriptor::parse(&secp, &stored_internal)?;
                if external.public() != stored_ext.public() {
                    return Err(LoadError::DescriptorMismatch {
                        keychain: KeychainKind::External,
                    });
                }
                if internal.public() != stored_int.public() {
                    return Err(LoadError::DescriptorMismatch {
                        keychain: KeychainKind::Internal,
                    });
                }
                (external, internal)
            }
        };

        let chain = LocalChain::from_changeset(&changeset.chain).ok_or(LoadError::MissingGenesis)?;

        let mut graph = TxGraph::default();
        graph.apply_changeset(changeset.tx_graph);

        let mut keychains = BTreeMap::new();
        keychains.insert(KeychainKind::External, external);
        keychains.insert(KeychainKind::Internal, internal);
        let mut index = KeychainIndex::new(keychains, DEFAULT_LOOKAHEAD)?;
        index.apply_changeset(&changeset.index)?;

        let mut wallet = Self {
            secp,
            network,
            chain,
            graph,
            index,
            stage: ChangeSet::default(),
        };
        wallet.reindex_graph()?;
        Ok(wallet)
    }

    /// Re-derive used marks from the restored transaction graph.
    fn reindex_graph(&mut self) -> Result<(), DescriptorError> {
        let spks: Vec<bitcoin::ScriptBuf> = self
            .graph
            .full_txs()
            .flat_map(|(_, tx)| tx.output.iter().map(|o| o.script_pubkey.clone()))
            .collect();
        for spk in spks {
            if let Some((keychain, index)) = self.index.index_of_spk(&spk) {
                let reveal = self.index.mark_used(keychain, index)?;
                self.stage.index.merge(reveal);
            }
        }
        Ok(())
    }

    // ─── Accessors ───────────────────────────────────────────────────

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn local_chain(&self) -> &LocalChain {
        &self.chain
    }

    pub fn tx_graph(&self) -> &TxGraph {
        &self.graph
    }

    pub fn latest_checkpoint(&self) -> BlockId {
        self.chain.tip()
    }

    pub fn descriptor(&self, keychain: KeychainKind) -> Option<&WalletDescriptor> {
        self.index.descriptor(keychain)
    }

    /// Whether the wallet can sign (descriptors carried secret keys).
    pub fn can_sign(&self) -> bool {
        self.index
            .keychains()
            .filter_map(|kc| self.index.descriptor(kc))
            .all(|d| d.has_secret_keys())
    }

    // ─── Addresses ───────────────────────────────────────────────────

    /// Reveal the next address of `keychain`.
    pub fn reveal_next_address(
        &mut self,
        keychain: KeychainKind,
    ) -> Result<AddressInfo, DescriptorError> {
        let ((index, _), changeset) = self.index.reveal_next(keychain)?;
        self.stage.index.merge(changeset);
        self.address_info(keychain, index)
    }

    /// Lowest revealed address without on-chain use, revealing a fresh one
    /// when all revealed addresses are used.
    pub fn next_unused_address(
        &mut self,
        keychain: KeychainKind,
    ) -> Result<AddressInfo, DescriptorError> {
        let ((index, _), changeset) = self.index.next_unused(keychain)?;
        self.stage.index.merge(changeset);
        self.address_info(keychain, index)
    }

    /// Derive the address at `index` without revealing it.
    pub fn peek_address(
        &mut self,
        keychain: KeychainKind,
        index: u32,
    ) -> Result<AddressInfo, DescriptorError> {
        self.index.peek(keychain, index)?;
        self.address_info(keychain, index)
    }

    fn address_info(
        &self,
        keychain: KeychainKind,
        index: u32,
    ) -> Result<AddressInfo, DescriptorError> {
        let descriptor = self
            .index
            .descriptor(keychain)
            .expect("wallet keychains always carry a descriptor");
        let address = descriptor.address_at(index, self.network)?;
        Ok(AddressInfo {
            index,
            address,
            keychain,
        })
    }

    /// Validate an address string against this wallet's network.
    pub fn validate_address(&self, s: &str) -> Result<bool, AddressError> {
        address::validate_address(s, self.network)
    }

    pub fn is_mine(&self, spk: &Script) -> bool {
        self.index.index_of_spk(spk).is_some()
    }

    pub fn derivation_of_spk(&self, spk: &Script) -> Option<(KeychainKind, u32)> {
        self.index.index_of_spk(spk)
    }

    // ─── Balance & history ───────────────────────────────────────────

    pub fn list_unspent(&self) -> Vec<LocalOutput> {
        self.graph
            .canonical_unspents(&self.chain)
            .into_iter()
            .filter_map(|(outpoint, txout, chain_position, is_coinbase)| {
                let (keychain, derivation_index) =
                    self.index.index_of_spk(&txout.script_pubkey)?;
                Some(LocalOutput {
                    outpoint,
                    txout: txout.clone(),
                    keychain,
                    derivation_index,
                    chain_position,
                    is_coinbase,
                })
            })
            .collect()
    }

    pub fn balance(&self) -> Balance {
        let tip = self.chain.tip().height;
        let mut balance = Balance::default();
        for utxo in self.list_unspent() {
            let value = utxo.txout.value;
            match utxo.chain_position {
                ChainPosition::Confirmed { .. } => {
                    if utxo.is_coinbase && utxo.confirmations(tip) < COINBASE_MATURITY {
                        balance.immature += value;
                    } else {
                        balance.confirmed += value;
                    }
                }
                ChainPosition::Unconfirmed { .. } => {
                    if utxo.keychain == KeychainKind::Internal {
                        balance.trusted_pending += value;
                    } else {
                        balance.untrusted_pending += value;
                    }
                }
            }
        }
        balance
    }

    /// Wallet-owned input value spent and output value received by `tx`.
    pub fn sent_and_received(&self, tx: &Transaction) -> (Amount, Amount) {
        let mut sent = Amount::ZERO;
        if !tx.is_coinbase() {
            for input in &tx.input {
                if let Some(prevout) = self.graph.get_txout(input.previous_output) {
                    if self.is_mine(&prevout.script_pubkey) {
                        sent += prevout.value;
                    }
                }
            }
        }
        let received = tx
            .output
            .iter()
            .filter(|o| self.is_mine(&o.script_pubkey))
            .map(|o| o.value)
            .sum();
        (sent, received)
    }

    pub fn calculate_fee(&self, tx: &Transaction) -> Result<Amount, CalculateFeeError> {
        self.graph.calculate_fee(tx)
    }

    /// Canonical wallet transactions, confirmed first.
    pub fn transactions(&self) -> Vec<TxDetails> {
        self.graph
            .canonical_txs(&self.chain)
            .into_iter()
            .filter_map(|canonical| {
                let (sent, received) = self.sent_and_received(canonical.tx);
                if sent == Amount::ZERO && received == Amount::ZERO {
                    return None;
                }
                Some(TxDetails {
                    txid: canonical.txid,
                    sent,
                    received,
                    fee: self.graph.calculate_fee(canonical.tx).ok(),
                    position: canonical.position,
                })
            })
            .collect()
    }

    /// A known transaction and its (conflict-unaware) chain position.
    pub fn get_tx(&self, txid: Txid) -> Option<(Transaction, ChainPosition)> {
        let tx = self.graph.get_tx(txid)?.clone();
        let position = self.graph.chain_position(&self.chain, txid)?;
        Some((tx, position))
    }

    // ─── Sync ────────────────────────────────────────────────────────

    /// Request refreshing everything the wallet already watches.
    pub fn start_sync_request(&self) -> SyncRequest {
        let mut spks = Vec::new();
        for keychain in [KeychainKind::External, KeychainKind::Internal] {
            spks.extend(
                self.index
                    .revealed_spks(keychain)
                    .into_iter()
                    .map(|(_, spk)| spk),
            );
        }
        let txids = self
            .graph
            .canonical_txs(&self.chain)
            .into_iter()
            .filter(|c| !c.position.is_confirmed())
            .map(|c| c.txid)
            .collect();
        let outpoints = self.list_unspent().into_iter().map(|u| u.outpoint).collect();
        SyncRequest {
            spks,
            txids,
            outpoints,
        }
    }

    /// Request walking both keychains from index zero (initial discovery).
    pub fn start_full_scan_request(&self) -> FullScanRequest {
        let mut spks_by_keychain = BTreeMap::new();
        for keychain in [KeychainKind::External, KeychainKind::Internal] {
            if let Some(iter) = self.index.unbounded_spk_iter(keychain) {
                spks_by_keychain.insert(keychain, iter);
            }
        }
        FullScanRequest { spks_by_keychain }
    }

    /// Merge a chain-source [`Update`] and stage the resulting changes.
    pub fn apply_update(&mut self, update: Update) -> Result<(), ApplyUpdateError> {
        let mut changeset = ChangeSet::default();

        if !update.chain.is_empty() {
            changeset.chain = self.chain.apply_update(&update.chain)?;
        }

        for (&keychain, &index) in &update.last_active_indices {
            let (_, reveal) = self.index.reveal_to(keychain, index)?;
            changeset.index.merge(reveal);
        }

        for tx in update.txs {
            changeset.tx_graph.merge(self.graph.insert_tx(tx.clone()));
            for output in &tx.output {
                if let Some((keychain, index)) = self.index.index_of_spk(&output.script_pubkey) {
                    let reveal = self.index.mark_used(keychain, index)?;
                    changeset.index.merge(reveal);
                }
            }
        }
        for (outpoint, txout) in update.txouts {
            changeset.tx_graph.merge(self.graph.insert_txout(outpoint, txout));
        }
        for (txid, anchor) in update.anchors {
            changeset.tx_graph.merge(self.graph.insert_anchor(txid, anchor));
        }
        for (txid, seen_at) in update.seen_at {
            changeset.tx_graph.merge(self.graph.insert_seen_at(txid, seen_at));
        }

        log::info!(
            "applied update: tip={} staged_txs={}",
            self.chain.tip().height,
            changeset.tx_graph.txs.len(),
        );
        self.stage.merge(changeset);
        Ok(())
    }

    /// Record a transaction the wallet itself just broadcast.
    pub fn insert_unconfirmed_tx(
        &mut self,
        tx: Transaction,
        seen_at: u64,
    ) -> Result<(), DescriptorError> {
        let txid = tx.compute_txid();
        let mut changeset = ChangeSet::default();
        changeset.tx_graph.merge(self.graph.insert_tx(tx.clone()));
        changeset.tx_graph.merge(self.graph.insert_seen_at(txid, seen_at));
        for output in &tx.output {
            if let Some((keychain, index)) = self.index.index_of_spk(&output.script_pubkey) {
                let reveal = self.index.mark_used(keychain, index)?;
                changeset.index.merge(reveal);
            }
        }
        self.stage.merge(changeset);
        Ok(())
    }

    // ─── Transactions ────────────────────────────────────────────────

    /// Start building a spend.
    pub fn build_tx(&mut self) -> TxBuilder<'_> {
        TxBuilder::new(self)
    }

    /// Sign every wallet-owned PSBT input. Returns whether the PSBT ended
    /// up fully finalized.
    pub fn sign(&self, psbt: &mut Psbt, options: SignOptions) -> Result<bool, SignerError> {
        signer::sign_psbt(self, psbt, options)
    }

    /// Finalize a fully signed PSBT. Returns whether every input is final.
    pub fn finalize_psbt(&self, psbt: &mut Psbt) -> Result<bool, SignerError> {
        signer::finalize_psbt(self, psbt)
    }

    // ─── Persistence ─────────────────────────────────────────────────

    /// Changes accumulated since the last persist.
    pub fn staged(&self) -> &ChangeSet {
        &self.stage
    }

    pub fn take_staged(&mut self) -> ChangeSet {
        std::mem::take(&mut self.stage)
    }

    /// Append staged changes to `store`. Returns whether anything was
    /// written.
    pub fn persist(&mut self, store: &mut Store) -> Result<bool, StoreError> {
        if self.stage.is_empty() {
            return Ok(false);
        }
        store.append(&self.stage)?;
        self.stage = ChangeSet::default();
        Ok(true)
    }
}
