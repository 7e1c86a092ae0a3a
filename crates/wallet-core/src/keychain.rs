use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use bitcoin::{Script, ScriptBuf};
use serde::{Deserialize, Serialize};

use crate::descriptor::{DescriptorError, WalletDescriptor};

/// How many scripts to derive past the revealed frontier.
///
/// Lookahead scripts let sync recognize on-chain activity on indices the
/// wallet has not handed out yet (e.g. another device revealed them).
pub const DEFAULT_LOOKAHEAD: u32 = 25;

/// The derivation branch a script belongs to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum KeychainKind {
    /// Receive addresses, handed out to payers.
    External,
    /// Change addresses, spent back to ourselves.
    Internal,
}

impl KeychainKind {
    /// The BIP-44 `change` path component for this keychain.
    pub fn as_u32(self) -> u32 {
        match self {
            KeychainKind::External => 0,
            KeychainKind::Internal => 1,
        }
    }
}

impl fmt::Display for KeychainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeychainKind::External => write!(f, "external"),
            KeychainKind::Internal => write!(f, "internal"),
        }
    }
}

/// Incremental keychain state: the highest revealed index per keychain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexChangeSet {
    pub last_revealed: BTreeMap<KeychainKind, u32>,
}

impl IndexChangeSet {
    /// Merge `other` into `self`; reveal frontiers only move forward.
    pub fn merge(&mut self, other: IndexChangeSet) {
        for (keychain, index) in other.last_revealed {
            let entry = self.last_revealed.entry(keychain).or_insert(index);
            *entry = (*entry).max(index);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.last_revealed.is_empty()
    }
}

/// Unbounded script stream for one keychain, used by full scans.
pub struct SpkIterator {
    descriptor: WalletDescriptor,
    next: u32,
}

impl SpkIterator {
    pub(crate) fn new(descriptor: WalletDescriptor) -> Self {
        Self {
            descriptor,
            next: 0,
        }
    }
}

impl Iterator for SpkIterator {
    type Item = (u32, ScriptBuf);

    fn next(&mut self) -> Option<Self::Item> {
        // Non-hardened derivation indices end at 2^31.
        if self.next >= (1 << 31) {
            return None;
        }
        let index = self.next;
        let spk = self.descriptor.spk_at(index).ok()?;
        self.next += 1;
        Some((index, spk))
    }
}

/// Script-pubkey index over both keychains.
///
/// Tracks which indices have been revealed and used, keeps a lookahead
/// window of pre-derived scripts, and maps scripts back to their
/// `(keychain, index)` origin.
#[derive(Debug, Clone)]
pub struct KeychainIndex {
    descriptors: BTreeMap<KeychainKind, WalletDescriptor>,
    lookahead: u32,
    next_index: BTreeMap<KeychainKind, u32>,
    spks: BTreeMap<(KeychainKind, u32), ScriptBuf>,
    spk_lookup: BTreeMap<ScriptBuf, (KeychainKind, u32)>,
    used: BTreeSet<(KeychainKind, u32)>,
}

impl KeychainIndex {
    pub fn new(
        descriptors: BTreeMap<KeychainKind, WalletDescriptor>,
        lookahead: u32,
    ) -> Result<Self, DescriptorError> {
        let mut index = Self {
            descriptors,
            lookahead,
            next_index: BTreeMap::new(),
            spks: BTreeMap::new(),
            spk_lookup: BTreeMap::new(),
            used: BTreeSet::new(),
        };
        let keychains: Vec<KeychainKind> = index.descriptors.keys().copied().collect();
        for keychain in keychains {
            index.next_index.insert(keychain, 0);
            index.cache_to(keychain, lookahead)?;
        }
        Ok(index)
    }

    pub fn descriptor(&self, keychain: KeychainKind) -> Option<&WalletDescriptor> {
        self.descriptors.get(&keychain)
    }

    pub fn keychains(&self) -> impl Iterator<Item = KeychainKind> + '_ {
        self.descriptors.keys().copied()
    }

    /// Derive and cache scripts for indices below `upto`.
    fn cache_to(&mut self, keychain: KeychainKind, upto: u32) -> Result<(), DescriptorError> {
        let descriptor = match self.descriptors.get(&keychain) {
            Some(d) => d.clone(),
            None => return Ok(()),
        };
        let start = self
            .spks
            .range((keychain, 0)..=(keychain, u32::MAX))
            .next_back()
            .map(|((_, i), _)| i + 1)
            .unwrap_or(0);
        for index in start..upto {
            let spk = descriptor.spk_at(index)?;
            self.spks.insert((keychain, index), spk.clone());
            self.spk_lookup.insert(spk, (keychain, index));
        }
        Ok(())
    }

    /// Next unrevealed index for `keychain`.
    pub fn next_index(&self, keychain: KeychainKind) -> u32 {
        self.next_index.get(&keychain).copied().unwrap_or(0)
    }

    /// Highest revealed index, if any index has been revealed.
    pub fn last_revealed(&self, keychain: KeychainKind) -> Option<u32> {
        self.next_index(keychain).checked_sub(1)
    }

    /// Reveal the next script of `keychain`.
    pub fn reveal_next(
        &mut self,
        keychain: KeychainKind,
    ) -> Result<((u32, ScriptBuf), IndexChangeSet), DescriptorError> {
        let index = self.next_index(keychain);
        let (spks, changeset) = self.reveal_to(keychain, index)?;
        let (_, spk) = spks
            .into_iter()
            .next_back()
            .expect("reveal_to past the frontier yields at least one script");
        Ok(((index, spk), changeset))
    }

    /// Reveal every script up to and including `index`.
    ///
    /// Returns the newly revealed scripts; already-revealed targets yield an
    /// empty changeset.
    pub fn reveal_to(
        &mut self,
        keychain: KeychainKind,
        index: u32,
    ) -> Result<(Vec<(u32, ScriptBuf)>, IndexChangeSet), DescriptorError> {
        let next = self.next_index(keychain);
        if index < next {
            return Ok((Vec::new(), IndexChangeSet::default()));
        }

        self.cache_to(keychain, index + 1 + self.lookahead)?;
        let revealed: Vec<(u32, ScriptBuf)> = (next..=index)
            .map(|i| (i, self.spks[&(keychain, i)].clone()))
            .collect();
        self.next_index.insert(keychain, index + 1);

        let mut changeset = IndexChangeSet::default();
        changeset.last_revealed.insert(keychain, index);
        Ok((revealed, changeset))
    }

    /// Derive the script at `index` without revealing it.
    pub fn peek(
        &mut self,
        keychain: KeychainKind,
        index: u32,
    ) -> Result<ScriptBuf, DescriptorError> {
        self.cache_to(keychain, index + 1)?;
        Ok(self.spks[&(keychain, index)].clone())
    }

    /// Lowest revealed-but-unused script, revealing a fresh one if all
    /// revealed scripts have seen use.
    pub fn next_unused(
        &mut self,
        keychain: KeychainKind,
    ) -> Result<((u32, ScriptBuf), IndexChangeSet), DescriptorError> {
        let next = self.next_index(keychain);
        for index in 0..next {
            if !self.used.contains(&(keychain, index)) {
                return Ok(((index, self.spks[&(keychain, index)].clone()), IndexChangeSet::default()));
            }
        }
        self.reveal_next(keychain)
    }

    /// Record on-chain use of an index, revealing up to it if needed.
    pub fn mark_used(
        &mut self,
        keychain: KeychainKind,
        index: u32,
    ) -> Result<IndexChangeSet, DescriptorError> {
        let (_, changeset) = self.reveal_to(keychain, index)?;
        self.used.insert((keychain, index));
        Ok(changeset)
    }

    pub fn is_used(&self, keychain: KeychainKind, index: u32) -> bool {
        self.used.contains(&(keychain, index))
    }

    /// Look up the origin of a script, covering the lookahead window.
    pub fn index_of_spk(&self, spk: &Script) -> Option<(KeychainKind, u32)> {
        self.spk_lookup.get(spk).copied()
    }

    /// All revealed scripts of `keychain`, in index order.
    pub fn revealed_spks(&self, keychain: KeychainKind) -> Vec<(u32, ScriptBuf)> {
        let next = self.next_index(keychain);
        (0..next)
            .map(|i| (i, self.spks[&(keychain, i)].clone()))
            .collect()
    }

    /// Unbounded script stream for full scans.
    pub fn unbounded_spk_iter(&self, keychain: KeychainKind) -> Option<SpkIterator> {
        self.descriptors
            .get(&keychain)
            .cloned()
            .map(SpkIterator::new)
    }

    /// Replay a persisted changeset into the reveal frontier.
    pub fn apply_changeset(&mut self, changeset: &IndexChangeSet) -> Result<(), DescriptorError> {
        for (&keychain, &index) in &changeset.last_revealed {
            self.reveal_to(keychain, index)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::Secp256k1;
    use bitcoin::Network;

    const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn test_index(lookahead: u32) -> KeychainIndex {
        let secp = Secp256k1::new();
        let seed = crate::keys::mnemonic_to_seed(TEST_MNEMONIC, "").unwrap();
        let xprv = crate::keys::master_xprv(&seed, Network::Testnet).unwrap();
        let mut descriptors = BTreeMap::new();
        descriptors.insert(
            KeychainKind::External,
            WalletDescriptor::bip84(&secp, xprv, KeychainKind::External, Network::Testnet).unwrap(),
        );
        descriptors.insert(
            KeychainKind::Internal,
            WalletDescriptor::bip84(&secp, xprv, KeychainKind::Internal, Network::Testnet).unwrap(),
        );
        KeychainIndex::new(descriptors, lookahead).unwrap()
    }

    #[test]
    fn reveal_progresses_contiguously() {
        let mut index = test_index(5);
        assert_eq!(index.next_index(KeychainKind::External), 0);
        assert_eq!(index.last_revealed(KeychainKind::External), None);

        let ((i0, spk0), cs0) = index.reveal_next(KeychainKind::External).unwrap();
        let ((i1, spk1), cs1) = index.reveal_next(KeychainKind::External).unwrap();
        assert_eq!((i0, i1), (0, 1));
        assert_ne!(spk0, spk1);
        assert_eq!(cs0.last_revealed[&KeychainKind::External], 0);
        assert_eq!(cs1.last_revealed[&KeychainKind::External], 1);
        assert_eq!(index.last_revealed(KeychainKind::External), Some(1));
    }

    #[test]
    fn keychains_do_not_interfere() {
        let mut index = test_index(5);
        index.reveal_next(KeychainKind::External).unwrap();
        assert_eq!(index.next_index(KeychainKind::External), 1);
        assert_eq!(index.next_index(KeychainKind::Internal), 0);
    }

    #[test]
    fn lookahead_scripts_are_recognized() {
        let mut index = test_index(10);
        // Nothing revealed yet, but index 7 sits inside the lookahead window.
        let spk = index.peek(KeychainKind::External, 7).unwrap();
        assert_eq!(index.index_of_spk(&spk), Some((KeychainKind::External, 7)));
        assert_eq!(index.next_index(KeychainKind::External), 0);
    }

    #[test]
    fn reveal_to_returns_all_new_scripts() {
        let mut index = test_index(5);
        let (spks, changeset) = index.reveal_to(KeychainKind::External, 3).unwrap();
        assert_eq!(
            spks.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
        assert_eq!(changeset.last_revealed[&KeychainKind::External], 3);

        // Revealing backwards is a no-op.
        let (spks, changeset) = index.reveal_to(KeychainKind::External, 1).unwrap();
        assert!(spks.is_empty());
        assert!(changeset.is_empty());
    }

    #[test]
    fn next_unused_skips_used_indices() {
        let mut index = test_index(5);
        index.reveal_to(KeychainKind::External, 2).unwrap();
        index.mark_used(KeychainKind::External, 0).unwrap();
        index.mark_used(KeychainKind::External, 1).unwrap();

        let ((i, _), changeset) = index.next_unused(KeychainKind::External).unwrap();
        assert_eq!(i, 2);
        assert!(changeset.is_empty());

        index.mark_used(KeychainKind::External, 2).unwrap();
        let ((i, _), changeset) = index.next_unused(KeychainKind::External).unwrap();
        assert_eq!(i, 3);
        assert_eq!(changeset.last_revealed[&KeychainKind::External], 3);
    }

    #[test]
    fn mark_used_past_frontier_reveals() {
        let mut index = test_index(5);
        let changeset = index.mark_used(KeychainKind::External, 4).unwrap();
        assert_eq!(changeset.last_revealed[&KeychainKind::External], 4);
        assert_eq!(index.next_index(KeychainKind::External), 5);
        assert!(index.is_used(KeychainKind::External, 4));
        assert!(!index.is_used(KeychainKind::External, 3));
    }

    #[test]
    fn spk_iterator_matches_descriptor() {
        let index = test_index(5);
        let mut iter = index.unbounded_spk_iter(KeychainKind::External).unwrap();
        let descriptor = index.descriptor(KeychainKind::External).unwrap();
        for expected in 0u32..4 {
            let (i, spk) = iter.next().unwrap();
            assert_eq!(i, expected);
            assert_eq!(spk, descriptor.spk_at(expected).unwrap());
        }
    }

    #[test]
    fn changeset_merge_keeps_maximum() {
        let mut a = IndexChangeSet::default();
        a.last_revealed.insert(KeychainKind::External, 5);
        let mut b = IndexChangeSet::default();
        b.last_revealed.insert(KeychainKind::External, 3);
        b.last_revealed.insert(KeychainKind::Internal, 1);
        a.merge(b);
        assert_eq!(a.last_revealed[&KeychainKind::External], 5);
        assert_eq!(a.last_revealed[&KeychainKind::Internal], 1);
    }

    #[test]
    fn apply_changeset_restores_frontier() {
        let mut index = test_index(5);
        let mut changeset = IndexChangeSet::default();
        changeset.last_revealed.insert(KeychainKind::External, 6);
        index.apply_changeset(&changeset).unwrap();
        assert_eq!(index.next_index(KeychainKind::External), 7);

        // The restored frontier still maps scripts back to their indices.
        let spk = index.peek(KeychainKind::External, 6).unwrap();
        assert_eq!(index.index_of_spk(&spk), Some((KeychainKind::External, 6)));
    }
}
