use std::collections::{BTreeSet, HashMap};

use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, CompressedPublicKey, FeeRate, OutPoint, Psbt, ScriptBuf, Sequence, Transaction, TxIn,
    TxOut, Weight, Witness,
};
use miniscript::descriptor::DescriptorType;
use thiserror::Error;

use crate::coin_selection::{Candidate, CoinSelector, SelectionError, SelectionStrategy};
use crate::descriptor::DescriptorError;
use crate::keychain::KeychainKind;
use crate::tx_graph::COINBASE_MATURITY;
use crate::wallet::{LocalOutput, Wallet};

/// Weight of the segwit marker and flag bytes.
const SEGWIT_HEADER_WEIGHT: u64 = 2;

/// Transaction construction errors.
#[derive(Debug, Error)]
pub enum CreateTxError {
    #[error("transaction has no recipients and no drain script")]
    NoRecipients,

    #[error("output {0} is below the dust limit")]
    OutputBelowDustLimit(usize),

    #[error("coin selection failed: {0}")]
    CoinSelection(#[from] SelectionError),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error("psbt construction failed: {0}")]
    Psbt(String),
}

/// Builder for a wallet spend, returned by [`Wallet::build_tx`].
///
/// Finishing yields an unsigned PSBT with every wallet input carrying the
/// UTXO and key-origin metadata the signer needs.
pub struct TxBuilder<'w> {
    wallet: &'w mut Wallet,
    recipients: Vec<(ScriptBuf, Amount)>,
    drain_to: Option<ScriptBuf>,
    fee_rate: FeeRate,
    absolute_fee: Option<Amount>,
    strategy: SelectionStrategy,
    min_confirmations: u32,
    manually_selected: BTreeSet<OutPoint>,
    manual_only: bool,
    unspendable: BTreeSet<OutPoint>,
    sequence: Sequence,
    locktime: Option<LockTime>,
    version: i32,
    allow_dust: bool,
}

impl<'w> TxBuilder<'w> {
    pub(crate) fn new(wallet: &'w mut Wallet) -> Self {
        Self {
            wallet,
            recipients: Vec::new(),
            drain_to: None,
            fee_rate: FeeRate::BROADCAST_MIN,
            absolute_fee: None,
            strategy: SelectionStrategy::BranchAndBound,
            min_confirmations: 0,
            manually_selected: BTreeSet::new(),
            manual_only: false,
            unspendable: BTreeSet::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            locktime: None,
            version: 2,
            allow_dust: false,
        }
    }

    /// Pay `amount` to `script`. Callable repeatedly.
    pub fn add_recipient(&mut self, script: ScriptBuf, amount: Amount) -> &mut Self {
        self.recipients.push((script, amount));
        self
    }

    /// Sweep everything not sent to other recipients into `script` instead
    /// of a change output.
    pub fn drain_to(&mut self, script: ScriptBuf) -> &mut Self {
        self.drain_to = Some(script);
        self
    }

    pub fn fee_rate(&mut self, fee_rate: FeeRate) -> &mut Self {
        self.fee_rate = fee_rate;
        self
    }

    /// Pay an exact absolute fee instead of a rate.
    pub fn fee_absolute(&mut self, fee: Amount) -> &mut Self {
        self.absolute_fee = Some(fee);
        self
    }

    pub fn coin_selection(&mut self, strategy: SelectionStrategy) -> &mut Self {
        self.strategy = strategy;
        self
    }

    pub fn min_confirmations(&mut self, confirmations: u32) -> &mut Self {
        self.min_confirmations = confirmations;
        self
    }

    /// Force-spend a specific wallet UTXO.
    pub fn add_utxo(&mut self, outpoint: OutPoint) -> &mut Self {
        self.manually_selected.insert(outpoint);
        self
    }

    /// Spend only the manually added UTXOs.
    pub fn manually_selected_only(&mut self) -> &mut Self {
        self.manual_only = true;
        self
    }

    pub fn add_unspendable(&mut self, outpoint: OutPoint) -> &mut Self {
        self.unspendable.insert(outpoint);
        self
    }

    pub fn sequence(&mut self, sequence: Sequence) -> &mut Self {
        self.sequence = sequence;
        self
    }

    /// Explicit nLockTime; defaults to the current tip height to discourage
    /// fee sniping.
    pub fn nlocktime(&mut self, locktime: LockTime) -> &mut Self {
        self.locktime = Some(locktime);
        self
    }

    pub fn version(&mut self, version: i32) -> &mut Self {
        self.version = version;
        self
    }

    pub fn allow_dust(&mut self, allow: bool) -> &mut Self {
        self.allow_dust = allow;
        self
    }

    /// Run coin selection and assemble the unsigned PSBT.
    pub fn finish(self) -> Result<Psbt, CreateTxError> {
        let TxBuilder {
            wallet,
            recipients,
            drain_to,
            fee_rate,
            absolute_fee,
            strategy,
            min_confirmations,
            manually_selected,
            manual_only,
            unspendable,
            sequence,
            locktime,
            version,
            allow_dust,
        } = self;

        if recipients.is_empty() && drain_to.is_none() {
            return Err(CreateTxError::NoRecipients);
        }
        for (i, (spk, amount)) in recipients.iter().enumerate() {
            if !allow_dust && *amount < spk.minimal_non_dust() {
                return Err(CreateTxError::OutputBelowDustLimit(i));
            }
        }

        let tip_height = wallet.chain.tip().height;
        // An absolute fee bypasses rate-based estimation entirely.
        let rate = if absolute_fee.is_some() {
            FeeRate::ZERO
        } else {
            fee_rate
        };
        let fixed_fee = absolute_fee.unwrap_or(Amount::ZERO);

        // Gather spendable candidates.
        let mut meta: HashMap<OutPoint, LocalOutput> = HashMap::new();
        let mut required: Vec<Candidate> = Vec::new();
        let mut optional: Vec<Candidate> = Vec::new();
        for utxo in wallet.list_unspent() {
            if unspendable.contains(&utxo.outpoint) {
                continue;
            }
            if utxo.is_coinbase && utxo.confirmations(tip_height) < COINBASE_MATURITY {
                continue;
            }
            let descriptor = wallet
                .index
                .descriptor(utxo.keychain)
                .expect("wallet keychains always carry a descriptor");
            let candidate = Candidate {
                outpoint: utxo.outpoint,
                value: utxo.txout.value,
                satisfaction_weight: descriptor.max_satisfaction_weight()?,
                confirmation_height: utxo.chain_position.confirmation_height(),
            };
            if manually_selected.contains(&utxo.outpoint) {
                required.push(candidate);
            } else if !manual_only {
                optional.push(candidate);
            }
            meta.insert(utxo.outpoint, utxo);
        }

        let mut outputs: Vec<TxOut> = recipients
            .iter()
            .map(|(spk, amount)| TxOut {
                value: *amount,
                script_pubkey: spk.clone(),
            })
            .collect();
        let recipients_total: Amount = recipients.iter().map(|(_, amount)| *amount).sum();

        let lock_time = locktime
            .unwrap_or_else(|| LockTime::from_height(tip_height).unwrap_or(LockTime::ZERO));

        // Where the remainder goes: the drain script, or fresh change.
        let change_spk = match &drain_to {
            Some(spk) => spk.clone(),
            None => {
                let ((_, spk), reveal) = wallet.index.reveal_next(KeychainKind::Internal)?;
                wallet.stage.index.merge(reveal);
                spk
            }
        };
        let change_txout = TxOut {
            value: Amount::ZERO,
            script_pubkey: change_spk.clone(),
        };
        let change_weight =
            Weight::from_wu(bitcoin::consensus::serialize(&change_txout).len() as u64 * 4);

        let skeleton = Transaction {
            version: Version(version),
            lock_time,
            input: Vec::new(),
            output: outputs.clone(),
        };
        let base_weight = skeleton.weight() + Weight::from_wu(SEGWIT_HEADER_WEIGHT);

        // Pick inputs.
        let selected: Vec<Candidate> = if drain_to.is_some() {
            let all: Vec<Candidate> = required.into_iter().chain(optional).collect();
            if all.is_empty() {
                return Err(SelectionError::NoUtxosAvailable.into());
            }
            all
        } else {
            let target = recipients_total + fee_for(rate, base_weight + change_weight) + fixed_fee;
            let required_total: Amount = required.iter().map(|c| c.value).sum();
            let required_weight: Weight = required
                .iter()
                .map(Candidate::input_weight)
                .fold(Weight::ZERO, |acc, w| acc + w);
            let covered_by_required = target + fee_for(rate, required_weight);

            let mut selected = required;
            if required_total < covered_by_required {
                let remaining = covered_by_required - required_total;
                if manual_only {
                    return Err(SelectionError::InsufficientFunds {
                        available: required_total,
                        required: covered_by_required,
                    }
                    .into());
                }
                let selector = CoinSelector::new(strategy)
                    .with_min_confirmations(min_confirmations)
                    .with_dust_threshold(change_spk.minimal_non_dust());
                let extra = selector.select_coins(&optional, remaining, rate, tip_height)?;
                selected.extend(extra.selected);
            }
            selected
        };

        let input_total: Amount = selected.iter().map(|c| c.value).sum();
        let input_weight: Weight = selected
            .iter()
            .map(Candidate::input_weight)
            .fold(Weight::ZERO, |acc, w| acc + w);

        let fee_with_change = fixed_fee
            .max(fee_for(rate, base_weight + change_weight + input_weight));
        let change_value = input_total
            .checked_sub(recipients_total)
            .and_then(|rest| rest.checked_sub(fee_with_change))
            .ok_or(SelectionError::InsufficientFunds {
                available: input_total,
                required: recipients_total + fee_with_change,
            })?;

        if drain_to.is_some() {
            // The drain output must itself be payable.
            if change_value < change_spk.minimal_non_dust() && !allow_dust {
                return Err(CreateTxError::OutputBelowDustLimit(outputs.len()));
            }
            outputs.push(TxOut {
                value: change_value,
                script_pubkey: change_spk,
            });
        } else if change_value >= change_spk.minimal_non_dust() {
            outputs.push(TxOut {
                value: change_value,
                script_pubkey: change_spk,
            });
        } else {
            // Dust change is absorbed into the fee.
            log::debug!("dropping dust change of {change_value}");
        }

        let tx = Transaction {
            version: Version(version),
            lock_time,
            input: selected
                .iter()
                .map(|c| TxIn {
                    previous_output: c.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence,
                    witness: Witness::default(),
                })
                .collect(),
            output: outputs,
        };

        let mut psbt = Psbt::from_unsigned_tx(tx).map_err(|e| CreateTxError::Psbt(e.to_string()))?;
        for (i, candidate) in selected.iter().enumerate() {
            let utxo = &meta[&candidate.outpoint];
            let descriptor = wallet
                .index
                .descriptor(utxo.keychain)
                .expect("wallet keychains always carry a descriptor");
            let desc_type = descriptor.public().desc_type();
            let input = &mut psbt.inputs[i];

            if let Some(prev_tx) = wallet.graph.get_tx(candidate.outpoint.txid) {
                input.non_witness_utxo = Some(prev_tx.clone());
            }
            if !matches!(
                desc_type,
                DescriptorType::Pkh | DescriptorType::Sh | DescriptorType::ShSortedMulti | DescriptorType::Bare
            ) {
                input.witness_utxo = Some(utxo.txout.clone());
            }

            let keys = descriptor.keys_at(utxo.derivation_index)?;
            if desc_type == DescriptorType::Tr {
                for key in keys {
                    let (xonly, _) = key.public_key.inner.x_only_public_key();
                    input.tap_internal_key = Some(xonly);
                    input
                        .tap_key_origins
                        .insert(xonly, (Vec::new(), (key.fingerprint, key.path)));
                }
            } else {
                if desc_type == DescriptorType::ShWpkh {
                    if let Some(key) = keys.first() {
                        let compressed = CompressedPublicKey(key.public_key.inner);
                        input.redeem_script =
                            Some(ScriptBuf::new_p2wpkh(&compressed.wpubkey_hash()));
                    }
                }
                for key in keys {
                    input
                        .bip32_derivation
                        .insert(key.public_key.inner, (key.fingerprint, key.path));
                }
            }
        }

        Ok(psbt)
    }
}

fn fee_for(rate: FeeRate, weight: Weight) -> Amount {
    rate.fee_wu(weight).unwrap_or(Amount::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{BlockId, ConfirmationBlockTime};
    use crate::keys;
    use crate::sync::Update;
    use bitcoin::hashes::Hash;
    use bitcoin::{BlockHash, Network, Txid};

    const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn test_wallet() -> Wallet {
        let seed = keys::mnemonic_to_seed(TEST_MNEMONIC, "").unwrap();
        let xprv = keys::master_xprv(&seed, Network::Regtest).unwrap();
        Wallet::create_bip84(xprv, Network::Regtest).unwrap()
    }

    fn fund(wallet: &mut Wallet, value: u64, height: u32, tag: u8) -> OutPoint {
        let info = wallet.reveal_next_address(KeychainKind::External).unwrap();
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::from_byte_array([tag; 32]), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey: info.address.script_pubkey(),
            }],
        };
        let txid = tx.compute_txid();
        let anchor = ConfirmationBlockTime {
            block: BlockId {
                height,
                hash: BlockHash::from_byte_array([tag; 32]),
            },
            confirmation_time: 1_600_000_000,
        };
        wallet
            .apply_update(Update {
                chain: vec![anchor.block],
                txs: vec![tx],
                anchors: [(txid, anchor)].into(),
                ..Default::default()
            })
            .unwrap();
        OutPoint::new(txid, 0)
    }

    fn recipient_spk(wallet: &mut Wallet) -> ScriptBuf {
        // Any valid regtest script works as a payee for structure tests.
        wallet
            .peek_address(KeychainKind::External, 50)
            .unwrap()
            .address
            .script_pubkey()
    }

    #[test]
    fn simple_payment_has_change_and_fee() {
        let mut wallet = test_wallet();
        fund(&mut wallet, 100_000, 10, 1);
        let payee = recipient_spk(&mut wallet);

        let mut builder = wallet.build_tx();
        builder
            .add_recipient(payee.clone(), Amount::from_sat(30_000))
            .fee_rate(FeeRate::from_sat_per_vb_unchecked(2));
        let psbt = builder.finish().unwrap();

        let tx = &psbt.unsigned_tx;
        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.output.len(), 2);
        assert!(tx
            .output
            .iter()
            .any(|o| o.script_pubkey == payee && o.value == Amount::from_sat(30_000)));

        let fee = psbt.fee().unwrap();
        assert!(fee >= Amount::from_sat(100)); // 2 sat/vb over a ~150 vb tx
        assert!(fee < Amount::from_sat(2_000));
    }

    #[test]
    fn change_goes_to_internal_keychain() {
        let mut wallet = test_wallet();
        fund(&mut wallet, 100_000, 10, 1);
        let payee = recipient_spk(&mut wallet);

        let mut builder = wallet.build_tx();
        builder.add_recipient(payee.clone(), Amount::from_sat(30_000));
        let psbt = builder.finish().unwrap();

        let change = psbt
            .unsigned_tx
            .output
            .iter()
            .find(|o| o.script_pubkey != payee)
            .expect("change output exists");
        assert_eq!(
            wallet.derivation_of_spk(&change.script_pubkey),
            Some((KeychainKind::Internal, 0))
        );
        // The change reveal is staged for persistence.
        assert_eq!(
            wallet.staged().index.last_revealed[&KeychainKind::Internal],
            0
        );
    }

    #[test]
    fn psbt_inputs_carry_signing_metadata() {
        let mut wallet = test_wallet();
        fund(&mut wallet, 100_000, 10, 1);
        let payee = recipient_spk(&mut wallet);

        let mut builder = wallet.build_tx();
        builder.add_recipient(payee, Amount::from_sat(30_000));
        let psbt = builder.finish().unwrap();

        let input = &psbt.inputs[0];
        assert!(input.witness_utxo.is_some());
        assert!(input.non_witness_utxo.is_some());
        assert_eq!(input.bip32_derivation.len(), 1);
    }

    #[test]
    fn no_recipients_is_rejected() {
        let mut wallet = test_wallet();
        fund(&mut wallet, 100_000, 10, 1);
        let err = wallet.build_tx().finish().unwrap_err();
        assert!(matches!(err, CreateTxError::NoRecipients));
    }

    #[test]
    fn dust_output_is_rejected() {
        let mut wallet = test_wallet();
        fund(&mut wallet, 100_000, 10, 1);
        let payee = recipient_spk(&mut wallet);

        let mut builder = wallet.build_tx();
        builder.add_recipient(payee, Amount::from_sat(100));
        let err = builder.finish().unwrap_err();
        assert!(matches!(err, CreateTxError::OutputBelowDustLimit(0)));
    }

    #[test]
    fn insufficient_funds_is_reported() {
        let mut wallet = test_wallet();
        fund(&mut wallet, 10_000, 10, 1);
        let payee = recipient_spk(&mut wallet);

        let mut builder = wallet.build_tx();
        builder.add_recipient(payee, Amount::from_sat(50_000));
        let err = builder.finish().unwrap_err();
        assert!(matches!(
            err,
            CreateTxError::CoinSelection(SelectionError::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn drain_sweeps_everything_without_change() {
        let mut wallet = test_wallet();
        fund(&mut wallet, 60_000, 10, 1);
        fund(&mut wallet, 40_000, 11, 2);
        let payee = recipient_spk(&mut wallet);

        let mut builder = wallet.build_tx();
        builder
            .drain_to(payee.clone())
            .fee_rate(FeeRate::from_sat_per_vb_unchecked(1));
        let psbt = builder.finish().unwrap();

        let tx = &psbt.unsigned_tx;
        assert_eq!(tx.input.len(), 2);
        assert_eq!(tx.output.len(), 1);
        assert_eq!(tx.output[0].script_pubkey, payee);
        let fee = psbt.fee().unwrap();
        assert_eq!(
            tx.output[0].value + fee,
            Amount::from_sat(100_000)
        );
    }

    #[test]
    fn manual_selection_spends_exactly_the_pinned_utxo() {
        let mut wallet = test_wallet();
        let small = fund(&mut wallet, 30_000, 10, 1);
        fund(&mut wallet, 200_000, 11, 2);
        let payee = recipient_spk(&mut wallet);

        let mut builder = wallet.build_tx();
        builder
            .add_recipient(payee, Amount::from_sat(10_000))
            .add_utxo(small)
            .manually_selected_only();
        let psbt = builder.finish().unwrap();
        assert_eq!(psbt.unsigned_tx.input.len(), 1);
        assert_eq!(psbt.unsigned_tx.input[0].previous_output, small);
    }

    #[test]
    fn unspendable_utxos_are_skipped() {
        let mut wallet = test_wallet();
        let frozen = fund(&mut wallet, 100_000, 10, 1);
        fund(&mut wallet, 90_000, 11, 2);
        let payee = recipient_spk(&mut wallet);

        let mut builder = wallet.build_tx();
        builder
            .add_recipient(payee, Amount::from_sat(10_000))
            .add_unspendable(frozen);
        let psbt = builder.finish().unwrap();
        assert!(psbt
            .unsigned_tx
            .input
            .iter()
            .all(|i| i.previous_output != frozen));
    }

    #[test]
    fn absolute_fee_is_exact() {
        let mut wallet = test_wallet();
        fund(&mut wallet, 100_000, 10, 1);
        let payee = recipient_spk(&mut wallet);

        let mut builder = wallet.build_tx();
        builder
            .add_recipient(payee, Amount::from_sat(30_000))
            .fee_absolute(Amount::from_sat(1_234));
        let psbt = builder.finish().unwrap();
        assert_eq!(psbt.fee().unwrap(), Amount::from_sat(1_234));
    }

    #[test]
    fn default_locktime_discourages_fee_sniping() {
        let mut wallet = test_wallet();
        fund(&mut wallet, 100_000, 123, 1);
        let payee = recipient_spk(&mut wallet);

        let mut builder = wallet.build_tx();
        builder.add_recipient(payee, Amount::from_sat(30_000));
        let psbt = builder.finish().unwrap();
        assert_eq!(
            psbt.unsigned_tx.lock_time,
            LockTime::from_height(123).unwrap()
        );
        // RBF is on by default.
        assert!(psbt.unsigned_tx.input[0].sequence.is_rbf());
    }

    #[test]
    fn immature_coinbase_is_not_spent() {
        let mut wallet = test_wallet();
        // A coinbase paying the wallet at height 10, tip at 50: 41 confs.
        let info = wallet.reveal_next_address(KeychainKind::External).unwrap();
        let coinbase = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::from_bytes(vec![0x51]),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(5_000_000_000),
                script_pubkey: info.address.script_pubkey(),
            }],
        };
        let txid = coinbase.compute_txid();
        let anchor = ConfirmationBlockTime {
            block: BlockId {
                height: 10,
                hash: BlockHash::from_byte_array([3; 32]),
            },
            confirmation_time: 1_600_000_000,
        };
        wallet
            .apply_update(Update {
                chain: vec![
                    anchor.block,
                    BlockId {
                        height: 50,
                        hash: BlockHash::from_byte_array([4; 32]),
                    },
                ],
                txs: vec![coinbase],
                anchors: [(txid, anchor)].into(),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(wallet.balance().immature, Amount::from_sat(5_000_000_000));
        let payee = recipient_spk(&mut wallet);
        let mut builder = wallet.build_tx();
        builder.add_recipient(payee, Amount::from_sat(10_000));
        let err = builder.finish().unwrap_err();
        assert!(matches!(err, CreateTxError::CoinSelection(_)));
    }
}
