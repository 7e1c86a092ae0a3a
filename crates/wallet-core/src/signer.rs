use bitcoin::hashes::Hash;
use bitcoin::key::TapTweak;
use bitcoin::secp256k1::{Keypair, Message};
use bitcoin::sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType};
use bitcoin::{psbt, CompressedPublicKey, Psbt, ScriptBuf, Transaction, TxOut};
use miniscript::psbt::PsbtExt;
use thiserror::Error;

use crate::descriptor::DescriptorError;
use crate::wallet::Wallet;

/// Knobs for [`Wallet::sign`].
#[derive(Debug, Clone)]
pub struct SignOptions {
    /// Accept a `witness_utxo` for segwit v0 inputs even when the full
    /// previous transaction is absent. Off by default: a lying
    /// `witness_utxo` can misrepresent the amount being signed over.
    pub trust_witness_utxo: bool,
    /// Accept sighash types other than ALL/DEFAULT when the PSBT asks for
    /// them.
    pub allow_all_sighashes: bool,
    /// Attempt finalization after signing.
    pub try_finalize: bool,
}

impl Default for SignOptions {
    fn default() -> Self {
        Self {
            trust_witness_utxo: false,
            allow_all_sighashes: false,
            try_finalize: true,
        }
    }
}

/// Signing and finalization errors.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("input {0}: non_witness_utxo does not match the spent outpoint")]
    InvalidNonWitnessUtxo(usize),

    #[error("input {0}: prevout information missing")]
    MissingUtxo(usize),

    #[error("input {0}: non-standard sighash type requested")]
    NonStandardSighash(usize),

    #[error("input {0}: script type is not supported for signing")]
    UnsupportedScript(usize),

    #[error("malformed psbt: {0}")]
    InvalidPsbt(String),

    #[error("sighash computation failed: {0}")]
    Sighash(String),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

/// Sign every wallet-owned input of `psbt`.
///
/// Inputs the wallet does not recognize are left untouched, so a PSBT can
/// travel between multiple signers. Returns whether the PSBT ended up fully
/// finalized.
pub(crate) fn sign_psbt(
    wallet: &Wallet,
    psbt: &mut Psbt,
    options: SignOptions,
) -> Result<bool, SignerError> {
    if psbt.inputs.len() != psbt.unsigned_tx.input.len() {
        return Err(SignerError::InvalidPsbt(
            "input map length differs from transaction input count".into(),
        ));
    }

    let secp = &wallet.secp;
    let tx = psbt.unsigned_tx.clone();
    let mut cache = SighashCache::new(&tx);

    let mut prevouts: Vec<Option<TxOut>> = Vec::with_capacity(psbt.inputs.len());
    for (i, input) in psbt.inputs.iter().enumerate() {
        prevouts.push(resolve_prevout(&tx, input, i, &options)?);
    }

    for i in 0..psbt.inputs.len() {
        if psbt.inputs[i].final_script_sig.is_some()
            || psbt.inputs[i].final_script_witness.is_some()
        {
            continue;
        }
        let Some(prevout) = prevouts[i].clone() else {
            continue;
        };
        let spk = prevout.script_pubkey.clone();
        let Some((keychain, index)) = wallet.index.index_of_spk(&spk) else {
            continue; // foreign input, another signer's business
        };
        let descriptor = wallet
            .index
            .descriptor(keychain)
            .expect("wallet keychains always carry a descriptor");
        let Some(secret) = descriptor.derive_signing_key(secp, index)? else {
            continue; // watch-only
        };

        if spk.is_p2tr() {
            let hash_ty = match psbt.inputs[i].sighash_type {
                None => TapSighashType::Default,
                Some(ty) => {
                    let ty = ty
                        .taproot_hash_ty()
                        .map_err(|_| SignerError::NonStandardSighash(i))?;
                    if !matches!(ty, TapSighashType::Default | TapSighashType::All)
                        && !options.allow_all_sighashes
                    {
                        return Err(SignerError::NonStandardSighash(i));
                    }
                    ty
                }
            };

            // Key-path spends commit to every prevout.
            let all_prevouts: Vec<TxOut> = prevouts
                .iter()
                .cloned()
                .map(|p| p.ok_or(SignerError::MissingUtxo(i)))
                .collect::<Result<_, _>>()?;
            let sighash = cache
                .taproot_key_spend_signature_hash(i, &Prevouts::All(&all_prevouts), hash_ty)
                .map_err(|e| SignerError::Sighash(e.to_string()))?;

            let keypair = Keypair::from_secret_key(secp, &secret);
            let tweaked = keypair.tap_tweak(secp, None);
            let msg = Message::from_digest(sighash.to_byte_array());
            let signature = secp.sign_schnorr(&msg, &tweaked.to_inner());
            psbt.inputs[i].tap_key_sig = Some(bitcoin::taproot::Signature {
                signature,
                sighash_type: hash_ty,
            });
        } else {
            let hash_ty = match psbt.inputs[i].sighash_type {
                None => EcdsaSighashType::All,
                Some(ty) => {
                    let ty = ty
                        .ecdsa_hash_ty()
                        .map_err(|_| SignerError::NonStandardSighash(i))?;
                    if ty != EcdsaSighashType::All && !options.allow_all_sighashes {
                        return Err(SignerError::NonStandardSighash(i));
                    }
                    ty
                }
            };

            let public = bitcoin::secp256k1::PublicKey::from_secret_key(secp, &secret);
            let compressed = CompressedPublicKey(public);

            let sighash: [u8; 32] = if spk.is_p2wpkh() {
                cache
                    .p2wpkh_signature_hash(i, &spk, prevout.value, hash_ty)
                    .map_err(|e| SignerError::Sighash(e.to_string()))?
                    .to_byte_array()
            } else if spk.is_p2sh() {
                // Wrapped segwit: the redeem script is our p2wpkh program.
                let redeem = ScriptBuf::new_p2wpkh(&compressed.wpubkey_hash());
                psbt.inputs[i].redeem_script = Some(redeem.clone());
                cache
                    .p2wpkh_signature_hash(i, &redeem, prevout.value, hash_ty)
                    .map_err(|e| SignerError::Sighash(e.to_string()))?
                    .to_byte_array()
            } else if spk.is_p2pkh() {
                cache
                    .legacy_signature_hash(i, &spk, hash_ty.to_u32())
                    .map_err(|e| SignerError::Sighash(e.to_string()))?
                    .to_byte_array()
            } else {
                return Err(SignerError::UnsupportedScript(i));
            };

            let msg = Message::from_digest(sighash);
            let signature = secp.sign_ecdsa(&msg, &secret);
            psbt.inputs[i].partial_sigs.insert(
                bitcoin::PublicKey::new(public),
                bitcoin::ecdsa::Signature {
                    signature,
                    sighash_type: hash_ty,
                },
            );
        }
    }

    if options.try_finalize {
        finalize_psbt(wallet, psbt)
    } else {
        Ok(is_finalized(psbt))
    }
}

/// Build final witnesses / scriptSigs for every satisfiable input.
pub(crate) fn finalize_psbt(wallet: &Wallet, psbt: &mut Psbt) -> Result<bool, SignerError> {
    for i in 0..psbt.inputs.len() {
        let input = &psbt.inputs[i];
        if input.final_script_sig.is_some() || input.final_script_witness.is_some() {
            continue;
        }
        if let Err(e) = psbt.finalize_inp_mut(&wallet.secp, i) {
            log::debug!("input {i} not finalized: {e}");
        }
    }
    Ok(is_finalized(psbt))
}

fn is_finalized(psbt: &Psbt) -> bool {
    psbt.inputs
        .iter()
        .all(|input| input.final_script_sig.is_some() || input.final_script_witness.is_some())
}

fn resolve_prevout(
    tx: &Transaction,
    input: &psbt::Input,
    index: usize,
    options: &SignOptions,
) -> Result<Option<TxOut>, SignerError> {
    let txin = &tx.input[index];

    if let Some(prev_tx) = &input.non_witness_utxo {
        if prev_tx.compute_txid() != txin.previous_output.txid {
            return Err(SignerError::InvalidNonWitnessUtxo(index));
        }
        let txout = prev_tx
            .output
            .get(txin.previous_output.vout as usize)
            .cloned()
            .ok_or_else(|| {
                SignerError::InvalidPsbt(format!("prevout index out of range for input {index}"))
            })?;
        return Ok(Some(txout));
    }

    if let Some(txout) = &input.witness_utxo {
        // Taproot commits to amounts across all inputs, so a witness_utxo
        // alone is acceptable; v0 inputs need an opt-in.
        if options.trust_witness_utxo || txout.script_pubkey.is_p2tr() {
            return Ok(Some(txout.clone()));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{BlockId, ConfirmationBlockTime};
    use crate::keychain::KeychainKind;
    use crate::keys;
    use crate::sync::Update;
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{
        Amount, BlockHash, FeeRate, Network, OutPoint, Sequence, TxIn, Txid, Witness,
    };

    const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn xprv() -> bitcoin::bip32::Xpriv {
        let seed = keys::mnemonic_to_seed(TEST_MNEMONIC, "").unwrap();
        keys::master_xprv(&seed, Network::Regtest).unwrap()
    }

    fn fund(wallet: &mut Wallet, value: u64, height: u32, tag: u8) {
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
    }

    fn payment_psbt(wallet: &mut Wallet) -> Psbt {
        let payee = wallet
            .peek_address(KeychainKind::External, 40)
            .unwrap()
            .address
            .script_pubkey();
        let mut builder = wallet.build_tx();
        builder
            .add_recipient(payee, Amount::from_sat(25_000))
            .fee_rate(FeeRate::from_sat_per_vb_unchecked(2));
        builder.finish().unwrap()
    }

    #[test]
    fn signs_and_finalizes_p2wpkh() {
        let mut wallet = Wallet::create_bip84(xprv(), Network::Regtest).unwrap();
        fund(&mut wallet, 100_000, 10, 1);

        let mut psbt = payment_psbt(&mut wallet);
        let finalized = wallet.sign(&mut psbt, SignOptions::default()).unwrap();
        assert!(finalized);

        let witness = psbt.inputs[0].final_script_witness.as_ref().unwrap();
        assert_eq!(witness.len(), 2); // signature + pubkey

        let tx = psbt.extract_tx().unwrap();
        assert_eq!(tx.input.len(), 1);
        assert!(!tx.input[0].witness.is_empty());
    }

    #[test]
    fn signs_and_finalizes_p2tr_keyspend() {
        let mut wallet = Wallet::create_bip86(xprv(), Network::Regtest).unwrap();
        fund(&mut wallet, 100_000, 10, 1);

        let mut psbt = payment_psbt(&mut wallet);
        let finalized = wallet.sign(&mut psbt, SignOptions::default()).unwrap();
        assert!(finalized);

        let witness = psbt.inputs[0].final_script_witness.as_ref().unwrap();
        assert_eq!(witness.len(), 1); // key-path spend: just the signature
        assert_eq!(witness.iter().next().unwrap().len(), 64); // default sighash
    }

    #[test]
    fn signing_without_finalize_leaves_partial_sigs() {
        let mut wallet = Wallet::create_bip84(xprv(), Network::Regtest).unwrap();
        fund(&mut wallet, 100_000, 10, 1);

        let mut psbt = payment_psbt(&mut wallet);
        let options = SignOptions {
            try_finalize: false,
            ..Default::default()
        };
        let finalized = wallet.sign(&mut psbt, options).unwrap();
        assert!(!finalized);
        assert_eq!(psbt.inputs[0].partial_sigs.len(), 1);
        assert!(psbt.inputs[0].final_script_witness.is_none());

        // Finalize separately.
        assert!(wallet.finalize_psbt(&mut psbt).unwrap());
    }

    #[test]
    fn watch_only_wallet_cannot_sign() {
        let mut signing = Wallet::create_bip84(xprv(), Network::Regtest).unwrap();
        fund(&mut signing, 100_000, 10, 1);
        let mut psbt = payment_psbt(&mut signing);

        // Same wallet, public descriptors only.
        let mut watch_only = Wallet::create(
            &signing
                .descriptor(KeychainKind::External)
                .unwrap()
                .to_string(),
            &signing
                .descriptor(KeychainKind::Internal)
                .unwrap()
                .to_string(),
            Network::Regtest,
        )
        .unwrap();
        fund(&mut watch_only, 100_000, 10, 1);

        let finalized = watch_only.sign(&mut psbt, SignOptions::default()).unwrap();
        assert!(!finalized);
        assert!(psbt.inputs[0].partial_sigs.is_empty());
    }

    #[test]
    fn foreign_inputs_are_left_alone() {
        let mut wallet = Wallet::create_bip84(xprv(), Network::Regtest).unwrap();
        fund(&mut wallet, 100_000, 10, 1);
        let mut psbt = payment_psbt(&mut wallet);

        // Strip prevout info: the input can no longer be attributed.
        psbt.inputs[0].non_witness_utxo = None;
        psbt.inputs[0].witness_utxo = None;

        let finalized = wallet.sign(&mut psbt, SignOptions::default()).unwrap();
        assert!(!finalized);
        assert!(psbt.inputs[0].partial_sigs.is_empty());
    }

    #[test]
    fn non_standard_sighash_is_refused() {
        let mut wallet = Wallet::create_bip84(xprv(), Network::Regtest).unwrap();
        fund(&mut wallet, 100_000, 10, 1);
        let mut psbt = payment_psbt(&mut wallet);
        psbt.inputs[0].sighash_type = Some(EcdsaSighashType::Single.into());

        let err = wallet.sign(&mut psbt, SignOptions::default()).unwrap_err();
        assert!(matches!(err, SignerError::NonStandardSighash(0)));
    }

    #[test]
    fn mismatched_non_witness_utxo_is_rejected() {
        let mut wallet = Wallet::create_bip84(xprv(), Network::Regtest).unwrap();
        fund(&mut wallet, 100_000, 10, 1);
        let mut psbt = payment_psbt(&mut wallet);

        // Swap in an unrelated transaction as the claimed prevout source.
        let bogus = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![TxOut {
                value: Amount::from_sat(1),
                script_pubkey: ScriptBuf::new(),
            }],
        };
        psbt.inputs[0].non_witness_utxo = Some(bogus);

        let err = wallet.sign(&mut psbt, SignOptions::default()).unwrap_err();
        assert!(matches!(err, SignerError::InvalidNonWitnessUtxo(0)));
    }
}
