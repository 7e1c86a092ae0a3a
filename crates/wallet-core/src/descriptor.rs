use std::fmt;

use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, Xpriv};
use bitcoin::secp256k1::{All, Secp256k1, SecretKey};
use bitcoin::{Address, Amount, Network, ScriptBuf, Weight};
use miniscript::descriptor::{DescriptorSecretKey, KeyMap, Wildcard};
use miniscript::{Descriptor, DescriptorPublicKey, ForEachKey, ToPublicKey};
use thiserror::Error;

use crate::keychain::KeychainKind;

/// Descriptor parsing and derivation errors.
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("invalid descriptor: {0}")]
    Invalid(String),

    #[error("multipath descriptors are not supported")]
    MultiPath,

    #[error("keychain descriptors must be ranged (end the key with /*)")]
    MissingWildcard,

    #[error("derivation failed: {0}")]
    Derivation(String),

    #[error("script has no address form: {0}")]
    Address(String),
}

/// Provenance of one key derived from a descriptor, as recorded in PSBTs.
#[derive(Debug, Clone)]
pub struct KeyProvenance {
    pub public_key: bitcoin::PublicKey,
    pub fingerprint: Fingerprint,
    pub path: DerivationPath,
}

/// A ranged wallet descriptor together with any secret keys it carried.
///
/// Parsing splits the input into a public descriptor (xpubs only) and a key
/// map holding the secret material, so the public form can be persisted and
/// shared while signing stays possible in-process.
#[derive(Debug, Clone)]
pub struct WalletDescriptor {
    public: Descriptor<DescriptorPublicKey>,
    keymap: KeyMap,
}

impl WalletDescriptor {
    /// Parse a descriptor string, with or without secret keys.
    pub fn parse(secp: &Secp256k1<All>, descriptor: &str) -> Result<Self, DescriptorError> {
        let (public, keymap) = Descriptor::parse_descriptor(secp, descriptor)
            .map_err(|e| DescriptorError::Invalid(e.to_string()))?;

        if public.is_multipath() {
            return Err(DescriptorError::MultiPath);
        }
        if !public.has_wildcard() {
            return Err(DescriptorError::MissingWildcard);
        }
        public
            .sanity_check()
            .map_err(|e| DescriptorError::Invalid(e.to_string()))?;

        Ok(Self { public, keymap })
    }

    /// BIP-44 legacy template: `pkh(xprv/44'/coin'/0'/change/*)`.
    pub fn bip44(
        secp: &Secp256k1<All>,
        xprv: Xpriv,
        keychain: KeychainKind,
        network: Network,
    ) -> Result<Self, DescriptorError> {
        let inner = Self::template_path(xprv, 44, keychain, network);
        Self::parse(secp, &format!("pkh({inner})"))
    }

    /// BIP-49 wrapped-segwit template: `sh(wpkh(xprv/49'/coin'/0'/change/*))`.
    pub fn bip49(
        secp: &Secp256k1<All>,
        xprv: Xpriv,
        keychain: KeychainKind,
        network: Network,
    ) -> Result<Self, DescriptorError> {
        let inner = Self::template_path(xprv, 49, keychain, network);
        Self::parse(secp, &format!("sh(wpkh({inner}))"))
    }

    /// BIP-84 native-segwit template: `wpkh(xprv/84'/coin'/0'/change/*)`.
    pub fn bip84(
        secp: &Secp256k1<All>,
        xprv: Xpriv,
        keychain: KeychainKind,
        network: Network,
    ) -> Result<Self, DescriptorError> {
        let inner = Self::template_path(xprv, 84, keychain, network);
        Self::parse(secp, &format!("wpkh({inner})"))
    }

    /// BIP-86 taproot template: `tr(xprv/86'/coin'/0'/change/*)`.
    pub fn bip86(
        secp: &Secp256k1<All>,
        xprv: Xpriv,
        keychain: KeychainKind,
        network: Network,
    ) -> Result<Self, DescriptorError> {
        let inner = Self::template_path(xprv, 86, keychain, network);
        Self::parse(secp, &format!("tr({inner})"))
    }

    fn template_path(xprv: Xpriv, purpose: u32, keychain: KeychainKind, network: Network) -> String {
        // Coin type 0 is mainnet; every test network shares coin type 1.
        let coin = if network == Network::Bitcoin { 0 } else { 1 };
        let change = keychain.as_u32();
        format!("{xprv}/{purpose}'/{coin}'/0'/{change}/*")
    }

    /// The scriptPubKey at a wildcard index.
    pub fn spk_at(&self, index: u32) -> Result<ScriptBuf, DescriptorError> {
        let derived = self
            .public
            .at_derivation_index(index)
            .map_err(|e| DescriptorError::Derivation(e.to_string()))?;
        Ok(derived.script_pubkey())
    }

    /// The address at a wildcard index on `network`.
    pub fn address_at(&self, index: u32, network: Network) -> Result<Address, DescriptorError> {
        let derived = self
            .public
            .at_derivation_index(index)
            .map_err(|e| DescriptorError::Derivation(e.to_string()))?;
        derived
            .address(network)
            .map_err(|e| DescriptorError::Address(e.to_string()))
    }

    /// Key provenance (pubkey, master fingerprint, full path) at an index.
    pub fn keys_at(&self, index: u32) -> Result<Vec<KeyProvenance>, DescriptorError> {
        let derived = self
            .public
            .at_derivation_index(index)
            .map_err(|e| DescriptorError::Derivation(e.to_string()))?;

        let mut keys = Vec::new();
        derived.for_each_key(|key| {
            keys.push(KeyProvenance {
                public_key: key.to_public_key(),
                fingerprint: key.master_fingerprint(),
                path: key.full_derivation_path().unwrap_or_default(),
            });
            true
        });
        Ok(keys)
    }

    /// Derive the secret key signing for wildcard `index`, if this
    /// descriptor was parsed with secret material.
    pub fn derive_signing_key(
        &self,
        secp: &Secp256k1<All>,
        index: u32,
    ) -> Result<Option<SecretKey>, DescriptorError> {
        for secret in self.keymap.values() {
            match secret {
                DescriptorSecretKey::Single(single) => return Ok(Some(single.key.inner)),
                DescriptorSecretKey::XPrv(xkey) => {
                    let child = match xkey.wildcard {
                        Wildcard::None => None,
                        Wildcard::Unhardened => Some(
                            ChildNumber::from_normal_idx(index)
                                .map_err(|e| DescriptorError::Derivation(e.to_string()))?,
                        ),
                        Wildcard::Hardened => Some(
                            ChildNumber::from_hardened_idx(index)
                                .map_err(|e| DescriptorError::Derivation(e.to_string()))?,
                        ),
                    };
                    let path = match child {
                        Some(child) => xkey.derivation_path.extend([child]),
                        None => xkey.derivation_path.clone(),
                    };
                    let derived = xkey
                        .xkey
                        .derive_priv(secp, &path)
                        .map_err(|e| DescriptorError::Derivation(e.to_string()))?;
                    return Ok(Some(derived.private_key));
                }
                DescriptorSecretKey::MultiXPrv(_) => return Err(DescriptorError::MultiPath),
            }
        }
        Ok(None)
    }

    /// Worst-case witness + scriptSig weight needed to spend an output.
    pub fn max_satisfaction_weight(&self) -> Result<Weight, DescriptorError> {
        self.public
            .max_weight_to_satisfy()
            .map_err(|e| DescriptorError::Invalid(e.to_string()))
    }

    /// Smallest non-dust amount for outputs of this descriptor.
    pub fn dust_value(&self) -> Result<Amount, DescriptorError> {
        Ok(self.spk_at(0)?.minimal_non_dust())
    }

    /// Whether secret keys were supplied at parse time.
    pub fn has_secret_keys(&self) -> bool {
        !self.keymap.is_empty()
    }

    /// The descriptor string including secret keys, for backups.
    pub fn to_string_with_secret(&self) -> String {
        self.public.to_string_with_secret(&self.keymap)
    }

    pub(crate) fn public(&self) -> &Descriptor<DescriptorPublicKey> {
        &self.public
    }
}

impl fmt::Display for WalletDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.public.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys;

    // The official BIP-84 test vector mnemonic.
    const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn test_xprv(network: Network) -> Xpriv {
        let seed = keys::mnemonic_to_seed(TEST_MNEMONIC, "").unwrap();
        keys::master_xprv(&seed, network).unwrap()
    }

    #[test]
    fn bip84_matches_reference_vector() {
        let secp = Secp256k1::new();
        let desc = WalletDescriptor::bip84(
            &secp,
            test_xprv(Network::Bitcoin),
            KeychainKind::External,
            Network::Bitcoin,
        )
        .unwrap();

        // First two receive addresses from the BIP-84 reference vectors.
        assert_eq!(
            desc.address_at(0, Network::Bitcoin).unwrap().to_string(),
            "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu"
        );
        assert_eq!(
            desc.address_at(1, Network::Bitcoin).unwrap().to_string(),
            "bc1qnjg0jd8228aq7egyzacy8cys3knf9xvrerkf9g"
        );
    }

    #[test]
    fn bip84_change_keychain_differs() {
        let secp = Secp256k1::new();
        let xprv = test_xprv(Network::Bitcoin);
        let external =
            WalletDescriptor::bip84(&secp, xprv, KeychainKind::External, Network::Bitcoin).unwrap();
        let internal =
            WalletDescriptor::bip84(&secp, xprv, KeychainKind::Internal, Network::Bitcoin).unwrap();
        assert_ne!(external.spk_at(0).unwrap(), internal.spk_at(0).unwrap());
    }

    #[test]
    fn template_script_kinds() {
        let secp = Secp256k1::new();
        let xprv = test_xprv(Network::Testnet);
        let kc = KeychainKind::External;
        let net = Network::Testnet;

        let bip44 = WalletDescriptor::bip44(&secp, xprv, kc, net).unwrap();
        let bip49 = WalletDescriptor::bip49(&secp, xprv, kc, net).unwrap();
        let bip84 = WalletDescriptor::bip84(&secp, xprv, kc, net).unwrap();
        let bip86 = WalletDescriptor::bip86(&secp, xprv, kc, net).unwrap();

        assert!(bip44.spk_at(0).unwrap().is_p2pkh());
        assert!(bip49.spk_at(0).unwrap().is_p2sh());
        assert!(bip84.spk_at(0).unwrap().is_p2wpkh());
        assert!(bip86.spk_at(0).unwrap().is_p2tr());
    }

    #[test]
    fn parse_keeps_secrets_out_of_public_form() {
        let secp = Secp256k1::new();
        let desc = WalletDescriptor::bip84(
            &secp,
            test_xprv(Network::Testnet),
            KeychainKind::External,
            Network::Testnet,
        )
        .unwrap();

        assert!(desc.has_secret_keys());
        let public = desc.to_string();
        assert!(public.contains("tpub"), "public form should carry an xpub: {public}");
        assert!(!public.contains("tprv"));
        let secret = desc.to_string_with_secret();
        assert!(secret.contains("tprv"));
    }

    #[test]
    fn public_descriptor_cannot_sign() {
        let secp = Secp256k1::new();
        let with_secret = WalletDescriptor::bip84(
            &secp,
            test_xprv(Network::Testnet),
            KeychainKind::External,
            Network::Testnet,
        )
        .unwrap();
        let watch_only = WalletDescriptor::parse(&secp, &with_secret.to_string()).unwrap();

        assert!(with_secret.derive_signing_key(&secp, 0).unwrap().is_some());
        assert!(watch_only.derive_signing_key(&secp, 0).unwrap().is_none());
    }

    #[test]
    fn unranged_descriptor_is_rejected() {
        let secp = Secp256k1::new();
        let desc = WalletDescriptor::bip84(
            &secp,
            test_xprv(Network::Testnet),
            KeychainKind::External,
            Network::Testnet,
        )
        .unwrap();
        // Freeze the wildcard at a concrete index and re-parse (the checksum
        // is dropped so the altered string stays parseable).
        let without_checksum = desc.to_string();
        let without_checksum = without_checksum.split('#').next().unwrap();
        let fixed = without_checksum.replace("/*", "/0");
        let err = WalletDescriptor::parse(&secp, &fixed).unwrap_err();
        assert!(matches!(err, DescriptorError::MissingWildcard));
    }

    #[test]
    fn garbage_descriptor_is_invalid() {
        let secp = Secp256k1::new();
        let err = WalletDescriptor::parse(&secp, "wpkh(clearly-not-a-key)").unwrap_err();
        assert!(matches!(err, DescriptorError::Invalid(_)));
    }

    #[test]
    fn signing_key_matches_derived_pubkey() {
        let secp = Secp256k1::new();
        let desc = WalletDescriptor::bip84(
            &secp,
            test_xprv(Network::Testnet),
            KeychainKind::External,
            Network::Testnet,
        )
        .unwrap();

        let sk = desc.derive_signing_key(&secp, 7).unwrap().unwrap();
        let pk = bitcoin::secp256k1::PublicKey::from_secret_key(&secp, &sk);
        let provenance = &desc.keys_at(7).unwrap()[0];
        assert_eq!(provenance.public_key.inner, pk);
    }

    #[test]
    fn dust_value_is_positive() {
        let secp = Secp256k1::new();
        let desc = WalletDescriptor::bip84(
            &secp,
            test_xprv(Network::Testnet),
            KeychainKind::External,
            Network::Testnet,
        )
        .unwrap();
        assert!(desc.dust_value().unwrap() > Amount::ZERO);
    }
}
