use bip39::{Language, Mnemonic};
use bitcoin::bip32::Xpriv;
use bitcoin::Network;
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroize;

/// Key-material errors.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    #[error("invalid seed: {0}")]
    InvalidSeed(String),

    #[error("bip32 derivation failed: {0}")]
    Bip32(String),
}

/// Generate a BIP-39 mnemonic from OS entropy.
///
/// `word_count` must be one of 12, 15, 18, 21 or 24.
pub fn generate_mnemonic(word_count: usize) -> Result<String, KeyError> {
    let entropy_len = match word_count {
        12 => 16,
        15 => 20,
        18 => 24,
        21 => 28,
        24 => 32,
        n => {
            return Err(KeyError::InvalidMnemonic(format!(
                "unsupported word count: {n}"
            )))
        }
    };

    let mut entropy = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut entropy[..entropy_len]);
    let mnemonic = Mnemonic::from_entropy_in(Language::English, &entropy[..entropy_len])
        .map_err(|e| KeyError::InvalidMnemonic(e.to_string()))?;
    entropy.zeroize();

    Ok(mnemonic.to_string())
}

/// Validate a mnemonic phrase (word list membership and checksum).
pub fn validate_mnemonic(phrase: &str) -> bool {
    Mnemonic::parse_in_normalized(Language::English, phrase).is_ok()
}

/// Check a single word against the BIP-39 English word list.
pub fn is_valid_word(word: &str) -> bool {
    Language::English.find_word(word).is_some()
}

/// The full BIP-39 English word list, for autocomplete.
pub fn word_list() -> &'static [&'static str] {
    Language::English.word_list()
}

/// Derive the 64-byte BIP-39 seed from a mnemonic and optional passphrase.
///
/// The caller MUST zeroize the returned seed when done.
pub fn mnemonic_to_seed(phrase: &str, passphrase: &str) -> Result<Vec<u8>, KeyError> {
    let mnemonic = Mnemonic::parse_in_normalized(Language::English, phrase)
        .map_err(|e| KeyError::InvalidMnemonic(e.to_string()))?;
    Ok(mnemonic.to_seed(passphrase).to_vec())
}

/// Build the BIP-32 master extended private key for `network` from a seed.
pub fn master_xprv(seed: &[u8], network: Network) -> Result<Xpriv, KeyError> {
    Xpriv::new_master(network, seed).map_err(|e| KeyError::InvalidSeed(e.to_string()))
}

/// Mnemonic wrapper that wipes the phrase from memory on drop.
pub struct ZeroizingMnemonic {
    phrase: String,
}

impl ZeroizingMnemonic {
    pub fn new(phrase: String) -> Result<Self, KeyError> {
        if !validate_mnemonic(&phrase) {
            return Err(KeyError::InvalidMnemonic("invalid mnemonic phrase".into()));
        }
        Ok(Self { phrase })
    }

    pub fn as_str(&self) -> &str {
        &self.phrase
    }

    pub fn words(&self) -> Vec<&str> {
        self.phrase.split_whitespace().collect()
    }

    pub fn to_seed(&self, passphrase: &str) -> Result<Vec<u8>, KeyError> {
        mnemonic_to_seed(&self.phrase, passphrase)
    }
}

impl Drop for ZeroizingMnemonic {
    fn drop(&mut self) {
        self.phrase.zeroize();
    }
}
