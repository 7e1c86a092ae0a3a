use bitcoin::Network;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crypto_utils::zeroizing::SecretBytes;
use crypto_utils::{sealing, CryptoError, SealedData};

use crate::descriptor::DescriptorError;
use crate::keychain::KeychainKind;
use crate::wallet::Wallet;

/// Everything needed to recreate a wallet: both descriptors (secret form
/// when available) and the network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletBackup {
    pub descriptor: String,
    pub change_descriptor: String,
    pub network: Network,
}

/// Backup errors.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("backup payload is malformed: {0}")]
    Malformed(String),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

/// Seal a wallet's descriptors under a passphrase.
///
/// The payload is JSON sealed with Argon2id + AES-256-GCM. For a signing
/// wallet it contains the secret descriptors; guard the result accordingly.
pub fn export_backup(wallet: &Wallet, passphrase: &str) -> Result<SealedData, BackupError> {
    let backup = WalletBackup {
        descriptor: wallet
            .descriptor(KeychainKind::External)
            .expect("wallet keychains always carry a descriptor")
            .to_string_with_secret(),
        change_descriptor: wallet
            .descriptor(KeychainKind::Internal)
            .expect("wallet keychains always carry a descriptor")
            .to_string_with_secret(),
        network: wallet.network(),
    };

    let payload = SecretBytes::new(
        serde_json::to_vec(&backup).map_err(|e| BackupError::Malformed(e.to_string()))?,
    );
    Ok(sealing::seal(&payload, passphrase.as_bytes())?)
}

/// Recreate a fresh wallet from a sealed backup.
///
/// The restored wallet starts with empty chain state; run a full scan to
/// rediscover its history.
pub fn restore_backup(sealed: &SealedData, passphrase: &str) -> Result<Wallet, BackupError> {
    let payload = SecretBytes::new(sealing::open(sealed, passphrase.as_bytes())?);
    let backup: WalletBackup =
        serde_json::from_slice(&payload).map_err(|e| BackupError::Malformed(e.to_string()))?;

    let wallet = Wallet::create(&backup.descriptor, &backup.change_descriptor, backup.network)?;
    Ok(wallet)
}
