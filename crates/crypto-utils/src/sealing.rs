use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::kdf::{self, SALT_SIZE};

/// AES-256-GCM nonce size in bytes.
const NONCE_SIZE: usize = 12;

/// A passphrase-sealed payload.
///
/// The ciphertext carries its 12-byte nonce as a prefix, followed by the
/// AEAD output (plaintext-length bytes plus the 16-byte GCM tag). The salt
/// feeds the Argon2id stretch of the passphrase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedData {
    pub salt: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Seal `plaintext` under `passphrase`.
///
/// A fresh salt and nonce are drawn per call, so sealing the same plaintext
/// twice yields unrelated ciphertexts.
pub fn seal(plaintext: &[u8], passphrase: &[u8]) -> Result<SealedData, CryptoError> {
    let salt = kdf::fresh_salt();
    let mut key = kdf::stretch_passphrase(passphrase, &salt)?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let nonce_bytes: [u8; NONCE_SIZE] = crate::random::fill_random();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let sealed = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CryptoError::SealFailed(e.to_string()))?;
    key.zeroize();

    let mut ciphertext = Vec::with_capacity(NONCE_SIZE + sealed.len());
    ciphertext.extend_from_slice(&nonce_bytes);
    ciphertext.extend_from_slice(&sealed);

    Ok(SealedData {
        salt: salt.to_vec(),
        ciphertext,
    })
}

/// Open a payload previously produced by [`seal`].
///
/// A wrong passphrase or any ciphertext tampering fails the GCM tag check
/// and surfaces as [`CryptoError::OpenFailed`]. The caller must zeroize the
/// returned plaintext once it is no longer needed.
pub fn open(sealed: &SealedData, passphrase: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let salt: [u8; SALT_SIZE] = sealed.salt.as_slice().try_into().map_err(|_| {
        CryptoError::MalformedPayload(format!(
            "salt must be {SALT_SIZE} bytes, got {}",
            sealed.salt.len()
        ))
    })?;

    if sealed.ciphertext.len() < NONCE_SIZE {
        return Err(CryptoError::MalformedPayload(format!(
            "ciphertext shorter than the {NONCE_SIZE}-byte nonce prefix"
        )));
    }

    let mut key = kdf::stretch_passphrase(passphrase, &salt)?;
    let (nonce_bytes, body) = sealed.ciphertext.split_at(NONCE_SIZE);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), body)
        .map_err(|e| CryptoError::OpenFailed(e.to_string()));
    key.zeroize();

    plaintext
}
