use thiserror::Error;

/// Cryptographic operation errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("sealing failed: {0}")]
    SealFailed(String),

    #[error("opening failed: {0}")]
    OpenFailed(String),

    #[error("key derivation failed: {0}")]
    KdfFailed(String),

    #[error("malformed sealed payload: {0}")]
    MalformedPayload(String),
}
