//! # crypto-utils
//!
//! Passphrase-based sealing, key derivation, secure randomness, and memory
//! hygiene primitives used for encrypted wallet backups.

pub mod error;
pub mod kdf;
pub mod random;
pub mod sealing;
pub mod zeroizing;

pub use error::CryptoError;
pub use sealing::SealedData;
