use argon2::{Algorithm, Argon2, Params, Version};

use crate::error::CryptoError;

/// Argon2id salt size in bytes.
pub const SALT_SIZE: usize = 16;

/// Argon2id memory cost in KiB (64 MiB).
const MEMORY_KIB: u32 = 65536;

/// Argon2id iteration count.
const ITERATIONS: u32 = 3;

/// Argon2id lane count.
const PARALLELISM: u32 = 4;

/// Stretch a passphrase into a 32-byte AES-256 key with Argon2id.
///
/// The same passphrase and salt always yield the same key; a fresh random
/// salt per sealed payload keeps identical passphrases from colliding.
pub fn stretch_passphrase(passphrase: &[u8], salt: &[u8; SALT_SIZE]) -> Result<[u8; 32], CryptoError> {
    let params = Params::new(MEMORY_KIB, ITERATIONS, PARALLELISM, Some(32))
        .map_err(|e| CryptoError::KdfFailed(format!("invalid argon2 params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(passphrase, salt, &mut key)
        .map_err(|e| CryptoError::KdfFailed(format!("argon2: {e}")))?;

    Ok(key)
}

/// Generate a fresh random salt for [`stretch_passphrase`].
pub fn fresh_salt() -> [u8; SALT_SIZE] {
    crate::random::fill_random()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stretch_is_deterministic() {
        let salt = [0x5Au8; SALT_SIZE];
        let a = stretch_passphrase(b"correct horse", &salt).unwrap();
        let b = stretch_passphrase(b"correct horse", &salt).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn stretch_differs_per_passphrase() {
        let salt = [0x01u8; SALT_SIZE];
        let a = stretch_passphrase(b"alpha", &salt).unwrap();
        let b = stretch_passphrase(b"bravo", &salt).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn stretch_differs_per_salt() {
        let a = stretch_passphrase(b"same", &[0x01u8; SALT_SIZE]).unwrap();
        let b = stretch_passphrase(b"same", &[0x02u8; SALT_SIZE]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_passphrase_is_accepted() {
        let key = stretch_passphrase(b"", &[0xCCu8; SALT_SIZE]).unwrap();
        assert_eq!(key.len(), 32);
    }

    #[test]
    fn fresh_salts_differ() {
        assert_ne!(fresh_salt(), fresh_salt());
    }
}
