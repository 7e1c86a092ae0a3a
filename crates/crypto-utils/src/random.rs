use rand::RngCore;
use rand_core::OsRng;

/// Fill a fixed-size array from the OS secure random source.
pub fn fill_random<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Produce `len` bytes from the OS secure random source.
pub fn random_vec(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}
