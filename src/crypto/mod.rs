//! Cryptography module for seqvault
//!
//! Provides the AES-256 counter transformer, chunked HMAC-SHA256 integrity,
//! Argon2id password derivation and the drive key bundle.

mod integrity;
mod kdf;
mod keys;
mod transformer;

pub use integrity::{ChunkLayout, Integrity, DEFAULT_CHUNK_SIZE};
pub use kdf::{derive_master_key, KdfParams};
pub use keys::DriveKey;
pub use transformer::CtrTransformer;

use crate::error::{Error, Result};
use rand::RngCore;

/// Size of AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of the HMAC-SHA256 key in bytes
pub const HASH_KEY_SIZE: usize = 32;

/// Size of an HMAC-SHA256 tag in bytes
pub const TAG_SIZE: usize = 32;

/// AES block size, also the counter block size
pub const BLOCK_SIZE: usize = 16;

/// Size of the per-file nonce in bytes
pub const NONCE_SIZE: usize = 8;

/// Size of salt for key derivation
pub const SALT_SIZE: usize = 32;

/// Fill a fixed-size array from the thread-local CSPRNG
pub fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut bytes = [0u8; N];
    rand::thread_rng()
        .try_fill_bytes(&mut bytes)
        .map_err(|e| Error::Internal(format!("Random generator failed: {}", e)))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes_differ() {
        let a: [u8; 16] = random_bytes().unwrap();
        let b: [u8; 16] = random_bytes().unwrap();
        assert_ne!(a, b);
    }
}
