//! Drive config file
//!
//! Holds everything needed to unlock a drive with its password:
//!
//! ```text
//! magic "SQV" (3) | version (1) | salt (32)
//! | argon2 memory_kib u32 | iterations u32 | parallelism u32   (big endian)
//! | iv (8) | encrypted(drive key 32 | hash key 32 | drive id 16
//!                      | default chunk size u32) (84)
//! | hmac-sha256(encrypted) under the hash key (32)
//! ```
//!
//! The key block is encrypted with a raw counter stream under the master key.
//! A wrong password yields garbage keys, which the HMAC check catches.

use crate::crypto::{
    derive_master_key, random_bytes, ChunkLayout, DriveKey, KdfParams, HASH_KEY_SIZE, KEY_SIZE,
    NONCE_SIZE, SALT_SIZE, TAG_SIZE,
};
use crate::error::{Error, Result};
use crate::stream::{AesStream, EncryptionMode, MAGIC};
use ring::hmac;
use std::io::{Cursor, Read, Write};
use zeroize::Zeroizing;

/// Drive config format version
pub const CONFIG_VERSION: u8 = 1;

/// Length of a drive id in bytes
pub const DRIVE_ID_SIZE: usize = 16;

const KEY_BLOCK_SIZE: usize = KEY_SIZE + HASH_KEY_SIZE + DRIVE_ID_SIZE + 4;
const CHUNK_SIZE_AT: usize = KEY_SIZE + HASH_KEY_SIZE + DRIVE_ID_SIZE;
const PARAMS_SIZE: usize = 12;

/// Total encoded size
pub const CONFIG_SIZE: usize =
    MAGIC.len() + 1 + SALT_SIZE + PARAMS_SIZE + NONCE_SIZE + KEY_BLOCK_SIZE + TAG_SIZE;

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_be_bytes(buf)
}

/// Contents of an unlocked drive config
#[derive(Debug)]
pub struct Unsealed {
    pub key: DriveKey,
    pub drive_id: [u8; DRIVE_ID_SIZE],
    /// Chunk size for new files, 0 disables integrity
    pub default_chunk_size: u32,
}

/// Serialize the key bundle, drive id and default chunk size, wrapped under
/// the bundle's master key
pub fn seal(
    key: &DriveKey,
    drive_id: &[u8; DRIVE_ID_SIZE],
    default_chunk_size: u32,
) -> Result<Vec<u8>> {
    ChunkLayout::validate_chunk_size(default_chunk_size)?;
    let iv = random_bytes::<NONCE_SIZE>()?;

    let mut block = Zeroizing::new([0u8; KEY_BLOCK_SIZE]);
    block[..KEY_SIZE].copy_from_slice(key.drive_key());
    block[KEY_SIZE..KEY_SIZE + HASH_KEY_SIZE].copy_from_slice(key.hash_key());
    block[KEY_SIZE + HASH_KEY_SIZE..CHUNK_SIZE_AT].copy_from_slice(drive_id);
    block[CHUNK_SIZE_AT..].copy_from_slice(&default_chunk_size.to_be_bytes());

    let mut stream = AesStream::raw(
        Cursor::new(Vec::with_capacity(KEY_BLOCK_SIZE)),
        EncryptionMode::Encrypt,
        key.master_key(),
        iv,
    )?;
    stream.write_all(&block[..])?;
    let encrypted = stream.finish()?.into_inner();

    let mac = hmac::sign(
        &hmac::Key::new(hmac::HMAC_SHA256, key.hash_key()),
        &encrypted,
    );

    let params = key.params();
    let mut out = Vec::with_capacity(CONFIG_SIZE);
    out.extend_from_slice(MAGIC);
    out.push(CONFIG_VERSION);
    out.extend_from_slice(key.salt());
    out.extend_from_slice(&params.memory_kib.to_be_bytes());
    out.extend_from_slice(&params.iterations.to_be_bytes());
    out.extend_from_slice(&params.parallelism.to_be_bytes());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&encrypted);
    out.extend_from_slice(mac.as_ref());
    Ok(out)
}

/// Unlock a sealed config with `password`
pub fn unseal(bytes: &[u8], password: &[u8]) -> Result<Unsealed> {
    if bytes.len() != CONFIG_SIZE {
        return Err(Error::InvalidHeader(format!(
            "drive config has {} bytes, expected {}",
            bytes.len(),
            CONFIG_SIZE
        )));
    }
    if &bytes[..3] != MAGIC {
        return Err(Error::InvalidHeader("not a drive config".to_string()));
    }
    if bytes[3] != CONFIG_VERSION {
        return Err(Error::InvalidHeader(format!(
            "unsupported drive config version {}",
            bytes[3]
        )));
    }

    let mut pos = 4;
    let mut salt = [0u8; SALT_SIZE];
    salt.copy_from_slice(&bytes[pos..pos + SALT_SIZE]);
    pos += SALT_SIZE;

    let params = KdfParams {
        memory_kib: read_u32(bytes, pos),
        iterations: read_u32(bytes, pos + 4),
        parallelism: read_u32(bytes, pos + 8),
    };
    params.validate()?;
    pos += PARAMS_SIZE;

    let mut iv = [0u8; NONCE_SIZE];
    iv.copy_from_slice(&bytes[pos..pos + NONCE_SIZE]);
    pos += NONCE_SIZE;

    let encrypted = &bytes[pos..pos + KEY_BLOCK_SIZE];
    let mac = &bytes[pos + KEY_BLOCK_SIZE..];

    let master_key = derive_master_key(password, &salt, &params)?;
    let mut stream = AesStream::raw(
        Cursor::new(encrypted),
        EncryptionMode::Decrypt,
        &master_key,
        iv,
    )?;
    let mut block = Zeroizing::new([0u8; KEY_BLOCK_SIZE]);
    stream.read_exact(&mut block[..])?;

    let mut drive_key = Zeroizing::new([0u8; KEY_SIZE]);
    drive_key.copy_from_slice(&block[..KEY_SIZE]);
    let mut hash_key = Zeroizing::new([0u8; HASH_KEY_SIZE]);
    hash_key.copy_from_slice(&block[KEY_SIZE..KEY_SIZE + HASH_KEY_SIZE]);
    let mut drive_id = [0u8; DRIVE_ID_SIZE];
    drive_id.copy_from_slice(&block[KEY_SIZE + HASH_KEY_SIZE..CHUNK_SIZE_AT]);
    let default_chunk_size = read_u32(&block[..], CHUNK_SIZE_AT);

    hmac::verify(
        &hmac::Key::new(hmac::HMAC_SHA256, &hash_key[..]),
        encrypted,
        mac,
    )
    .map_err(|_| Error::WrongPassword)?;
    ChunkLayout::validate_chunk_size(default_chunk_size)?;

    Ok(Unsealed {
        key: DriveKey::from_parts(master_key, drive_key, hash_key, salt, params),
        drive_id,
        default_chunk_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_unseal() {
        let key = DriveKey::generate(b"secret", KdfParams::insecure_fast()).unwrap();
        let drive_id = [5u8; DRIVE_ID_SIZE];

        let sealed = seal(&key, &drive_id, 4096).unwrap();
        assert_eq!(sealed.len(), CONFIG_SIZE);
        assert_eq!(&sealed[..3], b"SQV");

        let unsealed = unseal(&sealed, b"secret").unwrap();
        assert_eq!(unsealed.drive_id, drive_id);
        assert_eq!(unsealed.default_chunk_size, 4096);
        assert_eq!(unsealed.key.drive_key(), key.drive_key());
        assert_eq!(unsealed.key.hash_key(), key.hash_key());
        assert_eq!(unsealed.key.salt(), key.salt());
    }

    #[test]
    fn test_invalid_chunk_size_not_sealed() {
        let key = DriveKey::generate(b"secret", KdfParams::insecure_fast()).unwrap();
        assert!(matches!(
            seal(&key, &[1u8; DRIVE_ID_SIZE], 100),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_wrong_password() {
        let key = DriveKey::generate(b"secret", KdfParams::insecure_fast()).unwrap();
        let sealed = seal(&key, &[1u8; DRIVE_ID_SIZE], 0).unwrap();

        let err = unseal(&sealed, b"not the secret").unwrap_err();
        assert!(matches!(err, Error::WrongPassword));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_truncated_config() {
        let key = DriveKey::generate(b"secret", KdfParams::insecure_fast()).unwrap();
        let sealed = seal(&key, &[1u8; DRIVE_ID_SIZE], 0).unwrap();

        assert!(matches!(
            unseal(&sealed[..CONFIG_SIZE - 1], b"secret"),
            Err(Error::InvalidHeader(_))
        ));
    }
}
