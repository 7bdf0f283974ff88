//! Key material for an unlocked drive
//!
//! A drive is protected by a hierarchy of keys:
//! - Master Key: derived from the user password, only wraps the keys below
//! - Drive Key: AES-256 key for all file contents
//! - Hash Key: HMAC-SHA256 key for chunk integrity tags
//!
//! All key bytes are zeroed when the bundle is dropped.

use crate::crypto::{derive_master_key, random_bytes, KdfParams, HASH_KEY_SIZE, KEY_SIZE, SALT_SIZE};
use crate::error::Result;
use zeroize::Zeroizing;

/// Complete key bundle of an unlocked drive
pub struct DriveKey {
    /// Password-derived key wrapping the drive and hash keys
    master_key: Zeroizing<[u8; KEY_SIZE]>,
    /// Bulk content encryption key
    drive_key: Zeroizing<[u8; KEY_SIZE]>,
    /// Integrity key
    hash_key: Zeroizing<[u8; HASH_KEY_SIZE]>,
    /// Salt used to derive the master key
    salt: [u8; SALT_SIZE],
    /// KDF cost parameters used with the salt
    params: KdfParams,
}

impl DriveKey {
    /// Generate fresh drive and hash keys protected by a new password
    pub fn generate(password: &[u8], params: KdfParams) -> Result<Self> {
        let drive_key = Zeroizing::new(random_bytes::<KEY_SIZE>()?);
        let hash_key = Zeroizing::new(random_bytes::<HASH_KEY_SIZE>()?);
        let salt = random_bytes::<SALT_SIZE>()?;
        let master_key = derive_master_key(password, &salt, &params)?;

        Ok(DriveKey {
            master_key,
            drive_key,
            hash_key,
            salt,
            params,
        })
    }

    /// Assemble a bundle from unwrapped key material
    pub fn from_parts(
        master_key: Zeroizing<[u8; KEY_SIZE]>,
        drive_key: Zeroizing<[u8; KEY_SIZE]>,
        hash_key: Zeroizing<[u8; HASH_KEY_SIZE]>,
        salt: [u8; SALT_SIZE],
        params: KdfParams,
    ) -> Self {
        DriveKey {
            master_key,
            drive_key,
            hash_key,
            salt,
            params,
        }
    }

    /// Keep the drive and hash keys but wrap them under a new password and salt
    pub fn rewrap(&self, password: &[u8], params: KdfParams) -> Result<Self> {
        let salt = random_bytes::<SALT_SIZE>()?;
        let master_key = derive_master_key(password, &salt, &params)?;

        Ok(DriveKey {
            master_key,
            drive_key: self.drive_key.clone(),
            hash_key: self.hash_key.clone(),
            salt,
            params,
        })
    }

    pub fn master_key(&self) -> &[u8; KEY_SIZE] {
        &self.master_key
    }

    pub fn drive_key(&self) -> &[u8; KEY_SIZE] {
        &self.drive_key
    }

    pub fn hash_key(&self) -> &[u8; HASH_KEY_SIZE] {
        &self.hash_key
    }

    pub fn salt(&self) -> &[u8; SALT_SIZE] {
        &self.salt
    }

    pub fn params(&self) -> &KdfParams {
        &self.params
    }
}

impl std::fmt::Debug for DriveKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveKey")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_distinct_keys() {
        let key = DriveKey::generate(b"password", KdfParams::insecure_fast()).unwrap();

        assert_ne!(key.drive_key(), key.hash_key());
        assert_ne!(key.drive_key(), key.master_key());
    }

    #[test]
    fn test_rewrap_keeps_content_keys() {
        let key = DriveKey::generate(b"old", KdfParams::insecure_fast()).unwrap();
        let rewrapped = key.rewrap(b"new", KdfParams::insecure_fast()).unwrap();

        assert_eq!(key.drive_key(), rewrapped.drive_key());
        assert_eq!(key.hash_key(), rewrapped.hash_key());
        assert_ne!(key.salt(), rewrapped.salt());
        assert_ne!(key.master_key(), rewrapped.master_key());
    }

    #[test]
    fn test_debug_hides_key_bytes() {
        let key = DriveKey::generate(b"password", KdfParams::insecure_fast()).unwrap();
        let printed = format!("{:?}", key);

        assert!(!printed.contains(&format!("{:?}", key.drive_key())));
    }
}
