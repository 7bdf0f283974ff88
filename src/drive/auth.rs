//! Authorization handoff between devices
//!
//! A device that owns a nonce range can hand the upper half of what it has
//! left to another device. The handoff travels as a small encrypted file:
//!
//! ```text
//! drive id (16) | recipient auth id (16) | start nonce u64 BE (8) | max nonce u64 BE (8) | reserved (16)
//! ```
//!
//! The payload is written through an authenticated stream under the drive
//! key, so only holders of the drive password can produce or read it.

use super::config::DRIVE_ID_SIZE;
use crate::error::{Error, Result};
use crate::sequence::normalize_id;

/// Length of an auth id in bytes
pub const AUTH_ID_SIZE: usize = 16;

/// Encoded payload size
pub const AUTH_CONFIG_SIZE: usize = DRIVE_ID_SIZE + AUTH_ID_SIZE + 8 + 8 + 16;

/// Chunk size of the handoff file; the payload fits in one chunk
pub const AUTH_CHUNK_SIZE: u32 = 256;

/// Range grant for one recipient device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    pub drive_id: String,
    pub auth_id: String,
    pub start_nonce: u64,
    pub max_nonce: u64,
}

fn decode_id<const N: usize>(what: &str, id: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(normalize_id(id))
        .map_err(|e| Error::Auth(format!("{} {} is not hex: {}", what, id, e)))?;
    bytes
        .try_into()
        .map_err(|_| Error::Auth(format!("{} {} must be {} bytes", what, id, N)))
}

/// Validate the textual form of an auth id
pub fn parse_auth_id(id: &str) -> Result<String> {
    decode_id::<AUTH_ID_SIZE>("auth id", id)?;
    Ok(normalize_id(id))
}

impl AuthConfig {
    pub fn new(drive_id: &str, auth_id: &str, start_nonce: u64, max_nonce: u64) -> Self {
        AuthConfig {
            drive_id: normalize_id(drive_id),
            auth_id: normalize_id(auth_id),
            start_nonce,
            max_nonce,
        }
    }

    pub fn to_bytes(&self) -> Result<[u8; AUTH_CONFIG_SIZE]> {
        let drive_id: [u8; DRIVE_ID_SIZE] = decode_id("drive id", &self.drive_id)?;
        let auth_id: [u8; AUTH_ID_SIZE] = decode_id("auth id", &self.auth_id)?;

        let mut out = [0u8; AUTH_CONFIG_SIZE];
        out[..16].copy_from_slice(&drive_id);
        out[16..32].copy_from_slice(&auth_id);
        out[32..40].copy_from_slice(&self.start_nonce.to_be_bytes());
        out[40..48].copy_from_slice(&self.max_nonce.to_be_bytes());
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != AUTH_CONFIG_SIZE {
            return Err(Error::Auth(format!(
                "authorization payload has {} bytes, expected {}",
                bytes.len(),
                AUTH_CONFIG_SIZE
            )));
        }

        let mut start = [0u8; 8];
        start.copy_from_slice(&bytes[32..40]);
        let mut max = [0u8; 8];
        max.copy_from_slice(&bytes[40..48]);

        let config = AuthConfig {
            drive_id: hex::encode(&bytes[..16]),
            auth_id: hex::encode(&bytes[16..32]),
            start_nonce: u64::from_be_bytes(start),
            max_nonce: u64::from_be_bytes(max),
        };
        if config.start_nonce >= config.max_nonce {
            return Err(Error::Auth("authorization grants an empty range".to_string()));
        }
        Ok(config)
    }

    /// Reject a grant meant for another drive or another device
    pub fn verify(&self, drive_id: &str, auth_id: &str) -> Result<()> {
        if self.drive_id != normalize_id(drive_id) {
            return Err(Error::Auth(format!(
                "authorization is for drive {}, not {}",
                self.drive_id,
                normalize_id(drive_id)
            )));
        }
        if self.auth_id != normalize_id(auth_id) {
            return Err(Error::Auth(format!(
                "authorization is for device {}, not {}",
                self.auth_id,
                normalize_id(auth_id)
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DRIVE: &str = "00112233445566778899aabbccddeeff";
    const AUTH: &str = "ffeeddccbbaa99887766554433221100";

    #[test]
    fn test_payload_layout() {
        let config = AuthConfig::new(DRIVE, &AUTH.to_uppercase(), 0x10, 0x20);
        let bytes = config.to_bytes().unwrap();

        assert_eq!(bytes.len(), 64);
        assert_eq!(bytes[0], 0x00);
        assert_eq!(bytes[16], 0xff);
        assert_eq!(bytes[39], 0x10);
        assert_eq!(bytes[47], 0x20);
        assert!(bytes[48..].iter().all(|&b| b == 0));

        assert_eq!(AuthConfig::from_bytes(&bytes).unwrap(), config);
    }

    #[test]
    fn test_verify_identity() {
        let config = AuthConfig::new(DRIVE, AUTH, 1, 2);

        config.verify(&DRIVE.to_uppercase(), AUTH).unwrap();
        assert!(matches!(config.verify(AUTH, AUTH), Err(Error::Auth(_))));
        assert!(matches!(config.verify(DRIVE, DRIVE), Err(Error::Auth(_))));
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(AuthConfig::from_bytes(&[0u8; 10]).is_err());
        // Empty range
        assert!(AuthConfig::from_bytes(&[0u8; AUTH_CONFIG_SIZE]).is_err());
        assert!(parse_auth_id("xyz").is_err());
        assert!(parse_auth_id("abcd").is_err());
        assert_eq!(parse_auth_id(&AUTH.to_uppercase()).unwrap(), AUTH);
    }
}
