//! Nonce sequencing
//!
//! Every file of a drive is encrypted under the same drive key, so each file
//! needs a nonce that no other file, on any device, has ever used. A device
//! owns a half-open range `[next_nonce, max_nonce)` of the drive's nonce space,
//! recorded in a persisted sequence:
//!
//! ```text
//! New ──initialize──► Active ──revoke──► Revoked
//! ```
//!
//! At most one unrevoked sequence may exist per drive. Finding two is treated
//! as corrupted state and every operation on that drive fails.

mod file;
mod serializer;

pub use file::FileSequencer;
pub use serializer::{deserialize, serialize, SequenceMap};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceStatus {
    /// Known to this device but no range assigned yet
    New,
    /// Owns a nonce range and may issue nonces
    Active,
    /// Permanently retired
    Revoked,
}

/// Persisted nonce allocation record for one (drive, device) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceSequence {
    pub drive_id: String,
    pub auth_id: String,
    pub status: SequenceStatus,
    /// Next nonce to hand out
    pub next_nonce: Option<u64>,
    /// Exclusive upper bound of the range
    pub max_nonce: Option<u64>,
}

impl NonceSequence {
    pub fn new(drive_id: &str, auth_id: &str) -> Self {
        NonceSequence {
            drive_id: normalize_id(drive_id),
            auth_id: normalize_id(auth_id),
            status: SequenceStatus::New,
            next_nonce: None,
            max_nonce: None,
        }
    }

    /// Key of this record in the sequence map
    pub fn key(&self) -> String {
        sequence_key(&self.drive_id, &self.auth_id)
    }

    pub fn is_unrevoked(&self) -> bool {
        self.status != SequenceStatus::Revoked
    }

    /// Nonces still available, 0 when not initialized
    pub fn remaining(&self) -> u64 {
        match (self.next_nonce, self.max_nonce) {
            (Some(next), Some(max)) => max.saturating_sub(next),
            _ => 0,
        }
    }
}

/// Ids compare case-insensitively; they are stored lowercase
pub fn normalize_id(id: &str) -> String {
    id.trim().to_ascii_lowercase()
}

pub fn sequence_key(drive_id: &str, auth_id: &str) -> String {
    format!("{}:{}", normalize_id(drive_id), normalize_id(auth_id))
}

/// Pivot that splits `[next, max)` between a granting and a receiving device.
///
/// The grantor keeps `[next, pivot)`, the recipient gets `[pivot, max)`.
/// Both halves are non-empty.
pub fn split_range(next: u64, max: u64) -> Result<u64> {
    let remaining = max.saturating_sub(next);
    if remaining < 2 {
        return Err(Error::RangeExceeded(format!(
            "{} nonces left, cannot split the range",
            remaining
        )));
    }
    Ok(next + remaining / 2)
}

/// Persisted nonce allocator.
///
/// Implementations must make every operation atomic with respect to other
/// callers and durable before returning.
pub trait NonceSequencer: Send + Sync {
    /// Register a `New` sequence; fails if the drive already has an unrevoked one
    fn create_sequence(&self, drive_id: &str, auth_id: &str) -> Result<()>;

    /// Assign `[start_nonce, max_nonce)` to the `New` sequence and activate it
    fn initialize_sequence(
        &self,
        drive_id: &str,
        auth_id: &str,
        start_nonce: u64,
        max_nonce: u64,
    ) -> Result<()>;

    /// Hand out the next nonce and persist the advanced counter
    fn next_nonce(&self, drive_id: &str) -> Result<u64>;

    /// Lower the exclusive bound of the range; raising it is rejected
    fn set_max_nonce(&self, drive_id: &str, auth_id: &str, max_nonce: u64) -> Result<()>;

    fn revoke_sequence(&self, drive_id: &str) -> Result<()>;

    /// The unrevoked sequence of a drive, if any
    fn get_sequence(&self, drive_id: &str) -> Result<Option<NonceSequence>>;

    /// Give away the upper half of this device's remaining range.
    ///
    /// Returns the `[start, max)` range now owned by the recipient.
    fn split_sequence(&self, drive_id: &str) -> Result<(u64, u64)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_range() {
        assert_eq!(split_range(0, u64::MAX).unwrap(), u64::MAX / 2);
        assert_eq!(split_range(1, 5).unwrap(), 3);
        assert_eq!(split_range(4, 6).unwrap(), 5);
        assert!(matches!(split_range(4, 5), Err(Error::RangeExceeded(_))));
        assert!(matches!(split_range(5, 5), Err(Error::RangeExceeded(_))));
    }

    #[test]
    fn test_ids_normalized() {
        let seq = NonceSequence::new("ABCD", "Ef01");
        assert_eq!(seq.key(), "abcd:ef01");
        assert_eq!(seq.remaining(), 0);
        assert!(seq.is_unrevoked());
    }
}
