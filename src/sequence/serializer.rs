//! JSON persistence format for sequences
//!
//! ```json
//! {
//!   "<driveId>:<authId>": {
//!     "driveId": "...", "authId": "...", "status": "Active",
//!     "nextNonce": "AAAAAAAAAAE=", "maxNonce": "//////////8="
//!   }
//! }
//! ```
//!
//! Nonces are base64 of their 8 big-endian bytes.

use super::{NonceSequence, SequenceStatus};
use crate::crypto::NONCE_SIZE;
use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// All sequences known to a device, keyed by `driveId:authId`
pub type SequenceMap = BTreeMap<String, NonceSequence>;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SequenceRecord {
    drive_id: String,
    auth_id: String,
    status: SequenceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    next_nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_nonce: Option<String>,
}

fn encode_nonce(nonce: u64) -> String {
    STANDARD.encode(nonce.to_be_bytes())
}

fn decode_nonce(key: &str, encoded: &str) -> Result<u64> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| Error::CorruptSequence(format!("{}: bad nonce encoding: {}", key, e)))?;
    let bytes: [u8; NONCE_SIZE] = bytes.try_into().map_err(|_| {
        Error::CorruptSequence(format!("{}: nonce is not {} bytes", key, NONCE_SIZE))
    })?;
    Ok(u64::from_be_bytes(bytes))
}

pub fn serialize(sequences: &SequenceMap) -> Result<String> {
    let records: BTreeMap<&String, SequenceRecord> = sequences
        .iter()
        .map(|(key, seq)| {
            let record = SequenceRecord {
                drive_id: seq.drive_id.clone(),
                auth_id: seq.auth_id.clone(),
                status: seq.status,
                next_nonce: seq.next_nonce.map(encode_nonce),
                max_nonce: seq.max_nonce.map(encode_nonce),
            };
            (key, record)
        })
        .collect();

    Ok(serde_json::to_string_pretty(&records)?)
}

pub fn deserialize(contents: &str) -> Result<SequenceMap> {
    if contents.trim().is_empty() {
        return Ok(SequenceMap::new());
    }

    let records: BTreeMap<String, SequenceRecord> = serde_json::from_str(contents)
        .map_err(|e| Error::CorruptSequence(format!("unreadable sequence file: {}", e)))?;

    let mut sequences = SequenceMap::new();
    for (key, record) in records {
        let next_nonce = record
            .next_nonce
            .as_deref()
            .map(|n| decode_nonce(&key, n))
            .transpose()?;
        let max_nonce = record
            .max_nonce
            .as_deref()
            .map(|n| decode_nonce(&key, n))
            .transpose()?;

        let mut sequence = NonceSequence::new(&record.drive_id, &record.auth_id);
        sequence.status = record.status;
        sequence.next_nonce = next_nonce;
        sequence.max_nonce = max_nonce;

        if sequence.key() != key.to_ascii_lowercase() {
            return Err(Error::CorruptSequence(format!(
                "record {} does not match its key",
                key
            )));
        }
        sequences.insert(sequence.key(), sequence);
    }
    Ok(sequences)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_encoding() {
        assert_eq!(encode_nonce(1), "AAAAAAAAAAE=");
        assert_eq!(decode_nonce("k", "AAAAAAAAAAE=").unwrap(), 1);
        assert!(matches!(
            decode_nonce("k", "AAAA"),
            Err(Error::CorruptSequence(_))
        ));
    }

    #[test]
    fn test_serialize_layout() {
        let mut seq = NonceSequence::new("d1", "a1");
        seq.status = SequenceStatus::Active;
        seq.next_nonce = Some(5);
        seq.max_nonce = Some(u64::MAX);

        let mut map = SequenceMap::new();
        map.insert(seq.key(), seq.clone());
        let json = serialize(&map).unwrap();

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let record = &value["d1:a1"];
        assert_eq!(record["driveId"], "d1");
        assert_eq!(record["authId"], "a1");
        assert_eq!(record["status"], "Active");
        assert_eq!(record["maxNonce"], "//////////8=");

        let back = deserialize(&json).unwrap();
        assert_eq!(back.get("d1:a1"), Some(&seq));
    }

    #[test]
    fn test_new_sequence_omits_nonces() {
        let seq = NonceSequence::new("d1", "a1");
        let mut map = SequenceMap::new();
        map.insert(seq.key(), seq);

        let json = serialize(&map).unwrap();
        assert!(!json.contains("nextNonce"));
        assert_eq!(deserialize(&json).unwrap()["d1:a1"].next_nonce, None);
    }

    #[test]
    fn test_garbage_is_corrupt() {
        assert!(matches!(
            deserialize("{ not json"),
            Err(Error::CorruptSequence(_))
        ));
        assert!(deserialize("").unwrap().is_empty());
    }
}
