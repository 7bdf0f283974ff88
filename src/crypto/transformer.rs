//! AES-256 counter-mode transformer
//!
//! Turns the AES block cipher into a seekable stream cipher. The counter
//! block for any byte offset is a pure function of the nonce and offset:
//!
//! ```text
//! counter = nonce (8 bytes) | block_index (8 bytes, big endian)
//! block_index = offset / 16
//! ```
//!
//! No state carries over between calls, so a seek costs nothing.

use crate::crypto::{BLOCK_SIZE, KEY_SIZE, NONCE_SIZE};
use crate::error::{Error, Result};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::{Aes256, Block};

/// Number of distinct block indices that fit behind the nonce in a counter block
pub const MAX_BLOCKS: u128 = 1u128 << (8 * (BLOCK_SIZE - NONCE_SIZE));

/// Counter blocks encrypted per batch
const BATCH_BLOCKS: usize = 64;

/// Seekable AES-256-CTR keystream bound to one key and one nonce
pub struct CtrTransformer {
    cipher: Aes256,
    nonce: [u8; NONCE_SIZE],
}

impl CtrTransformer {
    pub fn new(key: &[u8; KEY_SIZE], nonce: [u8; NONCE_SIZE]) -> Self {
        CtrTransformer {
            cipher: Aes256::new(GenericArray::from_slice(key)),
            nonce,
        }
    }

    pub fn nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.nonce
    }

    /// Counter block for the given block index
    pub fn counter_block(&self, block_index: u64) -> [u8; BLOCK_SIZE] {
        let mut counter = [0u8; BLOCK_SIZE];
        counter[..NONCE_SIZE].copy_from_slice(&self.nonce);
        counter[NONCE_SIZE..].copy_from_slice(&block_index.to_be_bytes());
        counter
    }

    /// XOR the keystream into `data`, which starts at logical byte `offset`.
    ///
    /// Encryption and decryption are the same operation. Fails with
    /// `RangeExceeded` before any cipher work if the range would need a
    /// block index past the counter bound.
    pub fn apply_keystream(&self, offset: u64, data: &mut [u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let block_size = BLOCK_SIZE as u64;
        let end = offset.checked_add(data.len() as u64).ok_or_else(|| {
            Error::RangeExceeded(format!(
                "byte range at offset {} with length {} overflows",
                offset,
                data.len()
            ))
        })?;
        let last_block = (end - 1) / block_size;
        if u128::from(last_block) >= MAX_BLOCKS {
            return Err(Error::RangeExceeded(format!(
                "counter block {} exceeds the maximum block count",
                last_block
            )));
        }

        let mut block_index = offset / block_size;
        let mut skip = (offset % block_size) as usize;
        let mut pos = 0usize;
        let mut blocks: Vec<Block> = Vec::with_capacity(BATCH_BLOCKS);

        while pos < data.len() {
            let pending = skip + (data.len() - pos);
            let count = pending.div_ceil(BLOCK_SIZE).min(BATCH_BLOCKS);

            blocks.clear();
            for i in 0..count {
                let counter = self.counter_block(block_index + i as u64);
                blocks.push(Block::clone_from_slice(&counter));
            }
            self.cipher.encrypt_blocks(&mut blocks);

            for block in &blocks {
                let take = (BLOCK_SIZE - skip).min(data.len() - pos);
                for (byte, key) in data[pos..pos + take].iter_mut().zip(&block[skip..skip + take]) {
                    *byte ^= key;
                }
                pos += take;
                skip = 0;
            }
            block_index += count as u64;
        }

        Ok(())
    }
}

impl std::fmt::Debug for CtrTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CtrTransformer").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transformer() -> CtrTransformer {
        CtrTransformer::new(&[0x11; KEY_SIZE], [0, 0, 0, 0, 0, 0, 0, 9])
    }

    #[test]
    fn test_counter_block_layout() {
        let t = transformer();
        let counter = t.counter_block(0x0102);

        assert_eq!(&counter[..8], &[0, 0, 0, 0, 0, 0, 0, 9]);
        assert_eq!(&counter[8..], &[0, 0, 0, 0, 0, 0, 1, 2]);
    }

    #[test]
    fn test_roundtrip() {
        let t = transformer();
        let plaintext: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();

        let mut data = plaintext.clone();
        t.apply_keystream(0, &mut data).unwrap();
        assert_ne!(data, plaintext);

        t.apply_keystream(0, &mut data).unwrap();
        assert_eq!(data, plaintext);
    }

    #[test]
    fn test_unaligned_offset_matches_full_keystream() {
        let t = transformer();
        let mut full = vec![0u8; 300];
        t.apply_keystream(0, &mut full).unwrap();

        // Any sub-range must see exactly the same keystream bytes
        for (start, len) in [(1usize, 5usize), (15, 2), (16, 16), (37, 200), (299, 1)] {
            let mut part = vec![0u8; len];
            t.apply_keystream(start as u64, &mut part).unwrap();
            assert_eq!(part, full[start..start + len], "range {}+{}", start, len);
        }
    }

    #[test]
    fn test_different_nonce_different_keystream() {
        let a = CtrTransformer::new(&[0x11; KEY_SIZE], [0; NONCE_SIZE]);
        let b = CtrTransformer::new(&[0x11; KEY_SIZE], [0, 0, 0, 0, 0, 0, 0, 1]);

        let mut ka = vec![0u8; 64];
        let mut kb = vec![0u8; 64];
        a.apply_keystream(0, &mut ka).unwrap();
        b.apply_keystream(0, &mut kb).unwrap();
        assert_ne!(ka, kb);
    }

    #[test]
    fn test_range_overflow_rejected_before_transform() {
        let t = transformer();
        let mut data = vec![0xAAu8; 32];

        let result = t.apply_keystream(u64::MAX - 8, &mut data);
        assert!(matches!(result, Err(Error::RangeExceeded(_))));
        // Untouched on failure
        assert!(data.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_last_addressable_byte() {
        let t = transformer();
        let mut data = [0u8; 1];
        t.apply_keystream(u64::MAX - 1, &mut data).unwrap();
    }
}
