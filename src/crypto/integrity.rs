//! Chunked HMAC-SHA256 integrity
//!
//! Encrypted data is split into chunks of `chunk_size` plaintext bytes. Each
//! chunk is stored behind its tag:
//!
//! ```text
//! [header][tag 0][ciphertext 0][tag 1][ciphertext 1]...[tag n][ciphertext n (short)]
//! ```
//!
//! The tag of chunk 0 also covers the header, so the header cannot be swapped
//! between files without detection.

use crate::crypto::{BLOCK_SIZE, HASH_KEY_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use ring::hmac;

/// Default chunk size for new streams (256 KiB)
pub const DEFAULT_CHUNK_SIZE: u32 = 256 * 1024;

/// Offset arithmetic between logical (plaintext) and physical (stored) positions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    header_len: u64,
    /// 0 means no tags are interleaved
    chunk_size: u64,
}

impl ChunkLayout {
    pub fn new(header_len: usize, chunk_size: u32) -> Self {
        ChunkLayout {
            header_len: header_len as u64,
            chunk_size: u64::from(chunk_size),
        }
    }

    /// A chunk size is valid when it is 0 or a positive multiple of the block size
    pub fn validate_chunk_size(chunk_size: u32) -> Result<()> {
        if chunk_size as usize % BLOCK_SIZE != 0 {
            return Err(Error::Configuration(format!(
                "chunk size {} is not a multiple of {}",
                chunk_size, BLOCK_SIZE
            )));
        }
        Ok(())
    }

    pub fn header_len(&self) -> u64 {
        self.header_len
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn is_chunked(&self) -> bool {
        self.chunk_size > 0
    }

    /// Physical bytes taken by one full chunk including its tag
    fn span(&self) -> u64 {
        self.chunk_size + TAG_SIZE as u64
    }

    /// Physical position of the tag that opens chunk `index`
    pub fn chunk_start(&self, index: u64) -> Result<u64> {
        index
            .checked_mul(self.span())
            .and_then(|body| body.checked_add(self.header_len))
            .ok_or_else(|| Error::RangeExceeded(format!("chunk {} is not addressable", index)))
    }

    /// Physical position of the ciphertext byte for logical offset `offset`
    pub fn data_position(&self, offset: u64) -> Result<u64> {
        if !self.is_chunked() {
            return offset.checked_add(self.header_len).ok_or_else(|| {
                Error::RangeExceeded(format!("offset {} is not addressable", offset))
            });
        }
        let index = offset / self.chunk_size;
        let within = offset % self.chunk_size;
        self.chunk_start(index)?
            .checked_add(TAG_SIZE as u64 + within)
            .ok_or_else(|| Error::RangeExceeded(format!("offset {} is not addressable", offset)))
    }

    /// Physical position where an independently written part starting at
    /// logical `offset` begins. For chunked layouts the offset must be chunk aligned.
    pub fn part_origin(&self, offset: u64) -> Result<u64> {
        if !self.is_chunked() {
            return self.data_position(offset);
        }
        if offset % self.chunk_size != 0 {
            return Err(Error::Configuration(format!(
                "part offset {} is not aligned to chunk size {}",
                offset, self.chunk_size
            )));
        }
        self.chunk_start(offset / self.chunk_size)
    }

    /// Logical length of a stream whose stored form is `physical_len` bytes
    pub fn logical_len(&self, physical_len: u64) -> u64 {
        let body = physical_len.saturating_sub(self.header_len);
        if !self.is_chunked() {
            return body;
        }
        let full = body / self.span();
        let rest = body % self.span();
        full * self.chunk_size + rest.saturating_sub(TAG_SIZE as u64)
    }

    /// Stored length of a stream holding `logical_len` plaintext bytes
    pub fn physical_len(&self, logical_len: u64) -> Result<u64> {
        if logical_len == 0 {
            return Ok(self.header_len);
        }
        if !self.is_chunked() {
            return self.data_position(logical_len);
        }
        let chunks = logical_len.div_ceil(self.chunk_size);
        chunks
            .checked_mul(TAG_SIZE as u64)
            .and_then(|tags| tags.checked_add(logical_len))
            .and_then(|body| body.checked_add(self.header_len))
            .ok_or_else(|| Error::RangeExceeded(format!("length {} is not addressable", logical_len)))
    }
}

/// Tag computation and verification for one stream
pub struct Integrity {
    key: hmac::Key,
    chunk_size: u32,
}

impl Integrity {
    pub fn new(hash_key: &[u8; HASH_KEY_SIZE], chunk_size: u32) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::Configuration(
                "integrity requires a non-zero chunk size".to_string(),
            ));
        }
        ChunkLayout::validate_chunk_size(chunk_size)?;

        Ok(Integrity {
            key: hmac::Key::new(hmac::HMAC_SHA256, hash_key),
            chunk_size,
        })
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Tag over `header || ciphertext` (header only for chunk 0)
    pub fn tag(&self, header: Option<&[u8]>, ciphertext: &[u8]) -> [u8; TAG_SIZE] {
        let mut ctx = hmac::Context::with_key(&self.key);
        if let Some(header) = header {
            ctx.update(header);
        }
        ctx.update(ciphertext);

        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(ctx.sign().as_ref());
        tag
    }

    /// Constant-time check of a stored tag
    pub fn verify(
        &self,
        chunk: u64,
        offset: u64,
        header: Option<&[u8]>,
        ciphertext: &[u8],
        tag: &[u8],
    ) -> Result<()> {
        let result = match header {
            Some(header) => {
                let mut signed = Vec::with_capacity(header.len() + ciphertext.len());
                signed.extend_from_slice(header);
                signed.extend_from_slice(ciphertext);
                hmac::verify(&self.key, &signed, tag)
            }
            None => hmac::verify(&self.key, ciphertext, tag),
        };
        result.map_err(|_| Error::Integrity { chunk, offset })
    }
}

impl std::fmt::Debug for Integrity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Integrity")
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_size_validation() {
        assert!(ChunkLayout::validate_chunk_size(0).is_ok());
        assert!(ChunkLayout::validate_chunk_size(16).is_ok());
        assert!(ChunkLayout::validate_chunk_size(DEFAULT_CHUNK_SIZE).is_ok());
        assert!(matches!(
            ChunkLayout::validate_chunk_size(100),
            Err(Error::Configuration(_))
        ));
        assert!(Integrity::new(&[0u8; HASH_KEY_SIZE], 0).is_err());
    }

    #[test]
    fn test_data_position() {
        let layout = ChunkLayout::new(16, 64);

        assert_eq!(layout.data_position(0).unwrap(), 16 + 32);
        assert_eq!(layout.data_position(63).unwrap(), 16 + 32 + 63);
        assert_eq!(layout.data_position(64).unwrap(), 16 + 96 + 32);
        assert_eq!(layout.chunk_start(2).unwrap(), 16 + 2 * 96);

        let plain = ChunkLayout::new(16, 0);
        assert_eq!(plain.data_position(100).unwrap(), 116);
    }

    #[test]
    fn test_length_mapping() {
        let layout = ChunkLayout::new(16, 64);

        for logical in [0u64, 1, 63, 64, 65, 128, 1000] {
            let physical = layout.physical_len(logical).unwrap();
            assert_eq!(layout.logical_len(physical), logical, "logical {}", logical);
        }

        // A dangling tag without data counts as empty
        assert_eq!(layout.logical_len(16 + 20), 0);
        assert_eq!(layout.logical_len(16 + 96 + 32), 64);
    }

    #[test]
    fn test_part_origin_requires_alignment() {
        let layout = ChunkLayout::new(16, 64);
        assert_eq!(layout.part_origin(128).unwrap(), 16 + 2 * 96);
        assert!(layout.part_origin(100).is_err());
    }

    #[test]
    fn test_unaddressable_offset() {
        let layout = ChunkLayout::new(16, 64);
        assert!(matches!(
            layout.data_position(u64::MAX),
            Err(Error::RangeExceeded(_))
        ));
    }

    #[test]
    fn test_tag_verify() {
        let integrity = Integrity::new(&[7u8; HASH_KEY_SIZE], 64).unwrap();
        let header = [1u8; 16];
        let ciphertext = [9u8; 64];

        let tag = integrity.tag(Some(&header), &ciphertext);
        integrity
            .verify(0, 0, Some(&header), &ciphertext, &tag)
            .unwrap();

        // Header is bound into chunk 0
        assert!(integrity.verify(0, 0, None, &ciphertext, &tag).is_err());

        let mut tampered = ciphertext;
        tampered[5] ^= 0x01;
        let err = integrity
            .verify(0, 0, Some(&header), &tampered, &tag)
            .unwrap_err();
        assert!(matches!(err, Error::Integrity { chunk: 0, offset: 0 }));
    }

    #[test]
    fn test_different_keys_different_tags() {
        let a = Integrity::new(&[1u8; HASH_KEY_SIZE], 16).unwrap();
        let b = Integrity::new(&[2u8; HASH_KEY_SIZE], 16).unwrap();
        assert_ne!(a.tag(None, b"data"), b.tag(None, b"data"));
    }
}
