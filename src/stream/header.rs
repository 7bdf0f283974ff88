//! Fixed binary header at the start of every framed stream
//!
//! ```text
//! magic "SQV" (3) | version (1) | chunk_size u32 BE (4) | nonce (8)
//! ```

use crate::crypto::{ChunkLayout, NONCE_SIZE};
use crate::error::{Error, Result};
use std::io::{Read, Seek, SeekFrom};

/// Format identifier
pub const MAGIC: &[u8; 3] = b"SQV";

/// Current stream format version
pub const VERSION: u8 = 2;

/// Encoded header length
pub const HEADER_SIZE: usize = MAGIC.len() + 1 + 4 + NONCE_SIZE;

/// Parsed stream header, immutable once written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    /// Plaintext bytes per integrity chunk, 0 when the stream carries no tags
    pub chunk_size: u32,
    pub nonce: [u8; NONCE_SIZE],
}

impl Header {
    pub fn new(chunk_size: u32, nonce: [u8; NONCE_SIZE]) -> Self {
        Header {
            version: VERSION,
            chunk_size,
            nonce,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[..3].copy_from_slice(MAGIC);
        bytes[3] = self.version;
        bytes[4..8].copy_from_slice(&self.chunk_size.to_be_bytes());
        bytes[8..].copy_from_slice(&self.nonce);
        bytes
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::InvalidHeader(format!(
                "expected {} bytes, found {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }
        if &bytes[..3] != MAGIC {
            return Err(Error::InvalidHeader("unknown format marker".to_string()));
        }
        let version = bytes[3];
        if version != VERSION {
            return Err(Error::InvalidHeader(format!(
                "unsupported version {}",
                version
            )));
        }

        let mut chunk = [0u8; 4];
        chunk.copy_from_slice(&bytes[4..8]);
        let chunk_size = u32::from_be_bytes(chunk);
        ChunkLayout::validate_chunk_size(chunk_size)
            .map_err(|_| Error::InvalidHeader(format!("invalid chunk size {}", chunk_size)))?;

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[8..HEADER_SIZE]);

        Ok(Header {
            version,
            chunk_size,
            nonce,
        })
    }

    /// Read and parse the header from the start of `source`
    pub fn read_from<R: Read + Seek>(source: &mut R) -> Result<Self> {
        source.seek(SeekFrom::Start(0))?;
        let mut bytes = [0u8; HEADER_SIZE];
        source.read_exact(&mut bytes).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                Error::InvalidHeader("stream is shorter than its header".to_string())
            }
            _ => Error::from(e),
        })?;
        Self::parse(&bytes)
    }
}
