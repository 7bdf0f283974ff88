//! In-memory encryption and decryption of byte arrays
//!
//! Large inputs can be split into parts aligned to the stream's minimum part
//! size and processed on a rayon pool. Every part runs through its own
//! [`AesStream`] sharing the one header and nonce, each covering a disjoint
//! physical range of the output.

use super::aes_stream::{AesStream, StreamOptions};
use super::header::Header;
use crate::crypto::{HASH_KEY_SIZE, KEY_SIZE, NONCE_SIZE};
use crate::error::{Error, Result};
use rayon::prelude::*;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use tracing::debug;

/// Writable window into a larger output that starts at physical `origin`
struct OffsetCursor {
    origin: u64,
    inner: Cursor<Vec<u8>>,
}

impl OffsetCursor {
    fn new(origin: u64) -> Self {
        OffsetCursor {
            origin,
            inner: Cursor::new(Vec::new()),
        }
    }

    fn into_inner(self) -> Vec<u8> {
        self.inner.into_inner()
    }
}

impl Read for OffsetCursor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for OffsetCursor {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for OffsetCursor {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let local = match pos {
            SeekFrom::Start(offset) => SeekFrom::Start(offset.checked_sub(self.origin).ok_or_else(
                || io::Error::new(io::ErrorKind::InvalidInput, "seek before part window"),
            )?),
            other => other,
        };
        Ok(self.inner.seek(local)? + self.origin)
    }
}

/// Split `[0, len)` into at most `threads` ranges whose starts are multiples of `unit`
fn split_parts(len: u64, unit: u64, threads: usize) -> Vec<(u64, u64)> {
    if threads <= 1 || len < unit.saturating_mul(2) {
        return vec![(0, len)];
    }
    let per_thread = len.div_ceil(threads as u64);
    let part = per_thread.div_ceil(unit) * unit;

    let mut parts = Vec::new();
    let mut start = 0;
    while start < len {
        let end = (start + part).min(len);
        parts.push((start, end - start));
        start = end;
    }
    parts
}

fn build_pool(threads: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| Error::Internal(format!("Failed to build thread pool: {}", e)))
}

/// Encrypts byte arrays into framed streams
#[derive(Debug, Clone)]
pub struct Encryptor {
    threads: usize,
}

impl Encryptor {
    pub fn new(threads: usize) -> Self {
        Encryptor {
            threads: threads.max(1),
        }
    }

    pub fn encrypt(
        &self,
        data: &[u8],
        key: &[u8; KEY_SIZE],
        hash_key: Option<&[u8; HASH_KEY_SIZE]>,
        nonce: [u8; NONCE_SIZE],
        options: &StreamOptions,
    ) -> Result<Vec<u8>> {
        let options = options.clone().allow_overwrite(false);
        let mut output = Cursor::new(Vec::new());
        let mut stream = AesStream::create(&mut output, key, hash_key, Some(nonce), options.clone())?;

        let parts = split_parts(data.len() as u64, stream.min_part_size(), self.threads);
        if parts.len() == 1 {
            stream.write_all(data)?;
            stream.finish()?;
            return Ok(output.into_inner());
        }

        let header = *stream
            .header()
            .ok_or_else(|| Error::Internal("framed stream without header".to_string()))?;
        let layout = stream.layout();
        stream.finish()?;
        debug!("Encrypting {} bytes in {} parts", data.len(), parts.len());

        let part_options = options.allow_range_write(true);
        let pool = build_pool(self.threads)?;
        let pieces = pool.install(|| {
            parts
                .par_iter()
                .map(|&(start, len)| -> Result<Vec<u8>> {
                    let mut window = OffsetCursor::new(layout.part_origin(start)?);
                    let mut part = AesStream::resume(
                        &mut window,
                        key,
                        hash_key,
                        header,
                        part_options.clone(),
                    )?;
                    part.seek(SeekFrom::Start(start))?;
                    part.write_all(&data[start as usize..(start + len) as usize])?;
                    part.finish()?;
                    Ok(window.into_inner())
                })
                .collect::<Result<Vec<Vec<u8>>>>()
        })?;

        let mut out = output.into_inner();
        for piece in pieces {
            out.extend_from_slice(&piece);
        }
        Ok(out)
    }
}

/// Decrypts framed streams held in memory
#[derive(Debug, Clone)]
pub struct Decryptor {
    threads: usize,
}

impl Decryptor {
    pub fn new(threads: usize) -> Self {
        Decryptor {
            threads: threads.max(1),
        }
    }

    pub fn decrypt(
        &self,
        data: &[u8],
        key: &[u8; KEY_SIZE],
        hash_key: Option<&[u8; HASH_KEY_SIZE]>,
        options: &StreamOptions,
    ) -> Result<Vec<u8>> {
        let mut stream = AesStream::open(Cursor::new(data), key, hash_key, options.clone())?;
        let len = stream.len();
        let parts = split_parts(len, stream.min_part_size(), self.threads);

        if parts.len() == 1 {
            let mut out = Vec::with_capacity(len as usize);
            stream.read_to_end(&mut out)?;
            return Ok(out);
        }
        debug!("Decrypting {} bytes in {} parts", len, parts.len());

        let pool = build_pool(self.threads)?;
        let pieces = pool.install(|| {
            parts
                .par_iter()
                .map(|&(start, len)| -> Result<Vec<u8>> {
                    let mut part =
                        AesStream::open(Cursor::new(data), key, hash_key, options.clone())?;
                    part.seek(SeekFrom::Start(start))?;
                    let mut buf = vec![0u8; len as usize];
                    part.read_exact(&mut buf)?;
                    Ok(buf)
                })
                .collect::<Result<Vec<Vec<u8>>>>()
        })?;

        Ok(pieces.concat())
    }
}

/// Header of an encrypted byte array, without decrypting it
pub fn peek_header(data: &[u8]) -> Result<Header> {
    Header::parse(data)
}
