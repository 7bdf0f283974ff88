//! Seekable authenticated AES stream
//!
//! `AesStream` wraps any seekable byte store and exposes the plaintext view
//! through `std::io::{Read, Write, Seek}`. Positions are always logical
//! (plaintext) offsets; headers and tags are skipped transparently.
//!
//! Writing with integrity buffers the current chunk until it is full, the
//! stream is flushed, or `finish` is called. Dropping a writer makes a
//! best-effort attempt to store the buffered chunk; use `finish` to see
//! the error if that fails.
//!
//! Errors raised by the stream travel through `io::Error` and convert back
//! into the typed [`Error`] with `Error::from`.

use super::header::{Header, HEADER_SIZE};
use crate::crypto::{
    ChunkLayout, CtrTransformer, Integrity, BLOCK_SIZE, DEFAULT_CHUNK_SIZE, HASH_KEY_SIZE,
    KEY_SIZE, NONCE_SIZE, TAG_SIZE,
};
use crate::error::{Error, Result};
use std::io::{self, Read, Seek, SeekFrom, Write};
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Direction of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMode {
    Encrypt,
    Decrypt,
}

/// Physical framing of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    /// Header followed by ciphertext, optionally interleaved with tags
    Framed,
    /// Bare ciphertext, the caller keeps the nonce
    Raw,
}

/// Caller policy for opening a stream
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Write tags on new streams, and verify them on read
    pub integrity: bool,
    /// Chunk size for new streams with integrity, defaults to 256 KiB
    pub chunk_size: Option<u32>,
    /// Allow re-encrypting a stream that already has content
    pub allow_overwrite: bool,
    /// Allow seeking while encrypting
    pub allow_range_write: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            integrity: true,
            chunk_size: None,
            allow_overwrite: false,
            allow_range_write: false,
        }
    }
}

impl StreamOptions {
    pub fn with_integrity(mut self, integrity: bool) -> Self {
        self.integrity = integrity;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u32) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn allow_overwrite(mut self, allow: bool) -> Self {
        self.allow_overwrite = allow;
        self
    }

    pub fn allow_range_write(mut self, allow: bool) -> Self {
        self.allow_range_write = allow;
        self
    }
}

/// Plaintext of the chunk currently being written
struct PendingChunk {
    index: u64,
    data: Zeroizing<Vec<u8>>,
    dirty: bool,
}

/// Authenticated, seekable stream over a base store `S`
pub struct AesStream<S> {
    /// None once `finish` handed the base back
    base: Option<S>,
    mode: EncryptionMode,
    format: StreamFormat,
    transformer: CtrTransformer,
    integrity: Option<Integrity>,
    layout: ChunkLayout,
    header: Option<Header>,
    options: StreamOptions,
    /// Logical position
    position: u64,
    /// Logical length of what is already stored in the base
    committed: u64,
    pending: Option<PendingChunk>,
    cached: Option<(u64, Zeroizing<Vec<u8>>)>,
    /// Writes out buffered data when the stream is dropped
    on_drop: Option<fn(&mut AesStream<S>) -> Result<()>>,
}

impl<S: Read + Seek> AesStream<S> {
    /// Open a framed stream for decryption
    pub fn open(
        mut base: S,
        key: &[u8; KEY_SIZE],
        hash_key: Option<&[u8; HASH_KEY_SIZE]>,
        options: StreamOptions,
    ) -> Result<Self> {
        let header = Header::read_from(&mut base)?;
        if options.integrity && header.chunk_size == 0 {
            return Err(Error::Configuration(
                "integrity was requested but the stream was written without it".to_string(),
            ));
        }
        Self::framed(base, EncryptionMode::Decrypt, key, hash_key, header, options)
    }

    /// Headerless stream without integrity; the caller supplies the nonce in both directions
    pub fn raw(
        mut base: S,
        mode: EncryptionMode,
        key: &[u8; KEY_SIZE],
        nonce: [u8; NONCE_SIZE],
    ) -> Result<Self> {
        let physical = base.seek(SeekFrom::End(0))?;
        let layout = ChunkLayout::new(0, 0);

        Ok(AesStream {
            base: Some(base),
            mode,
            format: StreamFormat::Raw,
            transformer: CtrTransformer::new(key, nonce),
            integrity: None,
            layout,
            header: None,
            options: StreamOptions::default().with_integrity(false),
            position: 0,
            committed: layout.logical_len(physical),
            pending: None,
            cached: None,
            on_drop: None,
        })
    }

    fn framed(
        mut base: S,
        mode: EncryptionMode,
        key: &[u8; KEY_SIZE],
        hash_key: Option<&[u8; HASH_KEY_SIZE]>,
        header: Header,
        options: StreamOptions,
    ) -> Result<Self> {
        // Tags are always maintained on write; on read only when asked for
        let integrity = if header.chunk_size > 0
            && (mode == EncryptionMode::Encrypt || options.integrity)
        {
            let hash_key = hash_key.ok_or(Error::MissingKey("hash key"))?;
            Some(Integrity::new(hash_key, header.chunk_size)?)
        } else {
            None
        };

        let layout = ChunkLayout::new(HEADER_SIZE, header.chunk_size);
        let physical = base.seek(SeekFrom::End(0))?;

        Ok(AesStream {
            base: Some(base),
            mode,
            format: StreamFormat::Framed,
            transformer: CtrTransformer::new(key, header.nonce),
            integrity,
            layout,
            header: Some(header),
            options,
            position: 0,
            committed: layout.logical_len(physical),
            pending: None,
            cached: None,
            on_drop: None,
        })
    }

    /// Read, optionally verify, and decrypt one stored chunk
    fn read_chunk(&mut self, index: u64) -> Result<Zeroizing<Vec<u8>>> {
        let chunk_size = self.layout.chunk_size();
        let offset = index * chunk_size;
        let len = self.committed.saturating_sub(offset).min(chunk_size) as usize;
        let start = self.layout.chunk_start(index)?;

        let base = self.base_mut()?;
        base.seek(SeekFrom::Start(start))?;
        let mut tag = [0u8; TAG_SIZE];
        base.read_exact(&mut tag)?;
        let mut data = Zeroizing::new(vec![0u8; len]);
        base.read_exact(&mut data[..])?;

        if let Some(integrity) = &self.integrity {
            let header = match (index, &self.header) {
                (0, Some(header)) => Some(header.to_bytes()),
                _ => None,
            };
            if let Err(e) = integrity.verify(index, offset, header.as_ref().map(|h| &h[..]), &data[..], &tag) {
                warn!("Integrity check failed for chunk {} at offset {}", index, offset);
                return Err(e);
            }
        }

        self.transformer.apply_keystream(offset, &mut data[..])?;
        Ok(data)
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.mode != EncryptionMode::Decrypt {
            return Err(Error::Configuration(
                "stream is open for encryption".to_string(),
            ));
        }
        if buf.is_empty() || self.position >= self.committed {
            return Ok(0);
        }

        let available = (self.committed - self.position).min(buf.len() as u64) as usize;
        let out = &mut buf[..available];

        if !self.layout.is_chunked() {
            let start = self.layout.data_position(self.position)?;
            let base = self.base_mut()?;
            base.seek(SeekFrom::Start(start))?;
            base.read_exact(out)?;
            self.transformer.apply_keystream(self.position, out)?;
            self.position += available as u64;
            return Ok(available);
        }

        let chunk_size = self.layout.chunk_size();
        let mut filled = 0;
        while filled < available {
            let index = self.position / chunk_size;
            let within = (self.position % chunk_size) as usize;
            let data = match self.cached.take() {
                Some((cached, data)) if cached == index => data,
                _ => self.read_chunk(index)?,
            };

            let take = (data.len() - within).min(available - filled);
            out[filled..filled + take].copy_from_slice(&data[within..within + take]);
            filled += take;
            self.position += take as u64;
            self.cached = Some((index, data));
        }

        Ok(filled)
    }
}

impl<S: Read + Write + Seek> AesStream<S> {
    /// Open a framed stream for encryption.
    ///
    /// An empty base gets a new header built from `nonce` and `options`.
    /// A base with content is refused unless `allow_overwrite` is set, in
    /// which case its stored header and nonce are reused.
    pub fn create(
        mut base: S,
        key: &[u8; KEY_SIZE],
        hash_key: Option<&[u8; HASH_KEY_SIZE]>,
        nonce: Option<[u8; NONCE_SIZE]>,
        options: StreamOptions,
    ) -> Result<Self> {
        let physical = base.seek(SeekFrom::End(0))?;

        let header = if physical == 0 {
            let nonce = nonce.ok_or(Error::MissingKey("nonce"))?;
            let chunk_size = if options.integrity {
                options.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE)
            } else {
                0
            };
            if options.integrity && chunk_size == 0 {
                return Err(Error::Configuration(
                    "integrity requires a non-zero chunk size".to_string(),
                ));
            }
            ChunkLayout::validate_chunk_size(chunk_size)?;

            let header = Header::new(chunk_size, nonce);
            base.seek(SeekFrom::Start(0))?;
            base.write_all(&header.to_bytes())?;
            header
        } else {
            if !options.allow_overwrite {
                return Err(Error::OverwriteNotAllowed);
            }
            let header = Header::read_from(&mut base)?;
            if options.integrity && header.chunk_size == 0 {
                return Err(Error::Configuration(
                    "integrity was requested but the stream was written without it".to_string(),
                ));
            }
            debug!("Reusing stored header to overwrite existing stream");
            header
        };

        let mut stream = Self::framed(base, EncryptionMode::Encrypt, key, hash_key, header, options)?;
        stream.on_drop = Some(Self::flush_on_drop);
        Ok(stream)
    }

    /// Continue encrypting a stream whose header is already known.
    ///
    /// Used for writing disjoint parts of one stream in parallel: each part
    /// gets its own instance over its own window of the output, all sharing
    /// one header and nonce. The header itself is not written.
    pub fn resume(
        base: S,
        key: &[u8; KEY_SIZE],
        hash_key: Option<&[u8; HASH_KEY_SIZE]>,
        header: Header,
        options: StreamOptions,
    ) -> Result<Self> {
        let mut stream = Self::framed(base, EncryptionMode::Encrypt, key, hash_key, header, options)?;
        stream.on_drop = Some(Self::flush_on_drop);
        Ok(stream)
    }

    fn write_bytes(&mut self, buf: &[u8]) -> Result<usize> {
        if self.mode != EncryptionMode::Encrypt {
            return Err(Error::Configuration(
                "stream is open for decryption".to_string(),
            ));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        if self.position < self.committed
            && !(self.options.allow_overwrite || self.options.allow_range_write)
        {
            return Err(Error::RangeWriteNotAllowed {
                offset: self.position,
            });
        }

        if self.integrity.is_some() {
            self.write_chunked(buf)
        } else {
            self.write_direct(buf)
        }
    }

    fn write_direct(&mut self, buf: &[u8]) -> Result<usize> {
        let mut data = Zeroizing::new(buf.to_vec());
        self.transformer.apply_keystream(self.position, &mut data[..])?;

        let start = self.layout.data_position(self.position)?;
        let base = self.base_mut()?;
        base.seek(SeekFrom::Start(start))?;
        base.write_all(&data[..])?;

        self.position += data.len() as u64;
        self.committed = self.committed.max(self.position);
        Ok(data.len())
    }

    fn write_chunked(&mut self, buf: &[u8]) -> Result<usize> {
        let chunk_size = self.layout.chunk_size();
        let mut written = 0;

        while written < buf.len() {
            let index = self.position / chunk_size;
            let within = (self.position % chunk_size) as usize;

            let mut pending = match self.pending.take() {
                Some(pending) if pending.index == index => pending,
                previous => {
                    if let Some(mut previous) = previous {
                        // Keep the chunk buffered so a later flush can retry it
                        if let Err(e) = self.emit(&mut previous) {
                            self.pending = Some(previous);
                            return Err(e);
                        }
                    }
                    // Overlay onto whatever the chunk already holds
                    let data = if index * chunk_size < self.committed {
                        self.read_chunk(index)?
                    } else {
                        Zeroizing::new(Vec::new())
                    };
                    PendingChunk {
                        index,
                        data,
                        dirty: false,
                    }
                }
            };

            let take = (chunk_size as usize - within).min(buf.len() - written);
            if pending.data.len() < within + take {
                pending.data.resize(within + take, 0);
            }
            pending.data[within..within + take].copy_from_slice(&buf[written..written + take]);
            pending.dirty = true;
            written += take;
            self.position += take as u64;

            if pending.data.len() as u64 == chunk_size {
                if let Err(e) = self.emit(&mut pending) {
                    self.pending = Some(pending);
                    return Err(e);
                }
            } else {
                self.pending = Some(pending);
            }
        }

        Ok(written)
    }

    /// Encrypt, tag and store a pending chunk
    fn emit(&mut self, chunk: &mut PendingChunk) -> Result<()> {
        if !chunk.dirty {
            return Ok(());
        }
        let integrity = self
            .integrity
            .as_ref()
            .ok_or_else(|| Error::Internal("chunk buffered without integrity".to_string()))?;

        let offset = chunk.index * self.layout.chunk_size();
        let mut ciphertext = chunk.data.to_vec();
        self.transformer.apply_keystream(offset, &mut ciphertext)?;

        let header = match (chunk.index, &self.header) {
            (0, Some(header)) => Some(header.to_bytes()),
            _ => None,
        };
        let tag = integrity.tag(header.as_ref().map(|h| &h[..]), &ciphertext);

        let start = self.layout.chunk_start(chunk.index)?;
        let base = self.base_mut()?;
        base.seek(SeekFrom::Start(start))?;
        base.write_all(&tag)?;
        base.write_all(&ciphertext)?;

        self.committed = self.committed.max(offset + chunk.data.len() as u64);
        self.cached = None;
        chunk.dirty = false;
        Ok(())
    }

    fn flush_pending(&mut self) -> Result<()> {
        if let Some(mut pending) = self.pending.take() {
            let result = self.emit(&mut pending);
            self.pending = Some(pending);
            result?;
        }
        Ok(())
    }

    fn flush_on_drop(&mut self) -> Result<()> {
        self.flush_pending()?;
        self.base_mut()?.flush()?;
        Ok(())
    }

    /// Write out the buffered chunk and return the base store
    pub fn finish(mut self) -> Result<S> {
        if self.mode == EncryptionMode::Encrypt {
            self.flush_pending()?;
            self.base_mut()?.flush()?;
        }
        self.base
            .take()
            .ok_or_else(|| Error::Internal("stream already finished".to_string()))
    }
}

impl<S> AesStream<S> {
    fn base_mut(&mut self) -> Result<&mut S> {
        self.base
            .as_mut()
            .ok_or_else(|| Error::Internal("stream already finished".to_string()))
    }

    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    pub fn nonce(&self) -> &[u8; NONCE_SIZE] {
        self.transformer.nonce()
    }

    pub fn layout(&self) -> ChunkLayout {
        self.layout
    }

    /// Chunk size in the header, 0 when the stream carries no tags
    pub fn chunk_size(&self) -> u32 {
        self.header.map_or(0, |h| h.chunk_size)
    }

    /// Whether tags are being verified or written by this instance
    pub fn has_integrity(&self) -> bool {
        self.integrity.is_some()
    }

    /// Smallest unit a large stream can be split into for independent parts
    pub fn min_part_size(&self) -> u64 {
        if self.layout.is_chunked() {
            self.layout.chunk_size()
        } else {
            BLOCK_SIZE as u64
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Logical length including any buffered chunk
    pub fn len(&self) -> u64 {
        let pending_end = self
            .pending
            .as_ref()
            .map_or(0, |p| p.index * self.layout.chunk_size() + p.data.len() as u64);
        self.committed.max(pending_end)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_ref(&self) -> Option<&S> {
        self.base.as_ref()
    }
}

impl<S: Read + Seek> Read for AesStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_bytes(buf)?)
    }
}

impl<S: Read + Write + Seek> Write for AesStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.write_bytes(buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_pending()?;
        self.base_mut()?.flush()
    }
}

impl<S> Drop for AesStream<S> {
    fn drop(&mut self) {
        if self.base.is_none() {
            return;
        }
        if let Some(flush) = self.on_drop {
            if let Err(e) = flush(self) {
                warn!("Failed to store buffered chunk of dropped stream: {}", e);
            }
        }
    }
}

impl<S> Seek for AesStream<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => self.len().checked_add_signed(delta),
        }
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            )
        })?;

        if self.mode == EncryptionMode::Encrypt
            && target != self.position
            && !self.options.allow_range_write
        {
            return Err(Error::RangeWriteNotAllowed { offset: target }.into());
        }

        self.position = target;
        Ok(target)
    }
}

impl<S> std::fmt::Debug for AesStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesStream")
            .field("mode", &self.mode)
            .field("format", &self.format)
            .field("chunk_size", &self.chunk_size())
            .field("position", &self.position)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
