//! Real storage behind a drive
//!
//! The encrypted core only needs random access to whole files. Anything that
//! can provide the operations of [`RealFile`] can back a drive.

mod local;

pub use local::LocalFile;

use crate::error::Result;
use std::io::{Read, Seek, Write};
use std::path::Path;

/// Readable and seekable handle
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Readable, writable and seekable handle
pub trait ReadWriteSeek: Read + Write + Seek + Send {}

impl<T: Read + Write + Seek + Send> ReadWriteSeek for T {}

/// A file on the real storage
pub trait RealFile: Send + Sync {
    fn path(&self) -> &Path;

    fn exists(&self) -> bool;

    /// Size in bytes, 0 if the file does not exist
    fn length(&self) -> Result<u64>;

    fn open_read(&self) -> Result<Box<dyn ReadSeek>>;

    /// Create or truncate, then open for reading and writing
    fn open_write(&self) -> Result<Box<dyn ReadWriteSeek>>;

    /// Open an existing file for reading and writing without truncating
    fn open_update(&self) -> Result<Box<dyn ReadWriteSeek>>;

    fn delete(&self) -> Result<()>;
}
