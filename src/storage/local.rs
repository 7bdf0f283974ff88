//! Local filesystem storage

use super::{ReadSeek, ReadWriteSeek, RealFile};
use crate::error::{Error, Result};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// File on the local filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    path: PathBuf,
}

impl LocalFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        LocalFile { path: path.into() }
    }

    fn parent(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn ensure_parent(&self) -> Result<()> {
        fs::create_dir_all(self.parent())?;
        Ok(())
    }

    /// Atomically replace the file with what `write` produces.
    ///
    /// The content goes to a temporary file in the same directory, is synced
    /// and then renamed over the target. If anything fails the old file stays
    /// as it was and the temporary file is removed.
    pub fn replace(&self, write: impl FnOnce(&mut File) -> Result<()>) -> Result<()> {
        self.ensure_parent()?;
        let mut tmp = NamedTempFile::new_in(self.parent())?;
        write(tmp.as_file_mut())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

impl RealFile for LocalFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn length(&self) -> Result<u64> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn open_read(&self) -> Result<Box<dyn ReadSeek>> {
        Ok(Box::new(File::open(&self.path)?))
    }

    fn open_write(&self) -> Result<Box<dyn ReadWriteSeek>> {
        self.ensure_parent()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        Ok(Box::new(file))
    }

    fn open_update(&self) -> Result<Box<dyn ReadWriteSeek>> {
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        Ok(Box::new(file))
    }

    fn delete(&self) -> Result<()> {
        fs::remove_file(&self.path)?;
        Ok(())
    }
}
