//! File-backed nonce sequencer
//!
//! The sequence file is the single source of truth. Every operation reads it
//! fresh, mutates, and atomically replaces it before returning, all while
//! holding an in-process mutex and an exclusive OS lock on `<path>.lock`.
//! The OS lock serializes separate sequencer instances and processes that
//! share one sequence file.

use super::{
    deserialize, serialize, split_range, NonceSequence, NonceSequencer, SequenceMap,
    SequenceStatus,
};
use crate::error::{Error, Result};
use crate::storage::LocalFile;
use fs2::FileExt;
use parking_lot::{Mutex, MutexGuard};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Sequencer persisting all sequences of this device in one JSON file
pub struct FileSequencer {
    path: PathBuf,
    lock_path: PathBuf,
    lock: Mutex<()>,
}

/// Held while the sequence file is read or rewritten
struct FileLock<'a> {
    file: File,
    _guard: MutexGuard<'a, ()>,
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release sequence file lock: {}", e);
        }
    }
}

/// The single unrevoked sequence of a drive
fn find_unrevoked<'a>(
    sequences: &'a mut SequenceMap,
    drive_id: &str,
) -> Result<Option<&'a mut NonceSequence>> {
    let drive_id = super::normalize_id(drive_id);
    let mut found: Option<&'a mut NonceSequence> = None;

    for sequence in sequences.values_mut() {
        if sequence.drive_id != drive_id || !sequence.is_unrevoked() {
            continue;
        }
        if found.is_some() {
            warn!("Drive {} has more than one unrevoked sequence", drive_id);
            return Err(Error::CorruptSequence(format!(
                "drive {} has more than one unrevoked sequence",
                drive_id
            )));
        }
        found = Some(sequence);
    }
    Ok(found)
}

impl FileSequencer {
    /// Open or create the sequence file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut lock_path = OsString::from(path.as_os_str());
        lock_path.push(".lock");

        let sequencer = FileSequencer {
            path,
            lock_path: PathBuf::from(lock_path),
            lock: Mutex::new(()),
        };
        {
            let _lock = sequencer.acquire()?;
            if !sequencer.path.exists() {
                sequencer.store(&SequenceMap::new())?;
                debug!("Created sequence file {:?}", sequencer.path);
            }
        }
        Ok(sequencer)
    }

    /// Take the in-process mutex, then block on the exclusive file lock
    fn acquire(&self) -> Result<FileLock<'_>> {
        let guard = self.lock.lock();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)?;
        file.lock_exclusive()?;
        Ok(FileLock {
            file,
            _guard: guard,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<SequenceMap> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => deserialize(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SequenceMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write to a temporary file next to the target and rename it over
    fn store(&self, sequences: &SequenceMap) -> Result<()> {
        let contents = serialize(sequences)?;
        LocalFile::new(&self.path).replace(|file| Ok(file.write_all(contents.as_bytes())?))
    }

    /// Read-modify-write under the lock. Nothing is stored if `f` fails.
    fn update<T>(&self, f: impl FnOnce(&mut SequenceMap) -> Result<T>) -> Result<T> {
        let _lock = self.acquire()?;
        let mut sequences = self.load()?;
        let out = f(&mut sequences)?;
        self.store(&sequences)?;
        Ok(out)
    }

    /// All records in the file, including revoked ones
    pub fn sequences(&self) -> Result<SequenceMap> {
        let _lock = self.acquire()?;
        self.load()
    }
}

impl NonceSequencer for FileSequencer {
    fn create_sequence(&self, drive_id: &str, auth_id: &str) -> Result<()> {
        self.update(|sequences| {
            if find_unrevoked(sequences, drive_id)?.is_some() {
                return Err(Error::sequence(drive_id, "sequence already exists"));
            }
            let sequence = NonceSequence::new(drive_id, auth_id);
            sequences.insert(sequence.key(), sequence);
            Ok(())
        })?;
        info!("Created sequence for drive {}", drive_id);
        Ok(())
    }

    fn initialize_sequence(
        &self,
        drive_id: &str,
        auth_id: &str,
        start_nonce: u64,
        max_nonce: u64,
    ) -> Result<()> {
        if start_nonce >= max_nonce {
            return Err(Error::sequence(drive_id, "nonce range is empty"));
        }

        self.update(|sequences| {
            let sequence = find_unrevoked(sequences, drive_id)?
                .ok_or_else(|| Error::sequence(drive_id, "sequence does not exist"))?;
            if sequence.auth_id != super::normalize_id(auth_id) {
                return Err(Error::sequence(
                    drive_id,
                    format!("sequence belongs to auth id {}", sequence.auth_id),
                ));
            }
            if sequence.status != SequenceStatus::New || sequence.next_nonce.is_some() {
                return Err(Error::sequence(drive_id, "cannot reinitialize sequence"));
            }

            sequence.next_nonce = Some(start_nonce);
            sequence.max_nonce = Some(max_nonce);
            sequence.status = SequenceStatus::Active;
            Ok(())
        })?;
        info!("Initialized sequence for drive {}", drive_id);
        Ok(())
    }

    fn next_nonce(&self, drive_id: &str) -> Result<u64> {
        self.update(|sequences| {
            let not_authorized = || Error::NotAuthorized {
                drive_id: drive_id.to_string(),
            };
            let sequence = find_unrevoked(sequences, drive_id)?.ok_or_else(not_authorized)?;
            let (next, max) = match (sequence.status, sequence.next_nonce, sequence.max_nonce) {
                (SequenceStatus::Active, Some(next), Some(max)) => (next, max),
                _ => return Err(not_authorized()),
            };

            if next >= max {
                return Err(Error::RangeExceeded(format!(
                    "nonce range of drive {} is exhausted",
                    drive_id
                )));
            }
            sequence.next_nonce = Some(next + 1);
            Ok(next)
        })
    }

    fn set_max_nonce(&self, drive_id: &str, auth_id: &str, max_nonce: u64) -> Result<()> {
        self.update(|sequences| {
            let sequence = find_unrevoked(sequences, drive_id)?
                .ok_or_else(|| Error::sequence(drive_id, "sequence does not exist"))?;
            if sequence.auth_id != super::normalize_id(auth_id) {
                return Err(Error::sequence(drive_id, "auth id does not match sequence"));
            }
            let (next, current) = match (sequence.next_nonce, sequence.max_nonce) {
                (Some(next), Some(max)) => (next, max),
                _ => return Err(Error::sequence(drive_id, "sequence is not initialized")),
            };

            if max_nonce > current {
                return Err(Error::sequence(drive_id, "max nonce cannot be increased"));
            }
            if max_nonce < next {
                return Err(Error::sequence(drive_id, "max nonce cannot go below next nonce"));
            }
            sequence.max_nonce = Some(max_nonce);
            Ok(())
        })?;
        debug!("Shrunk nonce range of drive {}", drive_id);
        Ok(())
    }

    fn revoke_sequence(&self, drive_id: &str) -> Result<()> {
        self.update(|sequences| {
            if let Some(sequence) = find_unrevoked(sequences, drive_id)? {
                sequence.status = SequenceStatus::Revoked;
                return Ok(());
            }
            let normalized = super::normalize_id(drive_id);
            if sequences.values().any(|s| s.drive_id == normalized) {
                Err(Error::sequence(drive_id, "sequence already revoked"))
            } else {
                Err(Error::sequence(drive_id, "sequence does not exist"))
            }
        })?;
        info!("Revoked sequence for drive {}", drive_id);
        Ok(())
    }

    fn get_sequence(&self, drive_id: &str) -> Result<Option<NonceSequence>> {
        let _lock = self.acquire()?;
        let mut sequences = self.load()?;
        Ok(find_unrevoked(&mut sequences, drive_id)?.cloned())
    }

    fn split_sequence(&self, drive_id: &str) -> Result<(u64, u64)> {
        let range = self.update(|sequences| {
            let sequence = find_unrevoked(sequences, drive_id)?.ok_or_else(|| {
                Error::NotAuthorized {
                    drive_id: drive_id.to_string(),
                }
            })?;
            let (next, max) = match (sequence.status, sequence.next_nonce, sequence.max_nonce) {
                (SequenceStatus::Active, Some(next), Some(max)) => (next, max),
                _ => {
                    return Err(Error::NotAuthorized {
                        drive_id: drive_id.to_string(),
                    })
                }
            };

            let pivot = split_range(next, max)?;
            sequence.max_nonce = Some(pivot);
            Ok((pivot, max))
        })?;
        info!("Split nonce range of drive {}", drive_id);
        Ok(range)
    }
}

impl std::fmt::Debug for FileSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSequencer")
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tempfile::TempDir;

    const DRIVE: &str = "0123456789abcdef0123456789abcdef";
    const AUTH: &str = "fedcba9876543210fedcba9876543210";

    fn sequencer(dir: &TempDir) -> FileSequencer {
        FileSequencer::new(dir.path().join("sequences.json")).unwrap()
    }

    fn active(dir: &TempDir, start: u64, max: u64) -> FileSequencer {
        let seq = sequencer(dir);
        seq.create_sequence(DRIVE, AUTH).unwrap();
        seq.initialize_sequence(DRIVE, AUTH, start, max).unwrap();
        seq
    }

    #[test]
    fn test_lifecycle() {
        let dir = TempDir::new().unwrap();
        let seq = sequencer(&dir);

        assert!(seq.get_sequence(DRIVE).unwrap().is_none());
        seq.create_sequence(DRIVE, AUTH).unwrap();
        assert_eq!(
            seq.get_sequence(DRIVE).unwrap().unwrap().status,
            SequenceStatus::New
        );

        // New sequences cannot issue nonces
        assert!(matches!(
            seq.next_nonce(DRIVE),
            Err(Error::NotAuthorized { .. })
        ));

        seq.initialize_sequence(DRIVE, AUTH, 0, u64::MAX).unwrap();
        assert_eq!(seq.next_nonce(DRIVE).unwrap(), 0);
        assert_eq!(seq.next_nonce(DRIVE).unwrap(), 1);

        seq.revoke_sequence(DRIVE).unwrap();
        assert!(seq.get_sequence(DRIVE).unwrap().is_none());
        assert!(matches!(
            seq.next_nonce(DRIVE),
            Err(Error::NotAuthorized { .. })
        ));
    }

    #[test]
    fn test_range_exhaustion() {
        let dir = TempDir::new().unwrap();
        let seq = active(&dir, 1, 5);

        let issued: Vec<u64> = (0..4).map(|_| seq.next_nonce(DRIVE).unwrap()).collect();
        assert_eq!(issued, vec![1, 2, 3, 4]);

        for _ in 0..3 {
            assert!(matches!(
                seq.next_nonce(DRIVE),
                Err(Error::RangeExceeded(_))
            ));
        }
    }

    #[test]
    fn test_duplicate_create_rejected() {
        let dir = TempDir::new().unwrap();
        let seq = sequencer(&dir);
        seq.create_sequence(DRIVE, AUTH).unwrap();

        let err = seq.create_sequence(DRIVE, "another").unwrap_err();
        assert!(matches!(err, Error::Sequence { .. }));
    }

    #[test]
    fn test_reinitialize_rejected() {
        let dir = TempDir::new().unwrap();
        let seq = active(&dir, 10, 20);
        seq.next_nonce(DRIVE).unwrap();

        let err = seq.initialize_sequence(DRIVE, AUTH, 10, 20).unwrap_err();
        assert!(matches!(err, Error::Sequence { .. }));
        assert_eq!(seq.next_nonce(DRIVE).unwrap(), 11);
    }

    #[test]
    fn test_initialize_without_sequence() {
        let dir = TempDir::new().unwrap();
        let seq = sequencer(&dir);
        assert!(seq.initialize_sequence(DRIVE, AUTH, 0, 10).is_err());
    }

    #[test]
    fn test_max_nonce_only_shrinks() {
        let dir = TempDir::new().unwrap();
        let seq = active(&dir, 0, 100);

        assert!(seq.set_max_nonce(DRIVE, AUTH, 101).is_err());
        seq.set_max_nonce(DRIVE, AUTH, 50).unwrap();
        assert!(seq.set_max_nonce(DRIVE, AUTH, 60).is_err());
        assert_eq!(seq.get_sequence(DRIVE).unwrap().unwrap().max_nonce, Some(50));
    }

    #[test]
    fn test_revoke_twice_is_error() {
        let dir = TempDir::new().unwrap();
        let seq = active(&dir, 0, 10);

        seq.revoke_sequence(DRIVE).unwrap();
        let err = seq.revoke_sequence(DRIVE).unwrap_err();
        match err {
            Error::Sequence { reason, .. } => assert!(reason.contains("already revoked")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_two_unrevoked_sequences_is_corruption() {
        let dir = TempDir::new().unwrap();
        let seq = active(&dir, 0, 10);

        // Inject a second unrevoked record behind the sequencer's back
        let mut sequences = seq.sequences().unwrap();
        let rogue = NonceSequence::new(DRIVE, "00000000000000000000000000000000");
        sequences.insert(rogue.key(), rogue);
        fs::write(seq.path(), serialize(&sequences).unwrap()).unwrap();

        assert!(matches!(
            seq.next_nonce(DRIVE),
            Err(Error::CorruptSequence(_))
        ));
        assert!(matches!(
            seq.get_sequence(DRIVE),
            Err(Error::CorruptSequence(_))
        ));
    }

    #[test]
    fn test_state_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        {
            let seq = active(&dir, 7, 1000);
            assert_eq!(seq.next_nonce(DRIVE).unwrap(), 7);
        }

        let reopened = sequencer(&dir);
        assert_eq!(reopened.next_nonce(&DRIVE.to_uppercase()).unwrap(), 8);
    }

    #[test]
    fn test_split_sequence() {
        let dir = TempDir::new().unwrap();
        let seq = active(&dir, 10, 30);

        let (start, max) = seq.split_sequence(DRIVE).unwrap();
        assert_eq!((start, max), (20, 30));
        assert_eq!(seq.get_sequence(DRIVE).unwrap().unwrap().max_nonce, Some(20));

        let tiny = TempDir::new().unwrap();
        let seq = active(&tiny, 10, 11);
        assert!(matches!(
            seq.split_sequence(DRIVE),
            Err(Error::RangeExceeded(_))
        ));
    }

    #[test]
    fn test_concurrent_nonces_unique() {
        let dir = TempDir::new().unwrap();
        let seq = Arc::new(active(&dir, 0, u64::MAX));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let seq = Arc::clone(&seq);
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| seq.next_nonce(DRIVE).unwrap())
                        .collect::<Vec<u64>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            let issued = handle.join().unwrap();
            assert!(issued.windows(2).all(|w| w[0] < w[1]));
            for nonce in issued {
                assert!(all.insert(nonce), "nonce {} issued twice", nonce);
            }
        }
        assert_eq!(all.len(), 100);
    }

    #[test]
    fn test_separate_instances_share_one_file() {
        let dir = TempDir::new().unwrap();
        active(&dir, 0, u64::MAX);

        // Each thread opens its own sequencer, as separate processes would
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let path = dir.path().join("sequences.json");
                std::thread::spawn(move || {
                    let seq = FileSequencer::new(path).unwrap();
                    (0..200)
                        .map(|_| seq.next_nonce(DRIVE).unwrap())
                        .collect::<Vec<u64>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for nonce in handle.join().unwrap() {
                assert!(all.insert(nonce), "nonce {} issued twice", nonce);
            }
        }
        assert_eq!(all.len(), 400);

        let seq = sequencer(&dir);
        assert_eq!(seq.next_nonce(DRIVE).unwrap(), 400);
    }

    #[test]
    fn test_lock_file_next_to_sequence_file() {
        let dir = TempDir::new().unwrap();
        let seq = active(&dir, 0, 10);
        seq.next_nonce(DRIVE).unwrap();

        assert!(dir.path().join("sequences.json.lock").exists());
        // The lock is released between operations
        let other = sequencer(&dir);
        assert_eq!(other.next_nonce(DRIVE).unwrap(), 1);
    }
}
