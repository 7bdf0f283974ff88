//! Encrypted drive
//!
//! A drive is a directory on real storage holding a sealed config file and a
//! tree of encrypted files under its virtual root. Unlocking it with the
//! password yields the key bundle; writing new files draws nonces from this
//! device's sequence for the drive.
//!
//! ```text
//! <root>/
//!   vault.sqv        sealed keys and drive id
//!   fs/              encrypted files
//!   export/          authorization handoff files
//! ```

mod auth;
mod config;

pub use auth::{parse_auth_id, AuthConfig, AUTH_CHUNK_SIZE, AUTH_CONFIG_SIZE, AUTH_ID_SIZE};
pub use config::{seal, unseal, Unsealed, CONFIG_SIZE, CONFIG_VERSION, DRIVE_ID_SIZE};

use crate::crypto::{random_bytes, ChunkLayout, DriveKey, KdfParams, DEFAULT_CHUNK_SIZE, NONCE_SIZE};
use crate::error::{Error, Result};
use crate::sequence::{normalize_id, NonceSequence, NonceSequencer, SequenceStatus};
use crate::storage::{LocalFile, ReadSeek, ReadWriteSeek, RealFile};
use crate::stream::{AesStream, StreamOptions};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Stream writing into a drive file
pub type DriveWriter = AesStream<Box<dyn ReadWriteSeek>>;

/// Stream reading from a drive file
pub type DriveReader = AesStream<Box<dyn ReadSeek>>;

/// Layout and defaults of a drive
#[derive(Debug, Clone)]
pub struct DriveSettings {
    pub config_filename: String,
    pub auth_filename: String,
    pub fs_dirname: String,
    pub export_dirname: String,
    /// Chunk size for new files, 0 disables integrity
    pub default_chunk_size: u32,
    pub kdf: KdfParams,
}

impl Default for DriveSettings {
    fn default() -> Self {
        DriveSettings {
            config_filename: "vault.sqv".to_string(),
            auth_filename: "auth.sqva".to_string(),
            fs_dirname: "fs".to_string(),
            export_dirname: "export".to_string(),
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            kdf: KdfParams::default(),
        }
    }
}

/// Fresh random id as lowercase hex
fn generate_id<const N: usize>() -> Result<String> {
    Ok(hex::encode(random_bytes::<N>()?))
}

/// An open drive
pub struct Drive {
    root: PathBuf,
    drive_id: String,
    /// None once locked
    key: Option<DriveKey>,
    sequencer: Arc<dyn NonceSequencer>,
    settings: DriveSettings,
}

impl Drive {
    /// Create a new drive at `root` and give this device the full nonce range
    pub fn create(
        root: impl AsRef<Path>,
        password: &[u8],
        sequencer: Arc<dyn NonceSequencer>,
        settings: DriveSettings,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        ChunkLayout::validate_chunk_size(settings.default_chunk_size)?;
        settings.kdf.validate()?;

        let config_file = LocalFile::new(root.join(&settings.config_filename));
        if config_file.exists() {
            return Err(Error::DriveExists(root.display().to_string()));
        }

        let key = DriveKey::generate(password, settings.kdf)?;
        let drive_id = random_bytes::<DRIVE_ID_SIZE>()?;
        let sealed = seal(&key, &drive_id, settings.default_chunk_size)?;

        std::fs::create_dir_all(root.join(&settings.fs_dirname))?;
        config_file.replace(|file| Ok(file.write_all(&sealed)?))?;

        let drive = Drive {
            root,
            drive_id: hex::encode(drive_id),
            key: Some(key),
            sequencer,
            settings,
        };

        let auth_id = generate_id::<AUTH_ID_SIZE>()?;
        drive.sequencer.create_sequence(&drive.drive_id, &auth_id)?;
        drive
            .sequencer
            .initialize_sequence(&drive.drive_id, &auth_id, 0, u64::MAX)?;

        info!("Created drive {} at {:?}", drive.drive_id, drive.root);
        Ok(drive)
    }

    /// Unlock an existing drive.
    ///
    /// The default chunk size stored in the drive overrides the one in `settings`.
    pub fn open(
        root: impl AsRef<Path>,
        password: &[u8],
        sequencer: Arc<dyn NonceSequencer>,
        mut settings: DriveSettings,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let config_file = LocalFile::new(root.join(&settings.config_filename));
        if !config_file.exists() {
            return Err(Error::DriveNotFound(root.display().to_string()));
        }

        let mut sealed = Vec::new();
        config_file.open_read()?.read_to_end(&mut sealed)?;
        let unsealed = unseal(&sealed, password)?;
        settings.default_chunk_size = unsealed.default_chunk_size;

        let drive = Drive {
            root,
            drive_id: hex::encode(unsealed.drive_id),
            key: Some(unsealed.key),
            sequencer,
            settings,
        };
        info!("Opened drive {} at {:?}", drive.drive_id, drive.root);
        Ok(drive)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn drive_id(&self) -> &str {
        &self.drive_id
    }

    pub fn settings(&self) -> &DriveSettings {
        &self.settings
    }

    pub fn is_locked(&self) -> bool {
        self.key.is_none()
    }

    fn key(&self) -> Result<&DriveKey> {
        self.key.as_ref().ok_or(Error::DriveLocked)
    }

    /// Drop the key bundle, zeroing it
    pub fn lock(&mut self) {
        if self.key.take().is_some() {
            info!("Locked drive {}", self.drive_id);
        }
    }

    /// Atomically rewrite the drive config
    fn store_config(&self, key: &DriveKey, default_chunk_size: u32) -> Result<()> {
        let sealed = seal(key, &self.drive_id_bytes()?, default_chunk_size)?;
        LocalFile::new(self.root.join(&self.settings.config_filename))
            .replace(|file| Ok(file.write_all(&sealed)?))
    }

    /// Re-seal the drive config under a new password
    pub fn change_password(&mut self, password: &[u8]) -> Result<()> {
        let rewrapped = self.key()?.rewrap(password, self.settings.kdf)?;
        self.store_config(&rewrapped, self.settings.default_chunk_size)?;

        self.key = Some(rewrapped);
        info!("Changed password of drive {}", self.drive_id);
        Ok(())
    }

    fn drive_id_bytes(&self) -> Result<[u8; DRIVE_ID_SIZE]> {
        let bytes = hex::decode(&self.drive_id)
            .map_err(|e| Error::Internal(format!("drive id is not hex: {}", e)))?;
        bytes
            .try_into()
            .map_err(|_| Error::Internal("drive id has the wrong length".to_string()))
    }

    /// This device's sequence for the drive, if it has one
    pub fn sequence(&self) -> Result<Option<NonceSequence>> {
        self.sequencer.get_sequence(&self.drive_id)
    }

    /// This device's auth id for the drive, registering a new sequence on first use
    pub fn auth_id(&self) -> Result<String> {
        if let Some(sequence) = self.sequence()? {
            return Ok(sequence.auth_id);
        }
        let auth_id = generate_id::<AUTH_ID_SIZE>()?;
        self.sequencer.create_sequence(&self.drive_id, &auth_id)?;
        debug!("Registered auth id for drive {}", self.drive_id);
        Ok(auth_id)
    }

    /// Draw a fresh nonce for a new file
    pub fn next_nonce(&self) -> Result<[u8; NONCE_SIZE]> {
        self.key()?;
        Ok(self.sequencer.next_nonce(&self.drive_id)?.to_be_bytes())
    }

    pub fn default_chunk_size(&self) -> u32 {
        self.settings.default_chunk_size
    }

    /// Change the chunk size for new files and store it in the drive config
    pub fn set_default_chunk_size(&mut self, chunk_size: u32) -> Result<()> {
        ChunkLayout::validate_chunk_size(chunk_size)?;
        self.store_config(self.key()?, chunk_size)?;
        self.settings.default_chunk_size = chunk_size;
        debug!("Default chunk size of drive {} is now {}", self.drive_id, chunk_size);
        Ok(())
    }

    /// Directory holding the encrypted files
    pub fn virtual_root(&self) -> PathBuf {
        self.root.join(&self.settings.fs_dirname)
    }

    /// Default location for exported authorization files
    pub fn export_path(&self) -> PathBuf {
        self.root
            .join(&self.settings.export_dirname)
            .join(&self.settings.auth_filename)
    }

    /// Real file behind a drive-relative name
    pub fn file(&self, name: &str) -> Result<LocalFile> {
        let relative = Path::new(name);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if name.is_empty() || escapes {
            return Err(Error::Security(format!(
                "{} is not a path inside the drive",
                name
            )));
        }
        Ok(LocalFile::new(self.virtual_root().join(relative)))
    }

    /// Open a drive file for writing.
    ///
    /// A new or empty file gets a fresh nonce and the drive's default chunk
    /// size unless `options` names one; a chunk size of 0 disables integrity.
    /// A file with content is refused unless `allow_overwrite` is set.
    pub fn create_file(&self, name: &str, options: StreamOptions) -> Result<DriveWriter> {
        let key = self.key()?;
        let file = self.file(name)?;

        if file.length()? > 0 {
            if !options.allow_overwrite {
                return Err(Error::OverwriteNotAllowed);
            }
            debug!("Overwriting {}", name);
            return AesStream::create(
                file.open_update()?,
                key.drive_key(),
                Some(key.hash_key()),
                None,
                options,
            );
        }

        let chunk_size = options.chunk_size.unwrap_or(self.settings.default_chunk_size);
        let options = StreamOptions {
            integrity: options.integrity && chunk_size > 0,
            chunk_size: Some(chunk_size),
            ..options
        };
        let nonce = self.next_nonce()?;

        AesStream::create(
            file.open_write()?,
            key.drive_key(),
            Some(key.hash_key()),
            Some(nonce),
            options,
        )
    }

    /// Open a drive file for reading
    pub fn open_file(&self, name: &str, options: StreamOptions) -> Result<DriveReader> {
        let key = self.key()?;
        let file = self.file(name)?;
        AesStream::open(
            file.open_read()?,
            key.drive_key(),
            Some(key.hash_key()),
            options,
        )
    }

    /// Give the upper half of this device's remaining range to `target_auth_id`.
    ///
    /// The grant is written to `path` as an encrypted handoff file. From
    /// this point this device only owns the lower half.
    pub fn export_auth_file(&self, target_auth_id: &str, path: impl AsRef<Path>) -> Result<()> {
        let key = self.key()?;
        let target = parse_auth_id(target_auth_id)?;

        let sequence = self.sequence()?.ok_or_else(|| Error::NotAuthorized {
            drive_id: self.drive_id.clone(),
        })?;
        if sequence.status != SequenceStatus::Active {
            return Err(Error::NotAuthorized {
                drive_id: self.drive_id.clone(),
            });
        }
        if sequence.auth_id == target {
            return Err(Error::Auth(
                "cannot authorize the exporting device itself".to_string(),
            ));
        }

        // The handoff file needs its own nonce before the range is split
        let nonce = self.next_nonce()?;
        let (start_nonce, max_nonce) = self.sequencer.split_sequence(&self.drive_id)?;
        let payload = AuthConfig::new(&self.drive_id, &target, start_nonce, max_nonce).to_bytes()?;

        let file = LocalFile::new(path.as_ref());
        let options = StreamOptions::default().with_chunk_size(AUTH_CHUNK_SIZE);
        let mut stream = AesStream::create(
            file.open_write()?,
            key.drive_key(),
            Some(key.hash_key()),
            Some(nonce),
            options,
        )?;
        stream.write_all(&payload)?;
        stream.finish()?;

        info!(
            "Exported authorization for device {} of drive {}",
            target, self.drive_id
        );
        Ok(())
    }

    /// Accept a handoff file produced for this device
    pub fn import_auth_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let key = self.key()?;

        if let Some(sequence) = self.sequence()? {
            if sequence.status == SequenceStatus::Active {
                return Err(Error::sequence(
                    &self.drive_id,
                    "device is already authorized",
                ));
            }
        }
        let auth_id = self.auth_id()?;

        let file = LocalFile::new(path.as_ref());
        let mut stream = AesStream::open(
            file.open_read()?,
            key.drive_key(),
            Some(key.hash_key()),
            StreamOptions::default(),
        )?;
        let mut payload = Vec::with_capacity(AUTH_CONFIG_SIZE);
        stream.read_to_end(&mut payload)?;

        let config = AuthConfig::from_bytes(&payload)?;
        config.verify(&self.drive_id, &auth_id)?;

        self.sequencer.initialize_sequence(
            &self.drive_id,
            &auth_id,
            config.start_nonce,
            config.max_nonce,
        )?;
        info!("Imported authorization for drive {}", self.drive_id);
        Ok(())
    }

    /// Retire this device's sequence; it can no longer create files
    pub fn revoke_authorization(&self) -> Result<()> {
        self.sequencer.revoke_sequence(&normalize_id(&self.drive_id))
    }
}

impl std::fmt::Debug for Drive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drive")
            .field("root", &self.root)
            .field("drive_id", &self.drive_id)
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}
