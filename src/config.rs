//! Configuration management for seqvault

use crate::crypto::{ChunkLayout, KdfParams, DEFAULT_CHUNK_SIZE};
use crate::drive::DriveSettings;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default sequence file name inside the data directory
pub const SEQUENCE_FILENAME: &str = "sequences.json";

/// Drive layout and defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    /// Chunk size for new files, 0 disables integrity
    pub default_chunk_size: u32,

    /// Request integrity tags on new files and verify them on read
    pub integrity: bool,

    /// Sealed key file at the drive root
    pub config_filename: String,

    /// Default name for exported authorization files
    pub auth_filename: String,

    /// Directory holding encrypted files
    pub fs_dirname: String,

    /// Directory for exported authorization files
    pub export_dirname: String,
}

impl Default for DriveConfig {
    fn default() -> Self {
        let settings = DriveSettings::default();
        DriveConfig {
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            integrity: true,
            config_filename: settings.config_filename,
            auth_filename: settings.auth_filename,
            fs_dirname: settings.fs_dirname,
            export_dirname: settings.export_dirname,
        }
    }
}

/// Nonce sequencer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Sequence file of this device
    pub path: PathBuf,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        SequencerConfig {
            path: data_dir().join(SEQUENCE_FILENAME),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub drive: DriveConfig,
    pub kdf: KdfParams,
    pub sequencer: SequencerConfig,
    pub logging: LoggingConfig,
}

/// Per-user data directory for seqvault
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("seqvault")
}

/// Default location of the config file
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("seqvault")
        .join("config.json")
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    )
}

impl Config {
    /// Load configuration from a JSON or YAML file, chosen by extension
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let content = std::fs::read_to_string(path_ref).map_err(|e| {
            Error::Configuration(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = if is_yaml(path_ref) {
            serde_yaml::from_str(&content).map_err(|e| {
                Error::Configuration(format!("Failed to parse YAML config: {}", e))
            })?
        } else {
            serde_json::from_str(&content).map_err(|e| {
                Error::Configuration(format!("Failed to parse JSON config: {}", e))
            })?
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            return Self::load(path);
        }
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path_ref = path.as_ref();

        let content = if is_yaml(path_ref) {
            serde_yaml::to_string(self).map_err(|e| {
                Error::Configuration(format!("Failed to serialize config to YAML: {}", e))
            })?
        } else {
            serde_json::to_string_pretty(self).map_err(|e| {
                Error::Configuration(format!("Failed to serialize config to JSON: {}", e))
            })?
        };

        if let Some(parent) = path_ref.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path_ref, content).map_err(|e| {
            Error::Configuration(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Apply overrides from environment variables
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(chunk_size) = lookup("SEQVAULT_CHUNK_SIZE") {
            if let Ok(size) = chunk_size.trim().parse::<u32>() {
                self.drive.default_chunk_size = size;
            }
        }

        if let Some(path) = lookup("SEQVAULT_SEQUENCE_FILE") {
            let path = path.trim();
            if !path.is_empty() {
                self.sequencer.path = PathBuf::from(path);
            }
        }

        if let Some(level) = lookup("SEQVAULT_LOG") {
            let level = level.trim().to_string();
            if !level.is_empty() {
                self.logging.level = level;
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        ChunkLayout::validate_chunk_size(self.drive.default_chunk_size)?;

        if self.drive.integrity && self.drive.default_chunk_size == 0 {
            return Err(Error::Configuration(
                "Integrity requires a non-zero chunk size".to_string(),
            ));
        }

        for (name, value) in [
            ("config_filename", &self.drive.config_filename),
            ("auth_filename", &self.drive.auth_filename),
            ("fs_dirname", &self.drive.fs_dirname),
            ("export_dirname", &self.drive.export_dirname),
        ] {
            if value.is_empty() {
                return Err(Error::Configuration(format!("{} must not be empty", name)));
            }
        }

        self.kdf.validate()?;

        if !matches!(
            self.logging.level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(Error::Configuration(format!(
                "Unknown log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Settings handed to drives opened with this configuration
    pub fn drive_settings(&self) -> DriveSettings {
        DriveSettings {
            config_filename: self.drive.config_filename.clone(),
            auth_filename: self.drive.auth_filename.clone(),
            fs_dirname: self.drive.fs_dirname.clone(),
            export_dirname: self.drive.export_dirname.clone(),
            default_chunk_size: if self.drive.integrity {
                self.drive.default_chunk_size
            } else {
                0
            },
            kdf: self.kdf,
        }
    }
}
