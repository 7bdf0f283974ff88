//! seqvault - Encrypted virtual drive
//!
//! Files are stored as seekable AES-256-CTR streams with chunked
//! HMAC-SHA256 integrity. Every file gets a nonce from a persisted,
//! per-device sequence, and devices sharing a drive split nonce ranges
//! through an encrypted authorization handoff so no nonce is ever issued
//! twice under the same key.

pub mod config;
pub mod crypto;
pub mod drive;
pub mod error;
pub mod sequence;
pub mod storage;
pub mod stream;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::drive::{Drive, DriveSettings};
    pub use crate::error::{Error, Result};
    pub use crate::sequence::{FileSequencer, NonceSequencer};
    pub use crate::stream::{AesStream, EncryptionMode, StreamOptions};
}
