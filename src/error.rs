//! Error types for seqvault

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for seqvault
#[derive(Error, Debug)]
pub enum Error {
    // Nonce and counter exhaustion
    #[error("Range exceeded: {0}")]
    RangeExceeded(String),

    // Integrity errors
    #[error("Integrity violation in chunk {chunk} at offset {offset}: data corrupt or tampered")]
    Integrity { chunk: u64, offset: u64 },

    // Security errors
    #[error("Range write is not allowed at offset {offset}: nonces must never be reused")]
    RangeWriteNotAllowed { offset: u64 },

    #[error("File already has content, overwriting requires an explicit opt-in")]
    OverwriteNotAllowed,

    #[error("Missing key material: {0}")]
    MissingKey(&'static str),

    #[error("Security error: {0}")]
    Security(String),

    // Sequence errors
    #[error("Sequence error for drive {drive_id}: {reason}")]
    Sequence { drive_id: String, reason: String },

    #[error("Corrupt sequence state: {0}")]
    CorruptSequence(String),

    #[error("Device not authorized for drive {drive_id}")]
    NotAuthorized { drive_id: String },

    // Authorization errors
    #[error("Authorization failed: {0}")]
    Auth(String),

    #[error("Wrong password")]
    WrongPassword,

    // Drive errors
    #[error("Drive already exists: {0}")]
    DriveExists(String),

    #[error("Drive not found: {0}")]
    DriveNotFound(String),

    #[error("Drive is locked")]
    DriveLocked,

    // Format errors
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    // Config errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a sequence lifecycle violation
    pub fn sequence(drive_id: &str, reason: impl Into<String>) -> Self {
        Error::Sequence {
            drive_id: drive_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the caller may reasonably retry with different input.
    ///
    /// Only a wrong password is recoverable. Exhausted ranges, integrity
    /// failures and corrupted sequence state do not change by retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::WrongPassword)
    }

    /// Whether this error belongs to the security family (unsafe reuse, missing keys)
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            Error::RangeWriteNotAllowed { .. }
                | Error::OverwriteNotAllowed
                | Error::MissingKey(_)
                | Error::Security(_)
        )
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        // Typed errors travel through std::io traits boxed in io::Error
        if e.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            return match e.into_inner().map(|inner| inner.downcast::<Error>()) {
                Some(Ok(inner)) => *inner,
                _ => Error::Internal("lost wrapped stream error".to_string()),
            };
        }
        Error::Io(e)
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(inner) => inner,
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
