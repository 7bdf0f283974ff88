//! Authenticated stream layer
//!
//! Composes the counter transformer and chunked integrity behind a single
//! seekable stream with a fixed header, plus helpers for whole byte arrays.

mod aes_stream;
mod encryptor;
mod header;

pub use aes_stream::{AesStream, EncryptionMode, StreamFormat, StreamOptions};
pub use encryptor::{peek_header, Decryptor, Encryptor};
pub use header::{Header, HEADER_SIZE, MAGIC, VERSION};
