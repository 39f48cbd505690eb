//! Transfer Codec
//!
//! Moves file bytes over the same stream used for text commands:
//! - SHA-256 checksums with constant-time verification
//! - `i64 size | i32 checksum_len | checksum | payload` framing
//! - Wire filename decoding, sanitization and extension blocking
//!
//! Frame layout (big-endian):
//!
//! ```text
//! ┌──────────────┬────────────────────┬──────────────────┬──────────────┐
//! │ size: i64    │ checksum_len: i32  │ checksum bytes   │ payload      │
//! └──────────────┴────────────────────┴──────────────────┴──────────────┘
//!   size == -1 on download: not found / rejected, no further fields
//! ```

use std::time::Duration;

pub mod checksum;
pub mod codec;
pub mod filename;

pub use checksum::{checksums_match, compute_checksum, verify_checksum, StreamingChecksum, CHECKSUM_LEN};
pub use codec::{
    encode_frame, encode_not_found, receive_download, receive_file, ReceivedFile, TransferLimits,
    MAX_CHECKSUM_LEN, NOT_FOUND_SENTINEL,
};
pub use filename::{is_blocked, sanitize, validate_filename, BLOCKED_EXTENSIONS};

use crate::error::ValidationError;

/// Transfer errors
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// Header rejected; the declared remainder was discarded so the stream
    /// is still in sync.
    #[error(transparent)]
    Invalid(ValidationError),

    /// Header rejected and the remainder length is unknown.
    #[error("{0}; stream cannot be resynchronised")]
    Unrecoverable(ValidationError),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("Transfer timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Whether the underlying stream is unusable after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unrecoverable(_) | Self::Timeout(_) | Self::Io(_))
    }
}
