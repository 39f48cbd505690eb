//! Error types for the file sharing server
//!
//! Module-local errors (`TransferError`, `PoolError`, `StoreError`,
//! `RegistryError`) live next to the code that raises them. This module holds
//! the protocol-level taxonomy and the session boundary error that maps every
//! failure to the line a client sees.

use std::time::Duration;

use thiserror::Error;

use crate::broadcast::RegistryError;
use crate::db::StoreError;
use crate::pool::PoolError;
use crate::transfer::TransferError;

/// Server-wide result type
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors raised by the acceptor and the composition root
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Malformed or missing handshake. Always terminates the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Handshake required: CLIENT_ID <name>")]
    MissingHandshake,

    #[error("Handshake carries no client name")]
    MissingName,

    #[error("Unknown connection kind: {0}")]
    UnknownKind(String),

    #[error("Client name already in use: {0}")]
    NameInUse(String),

    #[error("Line exceeds {0} bytes")]
    LineTooLong(u64),
}

impl From<RegistryError> for ProtocolError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NameTaken(name) => Self::NameInUse(name),
        }
    }
}

/// Client input rejected before anything touches storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing file name")]
    MissingFilename,

    #[error("File name is not valid URL-encoded UTF-8: {0}")]
    UndecodableFilename(String),

    #[error("Invalid file name: {0}")]
    InvalidFilename(String),

    #[error("File type not allowed: {0}")]
    BlockedExtension(String),

    #[error("File too large: {size} bytes (max: {max})")]
    FileTooLarge { size: i64, max: u64 },

    #[error("Invalid file size: {0}")]
    InvalidSize(i64),

    #[error("Invalid checksum length: {0} (expected 1..=64)")]
    InvalidChecksumLength(i32),

    #[error("Invalid count: {0}")]
    InvalidCount(String),
}

/// Everything a command handler can fail with
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("Connection closed by peer")]
    Disconnected,

    #[error("Read timed out after {0:?}")]
    Timeout(Duration),
}

impl SessionError {
    /// Whether the session must end after this error.
    ///
    /// Network failures and framing desyncs end the session; everything a
    /// client caused by sending bad input is answered and the loop goes on.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Protocol(_)
            | Self::Connection(_)
            | Self::Disconnected
            | Self::Timeout(_) => true,
            Self::Transfer(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// The `ERROR:` line sent back to the client.
    pub fn client_message(&self) -> String {
        let detail = match self {
            Self::Pool(PoolError::Closed) => "Server is shutting down".to_string(),
            Self::Pool(_) => "Server busy, storage unavailable. Try again later".to_string(),
            Self::Store(e) => {
                tracing::error!("Storage error: {}", e);
                "Storage error".to_string()
            }
            other => other.to_string(),
        };
        format!("ERROR: {}", detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_keep_session_open() {
        let err = SessionError::from(ValidationError::BlockedExtension("malware.exe".into()));
        assert!(!err.is_fatal());
        assert_eq!(err.client_message(), "ERROR: File type not allowed: malware.exe");
    }

    #[test]
    fn test_connection_errors_are_fatal() {
        let err = SessionError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(err.is_fatal());
        assert!(SessionError::Disconnected.is_fatal());
        assert!(SessionError::from(ProtocolError::MissingName).is_fatal());
    }

    #[test]
    fn test_pool_errors_hide_internals() {
        let err = SessionError::from(PoolError::Exhausted {
            timeout: Duration::from_secs(5),
        });
        assert!(!err.is_fatal());
        assert!(err.client_message().starts_with("ERROR: Server busy"));
    }
}
