//! Unlock error types for `latchkey-unlock`.

use latchkey_crypto_core::{CryptoError, HardwareKeyError};
use thiserror::Error;

use crate::file_ref::{FileAccessError, FileAccessErrorKind};

/// Why an unlock failed. Every failure leaves the engine idle and ready for
/// another request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnlockError {
    /// The attempt observed a cancellation request.
    #[error("unlock cancelled")]
    CancelledByUser,

    /// Wrong password, key file or hardware key, or a stale remembered key.
    #[error("invalid credentials: {0}")]
    InvalidKey(String),

    /// The database bytes could not be fetched.
    #[error("database unreachable: {0}")]
    DatabaseUnreachable(FileAccessError),

    /// The container failed a structural or checksum test.
    #[error("database file is corrupted: {0}")]
    FileCorrupted(String),

    /// Unknown container generation, cipher or KDF.
    #[error("unsupported database format: {0}")]
    UnsupportedFormat(String),

    /// A hardware key is required but could not be reached in time.
    #[error("hardware key is not available")]
    HardwareKeyUnavailable,

    /// The key file could not be read or interpreted.
    #[error("key file cannot be used: {0}")]
    KeyFileUnreadable(String),
}

/// Structured detail for UI decisions, beyond the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// File access failed; the kind tells whether a retry or a re-import helps.
    FileAccess(FileAccessErrorKind),
    /// The credentials did not match the container.
    CredentialMismatch,
    /// The container is damaged.
    Integrity,
}

impl UnlockError {
    /// Optional structured reason.
    #[must_use]
    pub const fn reason(&self) -> Option<FailureReason> {
        match self {
            Self::DatabaseUnreachable(err) => Some(FailureReason::FileAccess(err.kind)),
            Self::InvalidKey(_) => Some(FailureReason::CredentialMismatch),
            Self::FileCorrupted(_) => Some(FailureReason::Integrity),
            _ => None,
        }
    }

    pub(crate) fn corrupted(detail: impl Into<String>) -> Self {
        Self::FileCorrupted(detail.into())
    }

    pub(crate) fn unsupported(detail: impl Into<String>) -> Self {
        Self::UnsupportedFormat(detail.into())
    }
}

impl From<CryptoError> for UnlockError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Cancelled | CryptoError::HardwareKey(HardwareKeyError::Cancelled) => {
                Self::CancelledByUser
            }
            CryptoError::Decryption => Self::InvalidKey(err.to_string()),
            CryptoError::InvalidKeyMaterial(msg) => Self::InvalidKey(msg),
            CryptoError::HardwareKey(HardwareKeyError::NotAvailable | HardwareKeyError::Timeout(_)) => {
                Self::HardwareKeyUnavailable
            }
            CryptoError::HardwareKey(HardwareKeyError::Device(msg)) => {
                tracing::warn!("hardware key device failure: {msg}");
                Self::HardwareKeyUnavailable
            }
            CryptoError::KeyFile(msg) => Self::KeyFileUnreadable(msg),
            other => Self::FileCorrupted(other.to_string()),
        }
    }
}

/// Failure to produce a container from a database.
#[derive(Debug, Error)]
pub enum SaveError {
    /// Key derivation or encryption failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// The payload could not be serialized or compressed.
    #[error("failed to serialize database: {0}")]
    Serialize(String),
}

impl SaveError {
    pub(crate) fn serialize(err: impl std::fmt::Display) -> Self {
        Self::Serialize(err.to_string())
    }
}

/// A second unlock was requested while one is still running on the same
/// engine. Cancel the running attempt first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("an unlock attempt is already in flight")]
pub struct AttemptInFlight;

/// [`crate::UnlockEngine::start`] could not launch a worker.
#[derive(Debug, Error)]
pub enum StartError {
    /// Another attempt is running.
    #[error(transparent)]
    InFlight(#[from] AttemptInFlight),

    /// The worker thread could not be spawned.
    #[error("failed to spawn unlock worker: {0}")]
    Spawn(#[from] std::io::Error),
}
