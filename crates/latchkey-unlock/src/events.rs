//! Unlock lifecycle events and the successful outcome.
//!
//! All events of one request travel over a single `std::sync::mpsc`
//! channel, in order, so a consumer can apply them without extra locking.

use serde::{Deserialize, Serialize};

use crate::container::Generation;
use crate::database::{Database, LoadWarning};
use crate::error::UnlockError;
use crate::file_ref::FileReference;

/// Which attempt of a request is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttemptKind {
    /// Remembered key with cached final keys.
    Fast,
    /// Full derivation from the raw components.
    Slow,
    /// Local copy of an unreachable database.
    Fallback,
}

/// How a loaded database was obtained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseStatus {
    /// Changes must not be written back.
    pub read_only: bool,
    /// Loaded from the local fallback copy.
    pub local_fallback: bool,
}

/// A successfully unlocked database.
#[derive(Debug)]
pub struct UnlockedDatabase {
    /// Decrypted content.
    pub database: Database,
    /// Non-fatal issues met while loading.
    pub warnings: Vec<LoadWarning>,
    /// Flags for how the bytes were obtained.
    pub status: DatabaseStatus,
    /// Attempt that succeeded.
    pub attempt: AttemptKind,
    /// Container generation.
    pub generation: Generation,
    /// The file that was opened.
    pub file: FileReference,
}

/// Result of one unlock request.
pub type UnlockOutcome = Result<UnlockedDatabase, UnlockError>;

/// Lifecycle notifications.
#[derive(Debug)]
pub enum UnlockEvent {
    /// A request was accepted and is about to run.
    WillUnlock,
    /// An attempt began. A request has at most one attempt of each kind.
    AttemptStarted(AttemptKind),
    /// Progress of the current attempt, non-decreasing within it.
    ProgressChanged {
        /// Attempt the fraction belongs to.
        attempt: AttemptKind,
        /// Fraction in `[0, 1]`.
        fraction: f32,
    },
    /// Terminal failure.
    DidFail(UnlockError),
    /// Terminal success.
    DidSucceed(Box<UnlockedDatabase>),
}

impl UnlockEvent {
    /// Whether no further events follow for this request.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::DidFail(_) | Self::DidSucceed(_))
    }
}

impl From<UnlockOutcome> for UnlockEvent {
    fn from(outcome: UnlockOutcome) -> Self {
        match outcome {
            Ok(unlocked) => Self::DidSucceed(Box::new(unlocked)),
            Err(err) => Self::DidFail(err),
        }
    }
}
