//! Fallback Resolver and the local fallback copy store.
//!
//! When the original database cannot be reached, the engine asks the caller's
//! policy whether to open the last good local copy instead. The decision is
//! the caller's; this module only enforces that "use cache" without a copy
//! degrades to "show error".

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::file_ref::{FileAccessError, FileReference};
use crate::settings::write_atomic;

/// Caller decision when the original file is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FallbackStrategy {
    /// Open the local fallback copy.
    UseCache,
    /// Report the access error.
    ShowError,
}

/// Effective strategy once the copy's existence is taken into account.
#[must_use]
pub fn resolve(requested: FallbackStrategy, has_fallback_copy: bool) -> FallbackStrategy {
    match requested {
        FallbackStrategy::UseCache if has_fallback_copy => FallbackStrategy::UseCache,
        FallbackStrategy::UseCache => {
            tracing::debug!("fallback requested but no local copy exists");
            FallbackStrategy::ShowError
        }
        FallbackStrategy::ShowError => FallbackStrategy::ShowError,
    }
}

/// Local copies of remote databases.
pub trait FallbackStore: Send + Sync {
    /// Whether a copy exists for `file`.
    fn has_copy(&self, file: &FileReference) -> bool;

    /// Bytes of the copy.
    ///
    /// # Errors
    ///
    /// Returns a [`FileAccessError`] when the copy is missing or unreadable.
    fn load(&self, file: &FileReference) -> Result<Vec<u8>, FileAccessError>;

    /// Replace the copy with `bytes`.
    ///
    /// # Errors
    ///
    /// Returns an `io::Error` if the copy could not be written.
    fn save(&self, file: &FileReference, bytes: &[u8]) -> std::io::Result<()>;
}

/// Keeps each copy as `{dir}/{file-key}.kdbx`.
#[derive(Debug, Clone)]
pub struct DirectoryFallbackStore {
    dir: PathBuf,
}

impl DirectoryFallbackStore {
    /// Store copies in `dir`, which must exist.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the copies.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(file: &FileReference) -> String {
        format!("{}.kdbx", file.key())
    }
}

impl FallbackStore for DirectoryFallbackStore {
    fn has_copy(&self, file: &FileReference) -> bool {
        self.dir.join(Self::file_name(file)).is_file()
    }

    fn load(&self, file: &FileReference) -> Result<Vec<u8>, FileAccessError> {
        fs::read(self.dir.join(Self::file_name(file))).map_err(|e| FileAccessError::from_io(&e))
    }

    fn save(&self, file: &FileReference, bytes: &[u8]) -> std::io::Result<()> {
        write_atomic(&self.dir, &Self::file_name(file), bytes)?;
        tracing::debug!(file = %file.display_name, len = bytes.len(), "fallback copy updated");
        Ok(())
    }
}
