//! File references and the provider that reads them.
//!
//! This module provides:
//! - [`FileReference`] — location-independent handle to a database or key file
//! - [`FileProvider`] — reads a reference's bytes within a timeout
//! - [`LocalFileProvider`] — file-system implementation
//! - [`FileAccessError`] — typed access failure with an `is_timeout` predicate

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Category of a [`FileAccessError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileAccessErrorKind {
    /// Nothing at the location.
    NotFound,
    /// The OS refused access.
    PermissionDenied,
    /// The read did not finish in time (slow or offline remote storage).
    Timeout,
    /// The stored bookmark is stale; the user must re-add the file.
    NeedsReinstatement,
    /// Any other I/O failure.
    Io,
}

/// Failure to read a referenced file.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct FileAccessError {
    /// Category.
    pub kind: FileAccessErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl FileAccessError {
    /// Build an error of the given kind.
    #[must_use]
    pub fn new(kind: FileAccessErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A timeout error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FileAccessErrorKind::Timeout, message)
    }

    /// Whether the failure was a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.kind == FileAccessErrorKind::Timeout
    }

    /// Classify an I/O error.
    #[must_use]
    pub fn from_io(err: &std::io::Error) -> Self {
        let kind = match err.kind() {
            ErrorKind::NotFound => FileAccessErrorKind::NotFound,
            ErrorKind::PermissionDenied => FileAccessErrorKind::PermissionDenied,
            ErrorKind::TimedOut => FileAccessErrorKind::Timeout,
            _ => FileAccessErrorKind::Io,
        };
        Self::new(kind, err.to_string())
    }
}

// ---------------------------------------------------------------------------
// FileReference
// ---------------------------------------------------------------------------

/// Where the referenced bytes live.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum FileLocation {
    /// Plain path on a local file system.
    Local {
        /// Absolute path.
        path: PathBuf,
    },
    /// Path obtained through an OS bookmark (cloud folder, external drive).
    Bookmark {
        /// Last resolved path.
        path: PathBuf,
        /// Set when the OS reports the bookmark as stale.
        #[serde(default)]
        stale: bool,
    },
    /// Document stored inside the application's own container.
    AppDocument {
        /// Sub-directory of the documents root.
        container: String,
        /// File name within the container.
        name: String,
    },
}

/// Opaque handle to a database or key file.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReference {
    /// Location of the bytes.
    pub location: FileLocation,
    /// Name shown to the user.
    pub display_name: String,
    /// Error from the last failed access, if any.
    #[serde(skip)]
    pub last_error: Option<FileAccessError>,
    /// The user must pick the file again before it can be used.
    #[serde(default)]
    pub needs_reinstatement: bool,
}

impl fmt::Debug for FileReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileReference")
            .field("display_name", &self.display_name)
            .field("needs_reinstatement", &self.needs_reinstatement)
            .finish_non_exhaustive()
    }
}

impl FileReference {
    /// Reference to a local path. The display name is the file name.
    #[must_use]
    pub fn local(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let display_name = display_name_of(&path);
        Self::with_location(FileLocation::Local { path }, display_name)
    }

    /// Reference to a bookmarked path.
    #[must_use]
    pub fn bookmark(path: impl Into<PathBuf>, stale: bool) -> Self {
        let path = path.into();
        let display_name = display_name_of(&path);
        Self::with_location(FileLocation::Bookmark { path, stale }, display_name)
    }

    /// Reference to an in-app document.
    #[must_use]
    pub fn app_document(container: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self::with_location(
            FileLocation::AppDocument {
                container: container.into(),
                name: name.clone(),
            },
            name,
        )
    }

    fn with_location(location: FileLocation, display_name: String) -> Self {
        let needs_reinstatement = matches!(location, FileLocation::Bookmark { stale: true, .. });
        Self {
            location,
            display_name,
            last_error: None,
            needs_reinstatement,
        }
    }

    /// Stable identifier of the location, used to index settings and
    /// fallback copies. Independent of the display name and of staleness.
    #[must_use]
    pub fn key(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        match &self.location {
            FileLocation::Local { path } => {
                hasher.update(b"local\0");
                hasher.update(path.to_string_lossy().as_bytes());
            }
            FileLocation::Bookmark { path, .. } => {
                hasher.update(b"bookmark\0");
                hasher.update(path.to_string_lossy().as_bytes());
            }
            FileLocation::AppDocument { container, name } => {
                hasher.update(b"document\0");
                hasher.update(container.as_bytes());
                hasher.update(b"\0");
                hasher.update(name.as_bytes());
            }
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Remember the outcome of an access attempt.
    pub fn record_access(&mut self, result: Result<(), &FileAccessError>) {
        match result {
            Ok(()) => self.last_error = None,
            Err(err) => {
                if err.kind == FileAccessErrorKind::NeedsReinstatement {
                    self.needs_reinstatement = true;
                }
                self.last_error = Some(err.clone());
            }
        }
    }
}

fn display_name_of(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Reads referenced files. Implementations must honour `timeout`.
pub trait FileProvider: Send + Sync {
    /// Read the whole file.
    ///
    /// # Errors
    ///
    /// Returns a [`FileAccessError`]; [`FileAccessErrorKind::Timeout`] when the
    /// read did not complete within `timeout`.
    fn fetch(&self, file: &FileReference, timeout: Duration) -> Result<Vec<u8>, FileAccessError>;
}

/// Provider for local paths, bookmarks and in-app documents.
#[derive(Debug, Clone, Default)]
pub struct LocalFileProvider {
    documents_root: Option<PathBuf>,
}

impl LocalFileProvider {
    /// A provider without an in-app documents root.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider resolving [`FileLocation::AppDocument`] under `root`.
    #[must_use]
    pub fn with_documents_root(root: impl Into<PathBuf>) -> Self {
        Self {
            documents_root: Some(root.into()),
        }
    }

    fn resolve(&self, file: &FileReference) -> Result<PathBuf, FileAccessError> {
        match &file.location {
            FileLocation::Local { path } => Ok(path.clone()),
            FileLocation::Bookmark { stale: true, .. } => Err(FileAccessError::new(
                FileAccessErrorKind::NeedsReinstatement,
                format!("bookmark for {} is stale", file.display_name),
            )),
            FileLocation::Bookmark { path, .. } => Ok(path.clone()),
            FileLocation::AppDocument { container, name } => {
                let root = self.documents_root.as_ref().ok_or_else(|| {
                    FileAccessError::new(
                        FileAccessErrorKind::NotFound,
                        "no documents directory configured",
                    )
                })?;
                Ok(root.join(container).join(name))
            }
        }
    }
}

impl FileProvider for LocalFileProvider {
    fn fetch(&self, file: &FileReference, timeout: Duration) -> Result<Vec<u8>, FileAccessError> {
        let path = self.resolve(file)?;
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("latchkey-fetch".into())
            .spawn(move || {
                let _ = tx.send(std::fs::read(&path));
            })
            .map_err(|e| FileAccessError::from_io(&e))?;

        match rx.recv_timeout(timeout) {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(e)) => Err(FileAccessError::from_io(&e)),
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(file = %file.display_name, ?timeout, "file read timed out");
                Err(FileAccessError::timeout(format!(
                    "{} did not respond within {timeout:?}",
                    file.display_name
                )))
            }
            Err(RecvTimeoutError::Disconnected) => Err(FileAccessError::new(
                FileAccessErrorKind::Io,
                "reader thread exited without a result",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn key_is_stable_and_location_specific() {
        let a = FileReference::local("/data/a.kdbx");
        let mut renamed = a.clone();
        renamed.display_name = "Other".into();
        assert_eq!(a.key(), renamed.key());
        assert_eq!(a.key().len(), 64);

        assert_ne!(a.key(), FileReference::local("/data/b.kdbx").key());
        assert_ne!(a.key(), FileReference::bookmark("/data/a.kdbx", false).key());
        assert_eq!(
            FileReference::bookmark("/x", false).key(),
            FileReference::bookmark("/x", true).key()
        );
    }

    #[test]
    fn display_name_is_file_name() {
        assert_eq!(FileReference::local("/data/vault.kdbx").display_name, "vault.kdbx");
        assert_eq!(FileReference::app_document("inbox", "x.kdbx").display_name, "x.kdbx");
    }

    #[test]
    fn fetch_local_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.kdbx");
        std::fs::write(&path, b"bytes").unwrap();
        let bytes = LocalFileProvider::new()
            .fetch(&FileReference::local(&path), TIMEOUT)
            .expect("fetch should succeed");
        assert_eq!(bytes, b"bytes");
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = LocalFileProvider::new()
            .fetch(&FileReference::local(dir.path().join("nope")), TIMEOUT)
            .unwrap_err();
        assert_eq!(err.kind, FileAccessErrorKind::NotFound);
        assert!(!err.is_timeout());
    }

    #[test]
    fn stale_bookmark_needs_reinstatement() {
        let mut file = FileReference::bookmark("/cloud/db.kdbx", true);
        assert!(file.needs_reinstatement);
        file.needs_reinstatement = false;
        let err = LocalFileProvider::new().fetch(&file, TIMEOUT).unwrap_err();
        assert_eq!(err.kind, FileAccessErrorKind::NeedsReinstatement);
        file.record_access(Err(&err));
        assert!(file.needs_reinstatement);
        assert_eq!(file.last_error, Some(err));
        file.record_access(Ok(()));
        assert!(file.last_error.is_none());
    }

    #[test]
    fn app_document_resolves_under_root() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("inbox")).unwrap();
        std::fs::write(dir.path().join("inbox").join("db.kdbx"), b"doc").unwrap();
        let provider = LocalFileProvider::with_documents_root(dir.path());
        let bytes = provider
            .fetch(&FileReference::app_document("inbox", "db.kdbx"), TIMEOUT)
            .unwrap();
        assert_eq!(bytes, b"doc");

        let err = LocalFileProvider::new()
            .fetch(&FileReference::app_document("inbox", "db.kdbx"), TIMEOUT)
            .unwrap_err();
        assert_eq!(err.kind, FileAccessErrorKind::NotFound);
    }

    #[test]
    fn reference_serde_skips_last_error() {
        let mut file = FileReference::local("/data/a.kdbx");
        file.last_error = Some(FileAccessError::timeout("x"));
        let json = serde_json::to_string(&file).unwrap();
        let back: FileReference = serde_json::from_str(&json).unwrap();
        assert!(back.last_error.is_none());
        assert_eq!(back.location, file.location);
    }
}
