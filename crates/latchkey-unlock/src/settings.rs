//! Per-database settings consumed by the unlock engine.
//!
//! Only the data that drives unlock decisions lives here: the remembered
//! master key, the associated key file and hardware key, the read-only flag
//! and the fallback timeout. Settings are keyed by [`FileReference::key`].

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use latchkey_crypto_core::{HardwareKeyDescriptor, StoredCompositeKey};
use serde::{Deserialize, Serialize};

use crate::file_ref::FileReference;

/// Settings of one database file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSettings {
    /// Remembered composite key, when the user opted in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_key: Option<StoredCompositeKey>,

    /// Key file used last time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub associated_key_file: Option<FileReference>,

    /// Hardware key used last time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub associated_hardware_key: Option<HardwareKeyDescriptor>,

    /// Open this database read-only.
    #[serde(default)]
    pub read_only: bool,

    /// Reachability timeout for this file, overriding the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_timeout_ms: Option<u64>,
}

impl DatabaseSettings {
    /// Whether a master key is remembered.
    #[must_use]
    pub const fn has_master_key(&self) -> bool {
        self.master_key.is_some()
    }

    /// Remember `key`.
    pub fn set_master_key(&mut self, key: StoredCompositeKey) {
        self.master_key = Some(key);
    }

    /// Forget the remembered key. The dropped value zeroizes itself.
    pub fn clear_master_key(&mut self) {
        self.master_key = None;
    }
}

/// Storage for [`DatabaseSettings`], injected into the engine.
pub trait SettingsStore: Send + Sync {
    /// Settings for `file`, if any were saved.
    fn get(&self, file: &FileReference) -> Option<DatabaseSettings>;

    /// Apply `mutate` to the settings of `file` (starting from defaults when
    /// absent) and persist the result.
    ///
    /// # Errors
    ///
    /// Returns an `io::Error` if the result could not be persisted. The
    /// in-memory view is updated regardless.
    fn update(
        &self,
        file: &FileReference,
        mutate: &mut dyn FnMut(&mut DatabaseSettings),
    ) -> std::io::Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Volatile store, for tests and for contexts that must not persist keys.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    entries: Mutex<BTreeMap<String, DatabaseSettings>>,
}

impl MemorySettingsStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get(&self, file: &FileReference) -> Option<DatabaseSettings> {
        let entries = self.entries.lock().ok()?;
        entries.get(&file.key()).cloned()
    }

    fn update(
        &self,
        file: &FileReference,
        mutate: &mut dyn FnMut(&mut DatabaseSettings),
    ) -> std::io::Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| std::io::Error::other("settings lock poisoned"))?;
        mutate(entries.entry(file.key()).or_default());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JSON file store
// ---------------------------------------------------------------------------

const SETTINGS_FILE: &str = "database-settings.json";

/// Store persisted as one JSON document in `{dir}/database-settings.json`.
#[derive(Debug)]
pub struct JsonSettingsStore {
    dir: PathBuf,
    entries: Mutex<BTreeMap<String, DatabaseSettings>>,
}

impl JsonSettingsStore {
    /// Open the store in `dir`.
    ///
    /// A missing or unparsable file yields an empty store; the next update
    /// overwrites it.
    #[must_use]
    pub fn open(dir: &Path) -> Self {
        let path = dir.join(SETTINGS_FILE);
        let entries = fs::read_to_string(&path).map_or_else(
            |_| BTreeMap::new(),
            |contents| {
                serde_json::from_str(&contents).unwrap_or_else(|e| {
                    tracing::warn!("discarding unreadable database settings: {e}");
                    BTreeMap::new()
                })
            },
        );
        Self {
            dir: dir.to_path_buf(),
            entries: Mutex::new(entries),
        }
    }

    fn persist(&self, entries: &BTreeMap<String, DatabaseSettings>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        write_atomic(&self.dir, SETTINGS_FILE, json.as_bytes())
    }
}

impl SettingsStore for JsonSettingsStore {
    fn get(&self, file: &FileReference) -> Option<DatabaseSettings> {
        let entries = self.entries.lock().ok()?;
        entries.get(&file.key()).cloned()
    }

    fn update(
        &self,
        file: &FileReference,
        mutate: &mut dyn FnMut(&mut DatabaseSettings),
    ) -> std::io::Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| std::io::Error::other("settings lock poisoned"))?;
        mutate(entries.entry(file.key()).or_default());
        self.persist(&entries)
    }
}

/// Write `{dir}/{name}` through a temporary file and a rename. On Unix the
/// temporary file is created owner-only, never wider.
pub(crate) fn write_atomic(dir: &Path, name: &str, contents: &[u8]) -> std::io::Result<()> {
    let path = dir.join(name);
    let tmp = dir.join(format!(".{name}.tmp"));

    // A leftover from a crashed write keeps its old mode; start fresh.
    match fs::remove_file(&tmp) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, &path)
}
