//! Engine configuration, stored as plain JSON next to the settings store.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::settings::write_atomic;

/// Process-wide knobs of the unlock engine.
///
/// Persisted to `{dir}/engine.json`. All fields have defaults via [`Default`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Allow remembering composite keys after a successful unlock.
    #[serde(default = "default_true")]
    pub remember_master_keys: bool,

    /// Associate the key file used with the database.
    #[serde(default = "default_true")]
    pub remember_key_files: bool,

    /// Associate the hardware key used with the database.
    #[serde(default = "default_true")]
    pub remember_hardware_keys: bool,

    /// Reachability timeout when the database has no override.
    #[serde(default = "default_fallback_timeout_ms")]
    pub default_fallback_timeout_ms: u64,

    /// Refresh the local fallback copy after every successful load.
    #[serde(default = "default_true")]
    pub update_fallback_copy: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            remember_master_keys: true,
            remember_key_files: true,
            remember_hardware_keys: true,
            default_fallback_timeout_ms: default_fallback_timeout_ms(),
            update_fallback_copy: true,
        }
    }
}

const fn default_true() -> bool {
    true
}
const fn default_fallback_timeout_ms() -> u64 {
    10_000
}

const CONFIG_FILE: &str = "engine.json";

impl EngineConfig {
    /// Default reachability timeout.
    #[must_use]
    pub const fn default_fallback_timeout(&self) -> Duration {
        Duration::from_millis(self.default_fallback_timeout_ms)
    }

    /// Load from `{dir}/engine.json`, falling back to defaults when the file
    /// is missing or invalid.
    #[must_use]
    pub fn load(dir: &Path) -> Self {
        fs::read_to_string(dir.join(CONFIG_FILE)).map_or_else(
            |_| Self::default(),
            |contents| serde_json::from_str(&contents).unwrap_or_default(),
        )
    }

    /// Persist to `{dir}/engine.json` atomically.
    ///
    /// # Errors
    ///
    /// Returns an `io::Error` if the directory does not exist or the write
    /// or rename fails.
    pub fn save(&self, dir: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        write_atomic(dir, CONFIG_FILE, json.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert!(config.remember_master_keys);
        assert!(config.update_fallback_copy);
        assert_eq!(config.default_fallback_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        assert_eq!(EngineConfig::load(dir.path()), EngineConfig::default());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), r#"{"rememberMasterKeys":false}"#).unwrap();
        let config = EngineConfig::load(dir.path());
        assert!(!config.remember_master_keys);
        assert!(config.remember_key_files);
        assert_eq!(config.default_fallback_timeout_ms, 10_000);
    }

    #[test]
    fn corrupt_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "]]]").unwrap();
        assert_eq!(EngineConfig::load(dir.path()), EngineConfig::default());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig {
            remember_master_keys: false,
            remember_key_files: false,
            remember_hardware_keys: true,
            default_fallback_timeout_ms: 1_500,
            update_fallback_copy: false,
        };
        config.save(dir.path()).unwrap();
        assert_eq!(EngineConfig::load(dir.path()), config);
        assert!(!dir.path().join(".engine.json.tmp").exists());
    }
}
