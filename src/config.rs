use std::env;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::{FlagsError, Result};
use crate::flags_db::{DbOptions, DEFAULT_ROOT_PATH};
use crate::store::memory::MemoryStore;
use crate::store::CoordinationStore;

/// Top-level flags.toml configuration
#[derive(Debug, Deserialize, Default, Clone)]
pub struct FlagsConfig {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_root_path")]
    pub root_path: String,
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
    #[serde(default = "default_storage")]
    pub storage: StorageBackend,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sled,
    Memory,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BootstrapConfig {
    /// Directory of `*.json` flag files used as the lowest-priority source.
    pub dir: Option<String>,
    /// Reload the directory when its files change.
    #[serde(default)]
    pub watch: bool,
}

// ── Default value functions ──────────────────────────

fn default_root_path() -> String {
    DEFAULT_ROOT_PATH.to_string()
}

fn default_init_timeout_ms() -> u64 {
    60_000
}

fn default_storage() -> StorageBackend {
    StorageBackend::Sled
}

fn default_data_dir() -> String {
    "./flags-data".to_string()
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            root_path: default_root_path(),
            init_timeout_ms: default_init_timeout_ms(),
            storage: default_storage(),
            data_dir: default_data_dir(),
        }
    }
}

impl DbConfig {
    pub fn options(&self) -> DbOptions {
        DbOptions {
            root_path: self.root_path.clone(),
            init_timeout: Duration::from_millis(self.init_timeout_ms),
        }
    }
}

impl FlagsConfig {
    /// Load configuration from a TOML file, falling back to defaults if the file
    /// doesn't exist or cannot be parsed.
    pub fn load(path: &str) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content).unwrap_or_else(|e| {
                warn!(path, error = %e, "failed to parse flags config, using defaults");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| FlagsError::Config(e.to_string()))
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(val) = var("FLAGS_ROOT_PATH") {
            self.db.root_path = val;
        }

        if let Some(val) = var("FLAGS_INIT_TIMEOUT_MS") {
            match val.parse::<u64>() {
                Ok(ms) => self.db.init_timeout_ms = ms,
                Err(_) => warn!(value = %val, "ignoring invalid FLAGS_INIT_TIMEOUT_MS"),
            }
        }

        if let Some(val) = var("FLAGS_STORAGE") {
            match val.to_lowercase().as_str() {
                "sled" => self.db.storage = StorageBackend::Sled,
                "memory" => self.db.storage = StorageBackend::Memory,
                other => warn!(value = other, "unknown FLAGS_STORAGE value"),
            }
        }

        if let Some(val) = var("FLAGS_DATA_DIR") {
            self.db.data_dir = val;
        }

        if let Some(val) = var("FLAGS_BOOTSTRAP_DIR") {
            self.bootstrap.dir = Some(val).filter(|d| !d.trim().is_empty());
        }
    }

    /// Builds the configured coordination store.
    pub fn open_store(&self) -> Result<Arc<dyn CoordinationStore>> {
        match self.db.storage {
            StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
            #[cfg(feature = "sled-store")]
            StorageBackend::Sled => {
                let store = crate::store::sled_store::SledStore::open(&self.db.data_dir)?;
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "sled-store"))]
            StorageBackend::Sled => Err(FlagsError::Config(
                "sled storage requires the 'sled-store' feature".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = FlagsConfig::default();
        assert_eq!(config.db.root_path, "/flags/v1");
        assert_eq!(config.db.options().init_timeout, Duration::from_secs(60));
        assert_eq!(config.db.storage, StorageBackend::Sled);
        assert!(config.bootstrap.dir.is_none());
        assert!(!config.bootstrap.watch);
    }

    #[test]
    fn test_parse_toml() {
        let config = FlagsConfig::from_toml(
            r#"
[db]
root_path = "/custom/flags"
storage = "memory"

[bootstrap]
dir = "/etc/flags"
watch = true
"#,
        )
        .unwrap();
        assert_eq!(config.db.root_path, "/custom/flags");
        assert_eq!(config.db.storage, StorageBackend::Memory);
        assert_eq!(config.db.init_timeout_ms, 60_000);
        assert_eq!(config.bootstrap.dir.as_deref(), Some("/etc/flags"));
        assert!(config.bootstrap.watch);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        assert!(matches!(
            FlagsConfig::from_toml("[db]\nstorage = \"floppy\""),
            Err(FlagsError::Config(_))
        ));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = FlagsConfig::load("/nonexistent/flags.toml");
        assert_eq!(config.db.root_path, DEFAULT_ROOT_PATH);
    }

    #[test]
    fn test_overrides() {
        let vars = HashMap::from([
            ("FLAGS_ROOT_PATH", "/over"),
            ("FLAGS_INIT_TIMEOUT_MS", "250"),
            ("FLAGS_STORAGE", "MEMORY"),
            ("FLAGS_BOOTSTRAP_DIR", "/boot"),
        ]);
        let mut config = FlagsConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.db.root_path, "/over");
        assert_eq!(config.db.init_timeout_ms, 250);
        assert_eq!(config.db.storage, StorageBackend::Memory);
        assert_eq!(config.bootstrap.dir.as_deref(), Some("/boot"));
    }

    #[test]
    fn test_invalid_timeout_override_is_ignored() {
        let mut config = FlagsConfig::default();
        config.apply_overrides(|key| (key == "FLAGS_INIT_TIMEOUT_MS").then(|| "soon".to_string()));
        assert_eq!(config.db.init_timeout_ms, 60_000);
    }
}
