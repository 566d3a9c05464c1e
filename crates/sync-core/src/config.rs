//! Key/value configuration persistence.
//!
//! Small JSON-backed store used for sync settings, device records, the
//! session and the credential blob. Values are cached in memory and written
//! through to disk on every mutation, so reads never block on IO.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config data: {0}")]
    Invalid(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// String key/value store with write-through persistence.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// JSON-file-backed store. The whole map lives in one pretty-printed
/// document so users can inspect and hand-edit it.
pub struct JsonFileStore {
    path: PathBuf,
    cache: RwLock<HashMap<String, String>>,
}

impl JsonFileStore {
    /// Open (or create) the store at `path`. A corrupt file is treated as
    /// empty rather than failing startup; the old content is replaced on
    /// the next write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let cache = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(map) => map,
                Err(e) => {
                    tracing::warn!("Config store at {:?} is corrupt ({}), starting empty", path, e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Ok(Self {
            path,
            cache: RwLock::new(cache),
        })
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let cache = self.cache.read().unwrap();
        let contents = serde_json::to_string_pretty(&*cache)?;
        std::fs::write(&self.path, contents)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KvStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.cache.read().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.cache
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        self.persist()
    }

    fn remove(&self, key: &str) -> Result<()> {
        let removed = self.cache.write().unwrap().remove(key).is_some();
        if removed {
            self.persist()?;
        }
        Ok(())
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().unwrap().remove(key);
        Ok(())
    }
}

impl<T: KvStore + ?Sized> KvStore for std::sync::Arc<T> {
    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key)
    }
}

const SETTINGS_KEY: &str = "sync.settings";

/// Persisted sync settings.
///
/// `workspace_salt` is shared by every device syncing the same workspace;
/// the first device to enable sync generates it and the others receive it
/// during onboarding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncSettings {
    /// Whether sync is enabled for this workspace
    pub enabled: bool,
    /// Remote store base URL
    pub server_url: String,
    /// Account email, once logged in
    pub email: Option<String>,
    /// Base64 salt for the workspace content key
    pub workspace_salt: Option<String>,
    /// Seconds between periodic sync cycles
    pub sync_interval_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            server_url: "https://sync.inkstone.app".to_string(),
            email: None,
            workspace_salt: None,
            sync_interval_secs: 30,
        }
    }
}

impl SyncSettings {
    /// Load settings, falling back to defaults when absent or unreadable.
    pub fn load(store: &dyn KvStore) -> Self {
        store
            .get(SETTINGS_KEY)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, store: &dyn KvStore) -> Result<()> {
        let raw = serde_json::to_string(self)?;
        store.set(SETTINGS_KEY, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_json_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config/store.json");

        {
            let store = JsonFileStore::open(&path).unwrap();
            store.set("alpha", "1").unwrap();
            store.set("beta", "2").unwrap();
        }

        // Reopen and verify persistence
        let store = JsonFileStore::open(&path).unwrap();
        assert_eq!(store.get("alpha").as_deref(), Some("1"));
        assert_eq!(store.get("beta").as_deref(), Some("2"));
    }

    #[test]
    fn test_json_store_remove() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path().join("store.json")).unwrap();

        store.set("key", "value").unwrap();
        store.remove("key").unwrap();

        assert_eq!(store.get("key"), None);

        let reopened = JsonFileStore::open(dir.path().join("store.json")).unwrap();
        assert_eq!(reopened.get("key"), None);
    }

    #[test]
    fn test_json_store_tolerates_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = JsonFileStore::open(&path).unwrap();
        assert_eq!(store.get("anything"), None);

        // Still writable afterwards
        store.set("fresh", "start").unwrap();
        assert_eq!(store.get("fresh").as_deref(), Some("start"));
    }

    #[test]
    fn test_settings_defaults_when_missing() {
        let store = MemoryKvStore::new();
        let settings = SyncSettings::load(&store);

        assert!(!settings.enabled);
        assert_eq!(settings.sync_interval_secs, 30);
        assert!(settings.workspace_salt.is_none());
    }

    #[test]
    fn test_settings_roundtrip() {
        let store = MemoryKvStore::new();

        let settings = SyncSettings {
            enabled: true,
            email: Some("ada@example.com".into()),
            workspace_salt: Some("c2FsdA==".into()),
            ..Default::default()
        };
        settings.save(&store).unwrap();

        assert_eq!(SyncSettings::load(&store), settings);
    }
}
