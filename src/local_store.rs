use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

use crate::error::Result;

pub const STORE_FILE: &str = "local_storage.json";

/// Client-local key/value storage persisted as one JSON file.
///
/// Cloning shares the same underlying map.
#[derive(Debug, Clone)]
pub struct LocalStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug)]
struct Inner {
    path: Option<PathBuf>,
    entries: BTreeMap<String, Value>,
}

impl LocalStore {
    /// Open the store in `dir`, starting empty if the file is missing or unreadable
    pub fn open(dir: impl AsRef<Path>) -> Self {
        let path = dir.as_ref().join(STORE_FILE);
        let entries = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<BTreeMap<String, Value>>(&content) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!("Failed to parse local store {}: {err}", path.display());
                    BTreeMap::new()
                }
            },
            Err(err) => {
                debug!("Local store {} not found ({err}); starting empty", path.display());
                BTreeMap::new()
            }
        };

        Self {
            inner: Arc::new(Mutex::new(Inner {
                path: Some(path),
                entries,
            })),
        }
    }

    /// Store that never touches disk
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                path: None,
                entries: BTreeMap::new(),
            })),
        }
    }

    /// Read a key, treating a value of the wrong shape as absent
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let value = inner.entries.get(key)?.clone();
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(err) => {
                warn!("Ignoring malformed local value for {}: {err}", key);
                None
            }
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.entries.insert(key.to_string(), serde_json::to_value(value)?);
        inner.flush()
    }

    /// Insert a raw value, bypassing type checks
    pub fn set_raw(&self, key: &str, value: Value) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.entries.insert(key.to_string(), value);
        inner.flush()
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.entries.remove(key).is_some() {
            inner.flush()?;
        }
        Ok(())
    }
}

impl Inner {
    fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(&self.entries)?;
        fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path());
        store.set("rated_v4_u1", &vec!["p1".to_string()]).unwrap();

        let reopened = LocalStore::open(dir.path());
        let rated: Vec<String> = reopened.get("rated_v4_u1").unwrap();
        assert_eq!(rated, vec!["p1".to_string()]);
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(STORE_FILE), "{not json").unwrap();

        let store = LocalStore::open(dir.path());
        assert!(store.get::<Value>("anything").is_none());
    }

    #[test]
    fn test_wrong_shape_reads_as_absent() {
        let store = LocalStore::in_memory();
        store.set_raw("rated_v4_u1", json!({"oops": true})).unwrap();
        assert!(store.get::<Vec<String>>("rated_v4_u1").is_none());
    }

    #[test]
    fn test_clones_share_entries() {
        let store = LocalStore::in_memory();
        let other = store.clone();
        store.set("k", &1u32).unwrap();
        assert_eq!(other.get::<u32>("k"), Some(1));
        other.remove("k").unwrap();
        assert!(store.get::<u32>("k").is_none());
    }
}
