//! Flat-list fallback: the last-resort tier, a single JSON array kept under one
//! fixed key of a simple key-value storage.
//!
//! `push` is a read-modify-write of the whole array and is not safe under
//! concurrent writers. Entries can be lost if two contexts race on it; it is
//! only used when the durable store cannot be opened or written at all.

use crate::error::StoreError;
use crate::model::PendingEntry;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::warn;

pub const DEFAULT_FALLBACK_KEY: &str = "sendJSON-outbox";

/// Synchronous string storage, usable while a context is being torn down.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Process-local storage. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryKeyValueStore {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        // A panic while holding the lock leaves a plain map behind; keep using it.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.lock().remove(key);
        Ok(())
    }
}

/// One file per key inside a directory, shared by every process that points
/// at the same directory.
#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    dir: PathBuf,
}

impl FileKeyValueStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(s) => Ok(Some(s)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// The fixed-key array of pending entries.
#[derive(Clone)]
pub struct FlatList {
    kv: Arc<dyn KeyValueStore>,
    key: String,
}

impl FlatList {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self::with_key(kv, DEFAULT_FALLBACK_KEY)
    }

    pub fn with_key(kv: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self {
            kv,
            key: key.into(),
        }
    }

    pub fn push(&self, entry: PendingEntry) -> Result<(), StoreError> {
        self.extend(vec![entry])
    }

    /// Append several entries with a single write.
    pub fn extend(&self, more: Vec<PendingEntry>) -> Result<(), StoreError> {
        if more.is_empty() {
            return Ok(());
        }
        let mut entries = self.read()?;
        entries.extend(more);
        self.kv.set(&self.key, &serde_json::to_string(&entries)?)
    }

    /// Read every entry and clear the key.
    pub fn take_all(&self) -> Result<Vec<PendingEntry>, StoreError> {
        let entries = self.read()?;
        self.kv.remove(&self.key)?;
        Ok(entries)
    }

    pub fn peek(&self) -> Result<Vec<PendingEntry>, StoreError> {
        self.read()
    }

    fn read(&self) -> Result<Vec<PendingEntry>, StoreError> {
        let Some(raw) = self.kv.get(&self.key)? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&raw) {
            Ok(entries) => Ok(entries),
            Err(err) => {
                warn!(?err, key = %self.key, "discarding corrupt fallback list");
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn push_then_take_all_clears_key() {
        let kv = MemoryKeyValueStore::new();
        let list = FlatList::new(Arc::new(kv.clone()));
        list.push(PendingEntry::new("/a", "{}")).unwrap();
        list.push(PendingEntry::new("/b", "[1]")).unwrap();

        let raw = kv.get(DEFAULT_FALLBACK_KEY).unwrap().unwrap();
        assert_eq!(
            raw,
            r#"[{"endpoint":"/a","jsonString":"{}"},{"endpoint":"/b","jsonString":"[1]"}]"#
        );

        let taken = list.take_all().unwrap();
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[1].endpoint, "/b");
        assert!(kv.get(DEFAULT_FALLBACK_KEY).unwrap().is_none());
        assert!(list.take_all().unwrap().is_empty());
    }

    #[test]
    fn extend_appends_after_existing_entries() {
        let kv = MemoryKeyValueStore::new();
        let list = FlatList::new(Arc::new(kv));
        list.push(PendingEntry::new("/first", "{}")).unwrap();
        list.extend(Vec::new()).unwrap();
        list.extend(vec![
            PendingEntry::new("/second", "1"),
            PendingEntry::new("/third", "2"),
        ])
        .unwrap();

        let endpoints: Vec<String> = list.peek().unwrap().into_iter().map(|e| e.endpoint).collect();
        assert_eq!(endpoints, vec!["/first", "/second", "/third"]);
    }

    #[test]
    fn corrupt_value_reads_as_empty() {
        let kv = MemoryKeyValueStore::new();
        kv.set(DEFAULT_FALLBACK_KEY, "not json").unwrap();
        let list = FlatList::new(Arc::new(kv));
        assert!(list.peek().unwrap().is_empty());
        list.push(PendingEntry::new("/a", "{}")).unwrap();
        assert_eq!(list.peek().unwrap().len(), 1);
    }

    #[test]
    fn file_store_round_trips_between_instances() {
        let td = tempdir().unwrap();
        let dir = td.path().join("kv");
        let first = FlatList::new(Arc::new(FileKeyValueStore::new(&dir)));
        first.push(PendingEntry::new("/x", "{\"a\":1}")).unwrap();

        let second = FlatList::new(Arc::new(FileKeyValueStore::new(&dir)));
        assert_eq!(second.take_all().unwrap(), vec![PendingEntry::new("/x", "{\"a\":1}")]);
        assert!(first.peek().unwrap().is_empty());
    }

    #[test]
    fn file_store_remove_missing_key_is_ok() {
        let td = tempdir().unwrap();
        let kv = FileKeyValueStore::new(td.path());
        kv.remove("never-set").unwrap();
        assert!(kv.get("never-set").unwrap().is_none());
    }
}
