//! Durable key-value storage.
//!
//! Everything the sync engine owns on disk (the outbox, dead letters, the
//! pull watermark, the local note vault and auth material) goes through
//! [`KvStore`]. Values are opaque strings; callers serialize with serde_json.

use std::collections::HashMap;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::StoreError;

/// Async key-value store used for tokens, key material and engine state.
///
/// Implementations must have persisted a write by the time `set_item` or
/// `remove_item` resolves.
pub trait KvStore: Send + Sync {
    /// Read the value stored under `key`, if any.
    fn get_item(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<String>, StoreError>> + Send;

    /// Store `value` under `key`, replacing any previous value.
    fn set_item(
        &self,
        key: &str,
        value: String,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Remove `key`. Removing a missing key is not an error.
    fn remove_item(&self, key: &str) -> impl Future<Output = Result<(), StoreError>> + Send;
}

impl<T: KvStore> KvStore for Arc<T> {
    fn get_item(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<String>, StoreError>> + Send {
        (**self).get_item(key)
    }

    fn set_item(
        &self,
        key: &str,
        value: String,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        (**self).set_item(key, value)
    }

    fn remove_item(&self, key: &str) -> impl Future<Output = Result<(), StoreError>> + Send {
        (**self).remove_item(key)
    }
}

/// A [`KvStore`] that keeps one JSON file per key in a directory.
///
/// Writes go to a temporary sibling and are renamed into place, so a crash
/// mid-write leaves the previous value intact.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{file_name}.json"))
    }
}

impl KvStore for FileStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Read {
                key: key.to_string(),
                path,
                source,
            }),
        }
    }

    async fn set_item(&self, key: &str, value: String) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let write_err = |source| StoreError::Write {
            key: key.to_string(),
            path: path.clone(),
            source,
        };

        tokio::fs::create_dir_all(&self.dir).await.map_err(write_err)?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value).await.map_err(write_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(write_err)?;
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Remove {
                key: key.to_string(),
                path,
                source,
            }),
        }
    }
}

/// In-memory [`KvStore`], for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.items.lock().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StoreError> {
        let items = self
            .items
            .lock()
            .map_err(|_| StoreError::corrupt(key, "memory store lock poisoned"))?;
        Ok(items.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut items = self
            .items
            .lock()
            .map_err(|_| StoreError::corrupt(key, "memory store lock poisoned"))?;
        items.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StoreError> {
        let mut items = self
            .items
            .lock()
            .map_err(|_| StoreError::corrupt(key, "memory store lock poisoned"))?;
        items.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "inkwell-store-{}-{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = scratch_dir("roundtrip");
        let store = FileStore::new(&dir);

        assert_eq!(store.get_item("auth.token").await.unwrap(), None);
        store
            .set_item("auth.token", "abc".to_string())
            .await
            .unwrap();
        assert_eq!(
            store.get_item("auth.token").await.unwrap().as_deref(),
            Some("abc")
        );

        // A second handle on the same directory sees the persisted value.
        let reopened = FileStore::new(&dir);
        assert_eq!(
            reopened.get_item("auth.token").await.unwrap().as_deref(),
            Some("abc")
        );

        store.remove_item("auth.token").await.unwrap();
        assert_eq!(store.get_item("auth.token").await.unwrap(), None);
        // Removing again is fine.
        store.remove_item("auth.token").await.unwrap();

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_file_store_sanitizes_keys() {
        let dir = scratch_dir("sanitize");
        let store = FileStore::new(&dir);
        store
            .set_item("../escape/attempt", "x".to_string())
            .await
            .unwrap();
        assert!(dir.join(".._escape_attempt.json").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_memory_store_via_arc() {
        let store = Arc::new(MemoryStore::new());
        let shared = store.clone();
        shared.set_item("k", "v".to_string()).await.unwrap();
        assert_eq!(store.get_item("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.len(), 1);
        store.remove_item("k").await.unwrap();
        assert!(store.is_empty());
    }
}
