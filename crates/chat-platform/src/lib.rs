//! Durable local key-value storage for chat sync state.
//!
//! Values are opaque strings (the core stores JSON documents). Implementations
//! must be safe to share across tasks.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use thiserror::Error;
use tracing::trace;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,
    #[error("key-value store unavailable: {0}")]
    Unavailable(String),
    #[error("key-value store backend failure: {0}")]
    Backend(String),
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<String, StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for Arc<S> {
    fn get(&self, key: &str) -> Result<String, StoreError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        (**self).set(key, value)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        (**self).delete(key)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryKeyValueStore {
    data: Arc<RwLock<HashMap<String, String>>>,
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<String, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        data.get(key).cloned().ok_or(StoreError::NotFound)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        data.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        if data.remove(key).is_none() {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

/// One file per key under a root directory.
///
/// Writes go to a temp file first and are renamed into place, so a crash
/// mid-write leaves the previous value intact.
#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    root: PathBuf,
}

impl FileKeyValueStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
            && !key.starts_with('.');
        if !valid {
            return Err(StoreError::Backend(format!("invalid store key '{key}'")));
        }
        Ok(self.root.join(format!("{}.json", key.replace(':', "__"))))
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<String, StoreError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(raw),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(err) => Err(StoreError::Backend(format!(
                "failed reading {}: {err}",
                path.display()
            ))),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        fs::create_dir_all(&self.root).map_err(|err| {
            StoreError::Unavailable(format!(
                "failed creating store directory {}: {err}",
                self.root.display()
            ))
        })?;

        let temp_path = temp_path_for(&path);
        fs::write(&temp_path, value).map_err(|err| {
            StoreError::Backend(format!(
                "failed writing temp file {}: {err}",
                temp_path.display()
            ))
        })?;

        if let Err(rename_err) = fs::rename(&temp_path, &path) {
            // Windows does not allow replacing existing files via rename.
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    let _ = fs::remove_file(&temp_path);
                    return Err(StoreError::Backend(format!(
                        "failed replacing {} after rename error ({rename_err}): {err}",
                        path.display()
                    )));
                }
            }
            fs::rename(&temp_path, &path).map_err(|err| {
                let _ = fs::remove_file(&temp_path);
                StoreError::Backend(format!(
                    "failed writing {} after temp write: {err}",
                    path.display()
                ))
            })?;
        }

        trace!(key, bytes = value.len(), "key-value entry written");
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(err) => Err(StoreError::Backend(format!(
                "failed deleting {}: {err}",
                path.display()
            ))),
        }
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("entry.json");
    parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()))
}

/// Prefixes every key with a fixed scope, e.g. one scope per account.
#[derive(Clone)]
pub struct ScopedKeyValueStore<S: KeyValueStore> {
    inner: S,
    scope: String,
}

impl<S: KeyValueStore> ScopedKeyValueStore<S> {
    pub fn new(inner: S, scope: impl Into<String>) -> Self {
        Self {
            inner,
            scope: scope.into(),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    fn scoped_key(&self, key: &str) -> String {
        format!("{}:{key}", self.scope)
    }
}

impl<S: KeyValueStore> KeyValueStore for ScopedKeyValueStore<S> {
    fn get(&self, key: &str) -> Result<String, StoreError> {
        self.inner.get(&self.scoped_key(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.set(&self.scoped_key(key), value)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(&self.scoped_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn unique_temp_dir(label: &str) -> PathBuf {
        env::temp_dir().join(format!("chat-platform-{label}-{}", Uuid::new_v4()))
    }

    #[test]
    fn in_memory_store_set_get_delete() {
        let store = InMemoryKeyValueStore::default();
        store.set("syncToken", "s72594_4483").expect("set");
        assert_eq!(store.get("syncToken").expect("get"), "s72594_4483");

        store.delete("syncToken").expect("delete");
        assert_eq!(store.get("syncToken"), Err(StoreError::NotFound));
        assert_eq!(store.delete("syncToken"), Err(StoreError::NotFound));
    }

    #[test]
    fn file_store_overwrites_and_clears() {
        let root = unique_temp_dir("file-store");
        let store = FileKeyValueStore::new(&root);

        assert_eq!(store.get("roomMessages"), Err(StoreError::NotFound));
        store.set("roomMessages", "{\"a\":1}").expect("first write");
        store.set("roomMessages", "{\"a\":2}").expect("overwrite");
        assert_eq!(store.get("roomMessages").expect("read"), "{\"a\":2}");

        store.delete("roomMessages").expect("delete");
        assert_eq!(store.get("roomMessages"), Err(StoreError::NotFound));

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn file_store_rejects_path_like_keys() {
        let store = FileKeyValueStore::new(unique_temp_dir("bad-keys"));
        for key in ["", "../escape", ".hidden", "a/b"] {
            let err = store.set(key, "x").expect_err("key should be rejected");
            assert!(matches!(err, StoreError::Backend(_)), "key {key:?}");
        }
    }

    #[test]
    fn scoped_store_isolates_accounts() {
        let shared = InMemoryKeyValueStore::default();
        let alice = ScopedKeyValueStore::new(shared.clone(), "alice");
        let bob = ScopedKeyValueStore::new(shared.clone(), "bob");

        alice.set("syncToken", "a-token").expect("alice set");
        assert_eq!(bob.get("syncToken"), Err(StoreError::NotFound));
        assert_eq!(shared.get("alice:syncToken").expect("raw"), "a-token");
    }

    #[test]
    fn file_store_accepts_scoped_keys() {
        let root = unique_temp_dir("scoped-file");
        let store = ScopedKeyValueStore::new(FileKeyValueStore::new(&root), "alice");
        store.set("lastReadTimestamps", "{}").expect("scoped write");
        assert_eq!(store.get("lastReadTimestamps").expect("scoped read"), "{}");
        let _ = fs::remove_dir_all(root);
    }
}
