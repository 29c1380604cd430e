//! Storage collaborator for flow state
//!
//! The engine persists one JSON value per key through [`Storage`]. Keys are
//! namespaced per configuration by the caller; values are opaque here.
//!
//! [`FileStorage`] keeps a JSON object on disk. All writes use atomic
//! temp-file + rename to prevent corruption on crash, and a tokio Mutex
//! serializes concurrent writers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::transport::BoxFuture;

/// Key/value persistence for flow state.
pub trait Storage: Send + Sync {
    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>>>;

    fn write<'a>(&'a self, key: &'a str, value: Value) -> BoxFuture<'a, Result<()>>;

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// Process-local storage. State does not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>>> {
        Box::pin(async move { Ok(self.entries.lock().await.get(key).cloned()) })
    }

    fn write<'a>(&'a self, key: &'a str, value: Value) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.entries.lock().await.insert(key.to_owned(), value);
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.entries.lock().await.remove(key);
            Ok(())
        })
    }
}

/// JSON file storage, mode 0600.
pub struct FileStorage {
    path: PathBuf,
    state: Mutex<HashMap<String, Value>>,
}

impl FileStorage {
    /// Load the storage file, creating it as `{}` if it does not exist.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Storage(format!("reading storage file: {e}")))?;
            let entries: HashMap<String, Value> = serde_json::from_str(&contents)
                .map_err(|e| Error::Storage(format!("parsing storage file: {e}")))?;
            info!(path = %path.display(), keys = entries.len(), "loaded flow state storage");
            entries
        } else {
            info!(path = %path.display(), "storage file not found, starting empty");
            let entries = HashMap::new();
            write_atomic(&path, &entries).await?;
            entries
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Storage for FileStorage {
    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>>> {
        Box::pin(async move { Ok(self.state.lock().await.get(key).cloned()) })
    }

    fn write<'a>(&'a self, key: &'a str, value: Value) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.insert(key.to_owned(), value);
            debug!(key, "stored value");
            write_atomic(&self.path, &state).await
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.remove(key).is_some() {
                debug!(key, "removed value");
                write_atomic(&self.path, &state).await?;
            }
            Ok(())
        })
    }
}

async fn write_atomic(path: &Path, data: &HashMap<String, Value>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Storage(format!("serializing storage: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Storage("storage path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".oidc-storage.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Storage(format!("writing temp storage file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Storage(format!("setting storage file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Storage(format!("renaming temp storage file: {e}")))?;

    debug!(path = %path.display(), "persisted storage");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn memory_storage_roundtrip() {
        let storage = MemoryStorage::new();
        assert!(storage.read("spa").await.unwrap().is_none());
        storage.write("spa", json!({"nonce": "n"})).await.unwrap();
        assert_eq!(storage.read("spa").await.unwrap(), Some(json!({"nonce": "n"})));
        storage.remove("spa").await.unwrap();
        assert!(storage.read("spa").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_storage_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow-state.json");

        let storage = FileStorage::load(path.clone()).await.unwrap();
        storage.write("spa", json!({"state_control": "s1"})).await.unwrap();

        let reloaded = FileStorage::load(path).await.unwrap();
        assert_eq!(
            reloaded.read("spa").await.unwrap(),
            Some(json!({"state_control": "s1"}))
        );
    }

    #[tokio::test]
    async fn cold_start_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow-state.json");
        assert!(!path.exists());

        let storage = FileStorage::load(path.clone()).await.unwrap();
        assert!(storage.read("anything").await.unwrap().is_none());
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.trim(), "{}");
    }

    #[tokio::test]
    async fn corrupt_file_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow-state.json");
        tokio::fs::write(&path, "not json").await.unwrap();
        let err = FileStorage::load(path).await.err().unwrap();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow-state.json");
        let storage = FileStorage::load(path.clone()).await.unwrap();
        storage.write("spa", json!({})).await.unwrap();

        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "storage file must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn concurrent_writes_dont_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow-state.json");
        let storage = Arc::new(FileStorage::load(path.clone()).await.unwrap());

        let mut handles = vec![];
        for i in 0..10 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                storage.write(&format!("config-{i}"), json!({"i": i})).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: HashMap<String, Value> = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.len(), 10);
    }
}
