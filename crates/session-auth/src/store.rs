//! Durable key-value storage for session data
//!
//! `KeyValueStore` is the only persistence contract the session layer relies
//! on: string keys, string values, all-or-nothing per key. Bulk removal is a
//! single call so clearing a session touches the backing medium once.
//!
//! `FileStore` keeps the whole map in memory and rewrites a JSON file on every
//! mutation using atomic temp-file + rename. A tokio Mutex serializes writes
//! from login, refresh, and logout.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Abstract durable key-value store.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn KeyValueStore>`).
pub trait KeyValueStore: Send + Sync {
    /// Read one key.
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>>;

    /// Write several keys in one operation.
    fn set_many<'a>(
        &'a self,
        entries: Vec<(&'a str, String)>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Remove several keys in one operation. Missing keys are ignored.
    fn remove_many<'a>(
        &'a self,
        keys: &'a [&'a str],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Write one key.
    fn set<'a>(
        &'a self,
        key: &'a str,
        value: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        self.set_many(vec![(key, value)])
    }

    /// Remove one key.
    fn remove<'a>(&'a self, key: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move { self.remove_many(&[key]).await })
    }
}

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    state: std::sync::Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        // A poisoned map is still a valid map
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KeyValueStore for MemoryStore {
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>> {
        let value = self.lock().get(key).cloned();
        Box::pin(async move { Ok(value) })
    }

    fn set_many<'a>(
        &'a self,
        entries: Vec<(&'a str, String)>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        let mut state = self.lock();
        for (key, value) in entries {
            state.insert(key.to_string(), value);
        }
        Box::pin(async { Ok(()) })
    }

    fn remove_many<'a>(
        &'a self,
        keys: &'a [&'a str],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        let mut state = self.lock();
        for key in keys {
            state.remove(*key);
        }
        Box::pin(async { Ok(()) })
    }
}

/// JSON-file backed store.
pub struct FileStore {
    path: PathBuf,
    state: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Load the store from the given file path.
    ///
    /// If the file doesn't exist, creates it as `{}` (first launch, nobody
    /// signed in yet).
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Store(format!("reading session file: {e}")))?;
            let entries: HashMap<String, String> = serde_json::from_str(&contents)
                .map_err(|e| Error::Serialization(format!("parsing session file: {e}")))?;
            info!(path = %path.display(), keys = entries.len(), "loaded session store");
            entries
        } else {
            info!(path = %path.display(), "session file not found, starting with empty store");
            let entries = HashMap::new();
            write_atomic(&path, &entries).await?;
            entries
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }
}

impl KeyValueStore for FileStore {
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>> {
        Box::pin(async move { Ok(self.state.lock().await.get(key).cloned()) })
    }

    fn set_many<'a>(
        &'a self,
        entries: Vec<(&'a str, String)>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            for (key, value) in entries {
                state.insert(key.to_string(), value);
            }
            write_atomic(&self.path, &state).await
        })
    }

    fn remove_many<'a>(
        &'a self,
        keys: &'a [&'a str],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let before = state.len();
            for key in keys {
                state.remove(*key);
            }
            if state.len() == before {
                return Ok(());
            }
            debug!(removed = before - state.len(), "removed session keys");
            write_atomic(&self.path, &state).await
        })
    }
}

/// Write the map to a file atomically.
///
/// Writes a temporary file in the same directory, then renames it over the
/// target. Permissions are 0600 since the file holds bearer credentials.
async fn write_atomic(path: &Path, data: &HashMap<String, String>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Serialization(format!("serializing session store: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Store("session path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".session.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Store(format!("writing temp session file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Store(format!("setting session file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Store(format!("renaming temp session file: {e}")))?;

    debug!(path = %path.display(), "persisted session store");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, SESSION_KEYS, TOKEN_EXPIRY_KEY};

    #[tokio::test]
    async fn memory_store_set_get_remove() {
        let store = MemoryStore::new();
        store.set(ACCESS_TOKEN_KEY, "at_1".into()).await.unwrap();
        assert_eq!(store.get(ACCESS_TOKEN_KEY).await.unwrap().as_deref(), Some("at_1"));

        store.remove(ACCESS_TOKEN_KEY).await.unwrap();
        assert!(store.get(ACCESS_TOKEN_KEY).await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn memory_store_bulk_remove_ignores_missing_keys() {
        let store = MemoryStore::new();
        store
            .set_many(vec![
                (ACCESS_TOKEN_KEY, "at".into()),
                (REFRESH_TOKEN_KEY, "rt".into()),
                ("unrelated", "keep".into()),
            ])
            .await
            .unwrap();

        store.remove_many(SESSION_KEYS).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("unrelated").await.unwrap().as_deref(), Some("keep"));
    }

    #[tokio::test]
    async fn file_store_roundtrip_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let store = FileStore::load(path.clone()).await.unwrap();
        store
            .set_many(vec![
                (ACCESS_TOKEN_KEY, "at_1".into()),
                (TOKEN_EXPIRY_KEY, "1735500000000".into()),
            ])
            .await
            .unwrap();

        let reloaded = FileStore::load(path).await.unwrap();
        assert_eq!(reloaded.get(ACCESS_TOKEN_KEY).await.unwrap().as_deref(), Some("at_1"));
        assert_eq!(
            reloaded.get(TOKEN_EXPIRY_KEY).await.unwrap().as_deref(),
            Some("1735500000000")
        );
    }

    #[tokio::test]
    async fn file_store_cold_start_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        assert!(!path.exists());
        let store = FileStore::load(path.clone()).await.unwrap();
        assert!(path.exists());
        assert!(store.get(ACCESS_TOKEN_KEY).await.unwrap().is_none());

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: HashMap<String, String> = serde_json::from_str(&contents).unwrap();
        assert!(parsed.is_empty());
    }

    #[tokio::test]
    async fn file_store_bulk_remove_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let store = FileStore::load(path.clone()).await.unwrap();
        store
            .set_many(vec![
                (ACCESS_TOKEN_KEY, "at".into()),
                (REFRESH_TOKEN_KEY, "rt".into()),
            ])
            .await
            .unwrap();
        store.remove_many(SESSION_KEYS).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: HashMap<String, String> = serde_json::from_str(&contents).unwrap();
        assert!(parsed.is_empty(), "got: {parsed:?}");
    }

    #[tokio::test]
    async fn file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let result = FileStore::load(path).await;
        assert!(matches!(result, Err(Error::Serialization(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let store = FileStore::load(path.clone()).await.unwrap();
        store.set(ACCESS_TOKEN_KEY, "at".into()).await.unwrap();

        let metadata = tokio::fs::metadata(&path).await.unwrap();
        let mode = metadata.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "session file must be 0600, got {mode:o}");
    }
}
