// Filesystem-backed key-value store: one file per key

use crate::errors::StorageError;
use crate::storage::KeyValueStore;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};

const EXTENSION: &str = "entry";

/// Directory of `<sha256(key)>.entry` files
///
/// File names have a fixed length whatever the key. Each file starts with
/// the key as a JSON string on its own line, followed by the value bytes.
/// Writes go through a temporary file and `rename`.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `dir`
    #[instrument(skip_all, fields(dir = %dir.as_ref().display()))]
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            StorageError::Unavailable(format!("cannot create {}: {}", dir.display(), e))
        })?;

        let metadata = tokio::fs::metadata(&dir).await.map_err(|e| {
            StorageError::Unavailable(format!("cannot stat {}: {}", dir.display(), e))
        })?;
        if !metadata.is_dir() {
            return Err(StorageError::Unavailable(format!(
                "{} is not a directory",
                dir.display()
            )));
        }

        debug!("File store opened");
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", file_stem(key), EXTENSION))
    }

    fn temp_path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!(
            ".{}.{}.tmp",
            file_stem(key),
            uuid::Uuid::new_v4().simple()
        ))
    }
}

fn file_stem(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

fn encode(key: &str, value: &[u8]) -> Result<Vec<u8>, StorageError> {
    let mut bytes = serde_json::to_vec(key)?;
    bytes.push(b'\n');
    bytes.extend_from_slice(value);
    Ok(bytes)
}

/// Split a stored file into its key header and value
fn decode(bytes: &[u8]) -> Option<(String, &[u8])> {
    let newline = bytes.iter().position(|b| *b == b'\n')?;
    let key: String = serde_json::from_slice(&bytes[..newline]).ok()?;
    Some((key, &bytes[newline + 1..]))
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let bytes = match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match decode(&bytes) {
            Some((stored_key, value)) if stored_key == key => Ok(Some(value.to_vec())),
            Some((stored_key, _)) => Err(StorageError::Corrupt {
                key: key.to_string(),
                reason: format!("file holds key '{}'", stored_key),
            }),
            None => Err(StorageError::Corrupt {
                key: key.to_string(),
                reason: "missing key header".to_string(),
            }),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let temp = self.temp_path_for(key);
        let target = self.path_for(key);
        let bytes = encode(key, value)?;

        if let Err(e) = tokio::fs::write(&temp, &bytes).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(|e| {
            StorageError::Unavailable(format!("cannot list {}: {}", self.dir.display(), e))
        })?;

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if file_name.starts_with('.') {
                continue;
            }
            if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
                warn!(file = %file_name, "Ignoring unrecognised file in store");
                continue;
            }

            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(file = %file_name, error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            match decode(&bytes) {
                Some((key, _)) => keys.push(key),
                None => warn!(file = %file_name, "Skipping entry without key header"),
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        assert_eq!(store.get("demo").await.unwrap(), None);
        store.put("demo", b"{\"a\":1}").await.unwrap();
        assert_eq!(store.get("demo").await.unwrap(), Some(b"{\"a\":1}".to_vec()));

        store.delete("demo").await.unwrap();
        assert_eq!(store.get("demo").await.unwrap(), None);
        // Deleting twice is fine
        store.delete("demo").await.unwrap();
    }

    #[tokio::test]
    async fn test_keys_round_trip_unsafe_characters() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        store.put("group/42:chat", b"[]").await.unwrap();
        store.put("用户", b"[]").await.unwrap();

        let keys = store.keys().await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&"group/42:chat".to_string()));
        assert!(keys.contains(&"用户".to_string()));
    }

    #[tokio::test]
    async fn test_keys_skip_foreign_and_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        store.put("demo", b"1").await.unwrap();

        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::write(dir.path().join(".partial.tmp"), b"x").unwrap();
        std::fs::write(dir.path().join("headless.entry"), b"x").unwrap();

        assert_eq!(store.keys().await.unwrap(), vec!["demo".to_string()]);
    }

    #[tokio::test]
    async fn test_long_keys_fit_in_file_names() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let key = format!("aiocqhttp:GroupMessage:{}", "用户".repeat(40));
        assert!(key.len() > 200);

        store.put(&key, b"{\"sites\":{}}").await.unwrap();
        assert_eq!(
            store.get(&key).await.unwrap(),
            Some(b"{\"sites\":{}}".to_vec())
        );
        assert_eq!(store.keys().await.unwrap(), vec![key.clone()]);

        store.delete(&key).await.unwrap();
        assert!(store.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_entry_without_header_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        std::fs::write(store.path_for("demo"), b"{\"a\":1}").unwrap();

        let result = store.get("demo").await;
        assert!(matches!(result, Err(StorageError::Corrupt { .. })));
        assert!(store.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileStore::open(dir.path()).await.unwrap();
            store.put("demo", b"42").await.unwrap();
        }
        let reopened = FileStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.get("demo").await.unwrap(), Some(b"42".to_vec()));
    }

    #[tokio::test]
    async fn test_open_on_regular_file_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("occupied");
        std::fs::write(&file, b"x").unwrap();

        let result = FileStore::open(&file).await;
        assert!(matches!(result, Err(StorageError::Unavailable(_))));
    }
}
