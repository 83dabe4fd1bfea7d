//! Local key-value persistence
//!
//! Holds the state that must survive restarts but never leaves the device:
//! the pending-operation journal, recovery tokens, escrow records and
//! derivation counters. Values are JSON strings.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

use super::signer::ContentCipher;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LocalStoreError {
    #[error("io: {0}")]
    Io(String),
    #[error("corrupt entry {key}: {message}")]
    Corrupt { key: String, message: String },
    #[error("encryption: {0}")]
    Encryption(String),
}

/// Local persistence consumed by the journal, safety net and escrow registry
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, LocalStoreError>;
    async fn put(&self, key: &str, value: String) -> Result<(), LocalStoreError>;
    async fn delete(&self, key: &str) -> Result<(), LocalStoreError>;
    /// All entries whose key starts with `prefix`, ordered by key
    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, LocalStoreError>;
}

/// Read and deserialize a JSON value
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn LocalStore,
    key: &str,
) -> Result<Option<T>, LocalStoreError> {
    match store.get(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| LocalStoreError::Corrupt {
                key: key.to_string(),
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}

/// Serialize and write a JSON value
pub async fn put_json<T: Serialize>(
    store: &dyn LocalStore,
    key: &str,
    value: &T,
) -> Result<(), LocalStoreError> {
    let raw = serde_json::to_string(value).map_err(|e| LocalStoreError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })?;
    store.put(key, raw).await
}

/// Deserialize every entry under `prefix`, skipping (and logging) corrupt ones
pub async fn list_json<T: DeserializeOwned>(
    store: &dyn LocalStore,
    prefix: &str,
) -> Result<Vec<T>, LocalStoreError> {
    let mut out = Vec::new();
    for (key, raw) in store.list(prefix).await? {
        match serde_json::from_str(&raw) {
            Ok(value) => out.push(value),
            Err(e) => log::warn!("Skipping corrupt local entry {}: {}", key, e),
        }
    }
    Ok(out)
}

// =============================================================================
// File-backed adapter
// =============================================================================

/// Single-file store: the whole map is encrypted to the wallet owner and
/// rewritten atomically (temp file + rename) on every mutation
pub struct FileLocalStore {
    path: PathBuf,
    cipher: Arc<dyn ContentCipher>,
    entries: Mutex<Option<BTreeMap<String, String>>>,
}

impl FileLocalStore {
    pub fn new(path: impl Into<PathBuf>, cipher: Arc<dyn ContentCipher>) -> Self {
        Self {
            path: path.into(),
            cipher,
            entries: Mutex::new(None),
        }
    }

    async fn load(&self) -> Result<BTreeMap<String, String>, LocalStoreError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(LocalStoreError::Io(e.to_string())),
        };
        let plaintext = self
            .cipher
            .decrypt(raw.trim())
            .await
            .map_err(|e| LocalStoreError::Encryption(e.to_string()))?;
        serde_json::from_str(&plaintext).map_err(|e| LocalStoreError::Corrupt {
            key: self.path.display().to_string(),
            message: e.to_string(),
        })
    }

    async fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), LocalStoreError> {
        let plaintext = serde_json::to_string(entries).map_err(|e| LocalStoreError::Corrupt {
            key: self.path.display().to_string(),
            message: e.to_string(),
        })?;
        let ciphertext = self
            .cipher
            .encrypt(&plaintext)
            .await
            .map_err(|e| LocalStoreError::Encryption(e.to_string()))?;

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, ciphertext)
            .await
            .map_err(|e| LocalStoreError::Io(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| LocalStoreError::Io(e.to_string()))
    }

    async fn with_entries<R>(
        &self,
        mutate: bool,
        f: impl FnOnce(&mut BTreeMap<String, String>) -> R,
    ) -> Result<R, LocalStoreError> {
        let mut guard = self.entries.lock().await;
        if guard.is_none() {
            *guard = Some(self.load().await?);
        }
        let entries = match guard.as_mut() {
            Some(entries) => entries,
            None => return Err(LocalStoreError::Io("store not loaded".to_string())),
        };
        let result = f(entries);
        if mutate {
            self.persist(entries).await?;
        }
        Ok(result)
    }
}

#[async_trait]
impl LocalStore for FileLocalStore {
    async fn get(&self, key: &str) -> Result<Option<String>, LocalStoreError> {
        self.with_entries(false, |entries| entries.get(key).cloned())
            .await
    }

    async fn put(&self, key: &str, value: String) -> Result<(), LocalStoreError> {
        self.with_entries(true, |entries| {
            entries.insert(key.to_string(), value);
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), LocalStoreError> {
        self.with_entries(true, |entries| {
            entries.remove(key);
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, LocalStoreError> {
        self.with_entries(false, |entries| {
            entries
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::signer::Nip44Cipher;
    use nostr::Keys;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Entry {
        amount: u64,
    }

    #[tokio::test]
    async fn test_file_store_persists_encrypted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.db");
        let cipher: Arc<dyn ContentCipher> = Arc::new(Nip44Cipher::from_keys(Keys::generate()));

        let store = FileLocalStore::new(&path, cipher.clone());
        put_json(&store, "op:1", &Entry { amount: 5 }).await.unwrap();
        put_json(&store, "op:2", &Entry { amount: 7 }).await.unwrap();
        put_json(&store, "other", &Entry { amount: 9 }).await.unwrap();
        store.delete("op:2").await.unwrap();

        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(!on_disk.contains("amount"));

        let reopened = FileLocalStore::new(&path, cipher);
        let ops: Vec<Entry> = list_json(&reopened, "op:").await.unwrap();
        assert_eq!(ops, vec![Entry { amount: 5 }]);
        let other: Option<Entry> = get_json(&reopened, "other").await.unwrap();
        assert_eq!(other, Some(Entry { amount: 9 }));
        assert_eq!(reopened.get("missing").await.unwrap(), None);
    }
}
