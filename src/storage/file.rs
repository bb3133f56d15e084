//! File-backed storage: one JSON record per scalar key and one per list key.
//!
//! Layout under the base directory:
//!
//! ```text
//! values/<encoded key>.json   {"key", "value", "created_at", "ttl", "expires_at"}
//! lists/<encoded key>.json    {"key", "values", "updated_at"}
//! ```
//!
//! Key encoding is reversible (percent-encoding), so `list_keys` never has to
//! open a record. Durability is limited to a single process on a single host.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::error::{Result, StorageError};
use super::locks::KeyLocks;
use super::pattern::KeyPattern;
use super::traits::{slice_list, Storage};
use super::ttl::{expiry_from_now, TtlRegistry};

const VALUES_DIR: &str = "values";
const LISTS_DIR: &str = "lists";
const RECORD_EXT: &str = ".json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ValueRecord {
    key: String,
    value: Value,
    created_at: DateTime<Utc>,
    #[serde(default)]
    ttl: Option<u64>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ListRecord {
    key: String,
    values: Vec<Value>,
    updated_at: DateTime<Utc>,
}

/// Storage rooted in a directory on the local filesystem.
pub struct FileStorage {
    base_dir: PathBuf,
    ttl: TtlRegistry,
    locks: KeyLocks,
}

impl FileStorage {
    /// Open (or create) a store under `base_dir`.
    ///
    /// Expiry instants persisted by a previous process are loaded back into
    /// the TTL registry.
    pub async fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        for sub in [VALUES_DIR, LISTS_DIR] {
            let dir = base_dir.join(sub);
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| StorageError::io(dir.display().to_string(), e))?;
        }

        let store = Self {
            base_dir,
            ttl: TtlRegistry::new(),
            locks: KeyLocks::default(),
        };
        let restored = store.hydrate_ttl().await?;
        tracing::info!(
            path = %store.base_dir.display(),
            ttl_keys = restored,
            "file storage opened"
        );
        Ok(store)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn encode_key(key: &str) -> String {
        format!("{}{RECORD_EXT}", urlencoding::encode(key))
    }

    fn decode_file_name(name: &str) -> Option<String> {
        let stem = name.strip_suffix(RECORD_EXT)?;
        urlencoding::decode(stem).ok().map(|k| k.into_owned())
    }

    fn value_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(VALUES_DIR).join(Self::encode_key(key))
    }

    fn list_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(LISTS_DIR).join(Self::encode_key(key))
    }

    async fn hydrate_ttl(&self) -> Result<usize> {
        let mut restored = 0;
        for key in self.scan_dir(VALUES_DIR).await? {
            match self.read_value(&key).await {
                Ok(Some(ValueRecord {
                    expires_at: Some(at),
                    ..
                })) => {
                    self.ttl.register(&key, at);
                    restored += 1;
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(key = %key, "skipping unreadable record: {e}"),
            }
        }
        Ok(restored)
    }

    async fn scan_dir(&self, sub: &str) -> Result<Vec<String>> {
        let dir = self.base_dir.join(sub);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(dir.display().to_string(), e)),
        };
        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(dir.display().to_string(), e))?
        {
            let name = entry.file_name();
            if let Some(key) = name.to_str().and_then(Self::decode_file_name) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    async fn read_json<T: DeserializeOwned>(key: &str, path: &Path) -> Result<Option<T>> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                tracing::error!(key, "failed to read record: {e}");
                return Err(StorageError::io(key, e));
            }
        };
        serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            tracing::error!(key, "malformed record: {e}");
            StorageError::serialization(key, e)
        })
    }

    async fn write_json<T: Serialize>(key: &str, path: &Path, record: &T) -> Result<()> {
        let bytes =
            serde_json::to_vec_pretty(record).map_err(|e| StorageError::serialization(key, e))?;
        let tmp = path.with_extension("json.tmp");
        let written = async {
            fs::write(&tmp, &bytes).await?;
            fs::rename(&tmp, path).await
        }
        .await;
        written.map_err(|e| {
            tracing::error!(key, "failed to write record: {e}");
            StorageError::io(key, e)
        })
    }

    async fn read_value(&self, key: &str) -> Result<Option<ValueRecord>> {
        Self::read_json(key, &self.value_path(key)).await
    }

    async fn read_list(&self, key: &str) -> Result<Option<ListRecord>> {
        Self::read_json(key, &self.list_path(key)).await
    }

    async fn remove_file(key: &str, path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                tracing::error!(key, "failed to delete record: {e}");
                Err(StorageError::io(key, e))
            }
        }
    }

    async fn remove_unlocked(&self, key: &str) -> Result<()> {
        Self::remove_file(key, &self.value_path(key)).await?;
        Self::remove_file(key, &self.list_path(key)).await?;
        self.ttl.clear(key);
        Ok(())
    }

    /// Drop `key` if its TTL has passed. Returns whether it was expired.
    async fn purge_if_expired(&self, key: &str) -> Result<bool> {
        if !self.ttl.is_expired(key, Utc::now()) {
            return Ok(false);
        }
        let _guard = self.locks.acquire(key).await;
        // Re-check under the lock: a concurrent `set` may have refreshed it.
        if !self.ttl.is_expired(key, Utc::now()) {
            return Ok(false);
        }
        self.remove_unlocked(key).await?;
        tracing::debug!(key, "expired key removed");
        Ok(true)
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        if self.purge_if_expired(key).await? {
            return Ok(None);
        }
        Ok(self.read_value(key).await?.map(|record| record.value))
    }

    async fn set(&self, key: &str, value: Value, ttl_secs: Option<u64>) -> Result<()> {
        let _guard = self.locks.acquire(key).await;
        let expires_at = ttl_secs.map(expiry_from_now);
        let record = ValueRecord {
            key: key.to_string(),
            value,
            created_at: Utc::now(),
            ttl: ttl_secs,
            expires_at,
        };
        Self::write_json(key, &self.value_path(key), &record).await?;
        match expires_at {
            Some(at) => self.ttl.register(key, at),
            None => self.ttl.clear(key),
        }
        tracing::debug!(key, ttl = ?ttl_secs, "set key");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.locks.acquire(key).await;
        self.remove_unlocked(key).await?;
        tracing::debug!(key, "deleted key");
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        if self.purge_if_expired(key).await? {
            return Ok(false);
        }
        for path in [self.value_path(key), self.list_path(key)] {
            if fs::try_exists(&path)
                .await
                .map_err(|e| StorageError::io(key, e))?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = KeyPattern::new(pattern);
        let now = Utc::now();
        let mut keys = BTreeSet::new();
        for sub in [VALUES_DIR, LISTS_DIR] {
            keys.extend(
                self.scan_dir(sub)
                    .await?
                    .into_iter()
                    .filter(|k| matcher.matches(k) && !self.ttl.is_expired(k, now)),
            );
        }
        Ok(keys.into_iter().collect())
    }

    async fn append_to_list(&self, key: &str, value: Value) -> Result<()> {
        self.purge_if_expired(key).await?;
        let _guard = self.locks.acquire(key).await;
        let mut values = self
            .read_list(key)
            .await?
            .map(|record| record.values)
            .unwrap_or_default();
        values.push(value);
        let record = ListRecord {
            key: key.to_string(),
            values,
            updated_at: Utc::now(),
        };
        Self::write_json(key, &self.list_path(key), &record).await?;
        tracing::debug!(key, len = record.values.len(), "appended to list");
        Ok(())
    }

    async fn get_list(&self, key: &str, start: i64, end: i64) -> Result<Vec<Value>> {
        if self.purge_if_expired(key).await? {
            return Ok(Vec::new());
        }
        Ok(self
            .read_list(key)
            .await?
            .map(|record| slice_list(&record.values, start, end))
            .unwrap_or_default())
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        let expired = self.ttl.expired_keys(Utc::now());
        for key in &expired {
            let _guard = self.locks.acquire(key).await;
            self.remove_unlocked(key).await?;
        }
        tracing::info!(removed = expired.len(), "cleaned up expired keys");
        Ok(expired.len())
    }

    fn name(&self) -> &str {
        "file"
    }
}
