//! In-memory storage backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

use super::error::Result;
use super::pattern::KeyPattern;
use super::traits::{slice_list, Storage};
use super::ttl::{expiry_from_now, TtlRegistry};

/// A process-local store backed by mutex-protected hash maps.
///
/// Useful for tests and as a hybrid primary in front of a remote store.
pub struct InMemoryStorage {
    values: Mutex<HashMap<String, Value>>,
    lists: Mutex<HashMap<String, Vec<Value>>>,
    ttl: TtlRegistry,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            lists: Mutex::new(HashMap::new()),
            ttl: TtlRegistry::new(),
        }
    }

    fn remove(&self, key: &str) {
        self.values.lock().remove(key);
        self.lists.lock().remove(key);
        self.ttl.clear(key);
    }

    /// Lazily drop `key` if its TTL has passed. Returns whether it was expired.
    fn purge_if_expired(&self, key: &str, now: DateTime<Utc>) -> bool {
        if self.ttl.is_expired(key, now) {
            self.remove(key);
            tracing::debug!(key, "expired key removed");
            true
        } else {
            false
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        if self.purge_if_expired(key, Utc::now()) {
            return Ok(None);
        }
        Ok(self.values.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value, ttl_secs: Option<u64>) -> Result<()> {
        self.values.lock().insert(key.to_string(), value);
        match ttl_secs {
            Some(secs) => self.ttl.register(key, expiry_from_now(secs)),
            None => self.ttl.clear(key),
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        if self.purge_if_expired(key, Utc::now()) {
            return Ok(false);
        }
        Ok(self.values.lock().contains_key(key) || self.lists.lock().contains_key(key))
    }

    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = KeyPattern::new(pattern);
        let now = Utc::now();
        let mut keys = BTreeSet::new();
        keys.extend(self.values.lock().keys().filter(|k| matcher.matches(k)).cloned());
        keys.extend(self.lists.lock().keys().filter(|k| matcher.matches(k)).cloned());
        Ok(keys
            .into_iter()
            .filter(|k| !self.ttl.is_expired(k, now))
            .collect())
    }

    async fn append_to_list(&self, key: &str, value: Value) -> Result<()> {
        self.purge_if_expired(key, Utc::now());
        self.lists
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(value);
        Ok(())
    }

    async fn get_list(&self, key: &str, start: i64, end: i64) -> Result<Vec<Value>> {
        if self.purge_if_expired(key, Utc::now()) {
            return Ok(Vec::new());
        }
        let lists = self.lists.lock();
        Ok(lists
            .get(key)
            .map(|values| slice_list(values, start, end))
            .unwrap_or_default())
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        let expired = self.ttl.expired_keys(Utc::now());
        for key in &expired {
            self.remove(key);
        }
        if !expired.is_empty() {
            tracing::info!(removed = expired.len(), "cleaned up expired keys");
        }
        Ok(expired.len())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
