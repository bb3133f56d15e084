//! Primary/secondary composite storage.
//!
//! Reads fall back from the primary to the secondary. Writes always land on the
//! primary; the secondary only receives them while sync is enabled, and a
//! failed secondary write is reported as a [`SecondaryWrite::Failed`] outcome
//! rather than an error.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::error::{Result, StorageError};
use super::traits::Storage;

/// What happened to the secondary half of a two-phase write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecondaryWrite {
    /// No secondary configured, or sync disabled.
    Skipped,
    Written,
    /// The primary write succeeded but the mirror did not.
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub keys_scanned: usize,
    pub scalars_copied: usize,
    pub lists_copied: usize,
}

pub struct HybridStorage {
    primary: Arc<dyn Storage>,
    secondary: Option<Arc<dyn Storage>>,
    sync: AtomicBool,
}

impl HybridStorage {
    /// Compose two backends. Sync starts disabled.
    pub fn new(primary: Arc<dyn Storage>, secondary: Option<Arc<dyn Storage>>) -> Self {
        Self {
            primary,
            secondary,
            sync: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_sync(self, enabled: bool) -> Self {
        self.sync.store(enabled, Ordering::SeqCst);
        self
    }

    pub fn enable_sync(&self) {
        self.sync.store(true, Ordering::SeqCst);
        tracing::info!("hybrid storage sync enabled");
    }

    pub fn disable_sync(&self) {
        self.sync.store(false, Ordering::SeqCst);
        tracing::info!("hybrid storage sync disabled");
    }

    pub fn sync_enabled(&self) -> bool {
        self.sync.load(Ordering::SeqCst)
    }

    pub fn primary(&self) -> &Arc<dyn Storage> {
        &self.primary
    }

    pub fn secondary(&self) -> Option<&Arc<dyn Storage>> {
        self.secondary.as_ref()
    }

    /// The secondary, but only while writes should be mirrored to it.
    fn mirror(&self) -> Option<&Arc<dyn Storage>> {
        self.secondary.as_ref().filter(|_| self.sync_enabled())
    }

    fn secondary_outcome(key: &str, op: &str, result: Result<()>) -> SecondaryWrite {
        match result {
            Ok(()) => SecondaryWrite::Written,
            Err(e) => {
                tracing::warn!(key, "secondary {op} failed: {e}");
                SecondaryWrite::Failed(e.to_string())
            }
        }
    }

    /// Write the primary (required) then mirror to the secondary (best effort).
    ///
    /// # Errors
    ///
    /// Returns the primary's error; secondary failures are only reported in
    /// the outcome.
    pub async fn set_with_outcome(
        &self,
        key: &str,
        value: Value,
        ttl_secs: Option<u64>,
    ) -> Result<SecondaryWrite> {
        let Some(secondary) = self.mirror() else {
            self.primary.set(key, value, ttl_secs).await?;
            return Ok(SecondaryWrite::Skipped);
        };
        self.primary.set(key, value.clone(), ttl_secs).await?;
        let result = secondary.set(key, value, ttl_secs).await;
        Ok(Self::secondary_outcome(key, "set", result))
    }

    /// List-append counterpart of [`Self::set_with_outcome`].
    pub async fn append_with_outcome(&self, key: &str, value: Value) -> Result<SecondaryWrite> {
        let Some(secondary) = self.mirror() else {
            self.primary.append_to_list(key, value).await?;
            return Ok(SecondaryWrite::Skipped);
        };
        self.primary.append_to_list(key, value.clone()).await?;
        let result = secondary.append_to_list(key, value).await;
        Ok(Self::secondary_outcome(key, "append", result))
    }

    /// Copy every primary key onto the secondary.
    ///
    /// Lists are replaced wholesale on the secondary, so re-running after a
    /// partial failure overwrites instead of duplicating entries. Nothing is
    /// removed from the primary. Scalar TTLs are not carried over.
    ///
    /// # Errors
    ///
    /// [`StorageError::NoSecondary`] without a secondary; otherwise the first
    /// failing read or write, leaving earlier keys copied.
    pub async fn migrate_to_secondary(&self) -> Result<MigrationReport> {
        let secondary = self.secondary.as_ref().ok_or(StorageError::NoSecondary)?;
        let mut report = MigrationReport::default();

        for key in self.primary.list_keys("*").await? {
            report.keys_scanned += 1;
            let scalar = self.primary.get(&key).await?;
            let list = self.primary.get_list(&key, 0, -1).await?;

            if !list.is_empty() {
                secondary.delete(&key).await?;
            }
            if let Some(value) = scalar {
                secondary.set(&key, value, None).await?;
                report.scalars_copied += 1;
            }
            if !list.is_empty() {
                for entry in list {
                    secondary.append_to_list(&key, entry).await?;
                }
                report.lists_copied += 1;
            }
        }

        tracing::info!(
            keys = report.keys_scanned,
            scalars = report.scalars_copied,
            lists = report.lists_copied,
            secondary = secondary.name(),
            "migration to secondary complete"
        );
        Ok(report)
    }
}

#[async_trait]
impl Storage for HybridStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        if let Some(value) = self.primary.get(key).await? {
            return Ok(Some(value));
        }
        let Some(secondary) = &self.secondary else {
            return Ok(None);
        };
        let Some(value) = secondary.get(key).await? else {
            return Ok(None);
        };

        if self.sync_enabled() {
            if let Err(e) = self.primary.set(key, value.clone(), None).await {
                tracing::warn!(key, "cache fill into primary failed: {e}");
            } else {
                tracing::debug!(key, "filled primary from secondary");
            }
        }
        Ok(Some(value))
    }

    async fn set(&self, key: &str, value: Value, ttl_secs: Option<u64>) -> Result<()> {
        self.set_with_outcome(key, value, ttl_secs).await.map(|_| ())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.primary.delete(key).await?;
        if let Some(secondary) = &self.secondary {
            secondary.delete(key).await?;
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        if self.primary.exists(key).await? {
            return Ok(true);
        }
        match &self.secondary {
            Some(secondary) => secondary.exists(key).await,
            None => Ok(false),
        }
    }

    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut keys: BTreeSet<String> = self.primary.list_keys(pattern).await?.into_iter().collect();
        if let Some(secondary) = &self.secondary {
            keys.extend(secondary.list_keys(pattern).await?);
        }
        Ok(keys.into_iter().collect())
    }

    async fn append_to_list(&self, key: &str, value: Value) -> Result<()> {
        self.append_with_outcome(key, value).await.map(|_| ())
    }

    async fn get_list(&self, key: &str, start: i64, end: i64) -> Result<Vec<Value>> {
        let values = self.primary.get_list(key, start, end).await?;
        if !values.is_empty() {
            return Ok(values);
        }
        match &self.secondary {
            Some(secondary) => secondary.get_list(key, start, end).await,
            None => Ok(values),
        }
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        let mut removed = self.primary.cleanup_expired().await?;
        if let Some(secondary) = &self.secondary {
            removed += secondary.cleanup_expired().await?;
        }
        Ok(removed)
    }

    fn name(&self) -> &str {
        "hybrid"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use serde_json::json;

    fn pair() -> (Arc<InMemoryStorage>, Arc<InMemoryStorage>) {
        (Arc::new(InMemoryStorage::new()), Arc::new(InMemoryStorage::new()))
    }

    fn hybrid(primary: &Arc<InMemoryStorage>, secondary: &Arc<InMemoryStorage>) -> HybridStorage {
        HybridStorage::new(primary.clone(), Some(secondary.clone() as Arc<dyn Storage>))
    }

    /// Backend whose every write fails.
    struct BrokenStorage;

    #[async_trait]
    impl Storage for BrokenStorage {
        async fn get(&self, _key: &str) -> Result<Option<Value>> {
            Ok(None)
        }
        async fn set(&self, _key: &str, _value: Value, _ttl: Option<u64>) -> Result<()> {
            Err(StorageError::backend("broken", "write refused"))
        }
        async fn delete(&self, _key: &str) -> Result<()> {
            Ok(())
        }
        async fn exists(&self, _key: &str) -> Result<bool> {
            Ok(false)
        }
        async fn list_keys(&self, _pattern: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn append_to_list(&self, _key: &str, _value: Value) -> Result<()> {
            Err(StorageError::backend("broken", "write refused"))
        }
        async fn get_list(&self, _key: &str, _s: i64, _e: i64) -> Result<Vec<Value>> {
            Ok(Vec::new())
        }
        fn name(&self) -> &str {
            "broken"
        }
    }

    #[tokio::test]
    async fn sync_is_off_by_default() {
        let (p, s) = pair();
        let store = hybrid(&p, &s);
        assert!(!store.sync_enabled());

        let outcome = store.set_with_outcome("k", json!(1), None).await.unwrap();
        assert_eq!(outcome, SecondaryWrite::Skipped);
        assert_eq!(p.get("k").await.unwrap(), Some(json!(1)));
        assert!(s.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sync_mirrors_writes() {
        let (p, s) = pair();
        let store = hybrid(&p, &s);
        store.enable_sync();

        assert_eq!(
            store.set_with_outcome("k", json!("v"), None).await.unwrap(),
            SecondaryWrite::Written
        );
        store.append_to_list("l", json!(1)).await.unwrap();
        assert_eq!(s.get("k").await.unwrap(), Some(json!("v")));
        assert_eq!(s.get_list("l", 0, -1).await.unwrap(), vec![json!(1)]);

        store.disable_sync();
        store.set("k2", json!(2), None).await.unwrap();
        assert!(s.get("k2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn secondary_failure_is_reported_not_raised() {
        let primary = Arc::new(InMemoryStorage::new());
        let store = HybridStorage::new(primary.clone(), Some(Arc::new(BrokenStorage))).with_sync(true);

        let outcome = store.set_with_outcome("k", json!(1), None).await.unwrap();
        assert!(matches!(outcome, SecondaryWrite::Failed(reason) if reason.contains("write refused")));
        assert_eq!(primary.get("k").await.unwrap(), Some(json!(1)));

        store.append_to_list("l", json!(1)).await.unwrap();
        assert_eq!(primary.get_list("l", 0, -1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn get_falls_back_to_secondary() {
        let (p, s) = pair();
        s.set("only_secondary", json!({"x": 1}), None).await.unwrap();
        let store = hybrid(&p, &s);

        assert_eq!(store.get("only_secondary").await.unwrap(), Some(json!({"x": 1})));
        // Without sync the primary is left alone.
        assert!(p.get("only_secondary").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fallback_read_fills_primary_when_synced() {
        let (p, s) = pair();
        s.set("k", json!("remote"), None).await.unwrap();
        let store = hybrid(&p, &s).with_sync(true);

        assert_eq!(store.get("k").await.unwrap(), Some(json!("remote")));
        assert_eq!(p.get("k").await.unwrap(), Some(json!("remote")));

        s.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!("remote")));
    }

    #[tokio::test]
    async fn exists_delete_and_list_keys_span_both() {
        let (p, s) = pair();
        p.set("a", json!(1), None).await.unwrap();
        s.set("b", json!(2), None).await.unwrap();
        s.set("a", json!(3), None).await.unwrap();
        let store = hybrid(&p, &s);

        assert!(store.exists("b").await.unwrap());
        assert_eq!(
            store.list_keys("*").await.unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );

        store.delete("a").await.unwrap();
        assert!(!p.exists("a").await.unwrap());
        assert!(!s.exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn get_list_falls_back_to_secondary() {
        let (p, s) = pair();
        s.append_to_list("l", json!("old")).await.unwrap();
        let store = hybrid(&p, &s);
        assert_eq!(store.get_list("l", 0, -1).await.unwrap(), vec![json!("old")]);
    }

    #[tokio::test]
    async fn migration_copies_scalars_and_lists() {
        let (p, s) = pair();
        p.set("conversation:1:context", json!({"id": "1"}), None).await.unwrap();
        p.append_to_list("conversation:1:messages", json!("m1")).await.unwrap();
        p.append_to_list("conversation:1:messages", json!("m2")).await.unwrap();
        let store = hybrid(&p, &s);

        let report = store.migrate_to_secondary().await.unwrap();
        assert_eq!(
            report,
            MigrationReport {
                keys_scanned: 2,
                scalars_copied: 1,
                lists_copied: 1,
            }
        );
        assert_eq!(
            s.get_list("conversation:1:messages", 0, -1).await.unwrap(),
            vec![json!("m1"), json!("m2")]
        );
        // Source untouched.
        assert!(p.exists("conversation:1:context").await.unwrap());

        // Re-running overwrites rather than duplicating list entries.
        store.migrate_to_secondary().await.unwrap();
        assert_eq!(s.get_list("conversation:1:messages", 0, -1).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn migration_requires_secondary() {
        let store = HybridStorage::new(Arc::new(InMemoryStorage::new()), None);
        assert!(matches!(
            store.migrate_to_secondary().await,
            Err(StorageError::NoSecondary)
        ));
    }
}
