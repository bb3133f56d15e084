//! Redis-backed storage.
//!
//! Scalars are stored as JSON strings (`SET`/`SETEX`), lists as Redis lists
//! of JSON strings (`RPUSH`/`LRANGE`). Expiry is enforced by the server.
//!
//! A logical key may hold a scalar and a list at the same time, as on the
//! other backends. The list lives under the physical key `<key>:__list`, so
//! logical keys must not end with that suffix.

use async_trait::async_trait;
use serde_json::Value;

use super::error::{Result, StorageError};
use super::pattern::KeyPattern;
use super::traits::Storage;

const BACKEND: &str = "redis";
const LIST_SUFFIX: &str = ":__list";

fn backend_err(op: &str, e: impl std::fmt::Display) -> StorageError {
    tracing::error!("Redis {op} failed: {e}");
    StorageError::backend(BACKEND, format!("{op} failed: {e}"))
}

pub struct RedisStorage {
    client: redis::Client,
    /// Namespace prepended to every logical key.
    prefix: String,
}

impl RedisStorage {
    /// Create a store for `redis_url` with no key prefix.
    ///
    /// # Errors
    ///
    /// Returns error if the Redis URL is invalid
    pub fn new(redis_url: &str) -> Result<Self> {
        Self::with_prefix(redis_url, "")
    }

    /// Create a store whose keys are namespaced under `prefix`.
    pub fn with_prefix(redis_url: &str, prefix: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| backend_err("open", e))?;
        Ok(Self {
            client,
            prefix: prefix.to_string(),
        })
    }

    fn build_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn build_list_key(&self, key: &str) -> String {
        format!("{}{}{LIST_SUFFIX}", self.prefix, key)
    }

    /// Logical key for a physical key returned by `KEYS`.
    fn logical_key<'a>(&self, physical: &'a str) -> Option<&'a str> {
        let key = physical.strip_prefix(self.prefix.as_str())?;
        Some(key.strip_suffix(LIST_SUFFIX).unwrap_or(key))
    }

    async fn keys(conn: &mut redis::aio::MultiplexedConnection, pattern: &str) -> Result<Vec<String>> {
        redis::cmd("KEYS")
            .arg(pattern)
            .query_async(conn)
            .await
            .map_err(|e| backend_err("KEYS", e))
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| backend_err("connect", e))
    }

    fn encode(key: &str, value: &Value) -> Result<String> {
        serde_json::to_string(value).map_err(|e| StorageError::serialization(key, e))
    }

    fn decode(key: &str, raw: &str) -> Result<Value> {
        serde_json::from_str(raw).map_err(|e| StorageError::serialization(key, e))
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut conn = self.connection().await?;
        let data: Option<String> = redis::cmd("GET")
            .arg(self.build_key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_err("GET", e))?;
        data.map(|raw| Self::decode(key, &raw)).transpose()
    }

    async fn set(&self, key: &str, value: Value, ttl_secs: Option<u64>) -> Result<()> {
        let mut conn = self.connection().await?;
        let full_key = self.build_key(key);
        let json = Self::encode(key, &value)?;

        match ttl_secs {
            // SETEX rejects a zero expiry; the value would be dead on arrival anyway.
            Some(0) => {
                redis::cmd("DEL")
                    .arg(&full_key)
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(|e| backend_err("DEL", e))?;
            }
            Some(ttl) => {
                redis::cmd("SETEX")
                    .arg(&full_key)
                    .arg(ttl)
                    .arg(&json)
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(|e| backend_err("SETEX", e))?;
            }
            None => {
                redis::cmd("SET")
                    .arg(&full_key)
                    .arg(&json)
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(|e| backend_err("SET", e))?;
            }
        }

        tracing::debug!(key, ttl = ?ttl_secs, "set key in Redis");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let deleted: i64 = redis::cmd("DEL")
            .arg(self.build_key(key))
            .arg(self.build_list_key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_err("DEL", e))?;
        tracing::debug!(key, deleted = deleted > 0, "deleted key from Redis");
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let exists: i64 = redis::cmd("EXISTS")
            .arg(self.build_key(key))
            .arg(self.build_list_key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_err("EXISTS", e))?;
        Ok(exists > 0)
    }

    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let mut physical = Self::keys(&mut conn, &self.build_key(pattern)).await?;
        physical.extend(Self::keys(&mut conn, &self.build_list_key(pattern)).await?);

        let matcher = KeyPattern::new(pattern);
        let mut logical: Vec<String> = physical
            .iter()
            .filter_map(|k| self.logical_key(k))
            .filter(|k| matcher.matches(k))
            .map(str::to_string)
            .collect();
        logical.sort();
        logical.dedup();
        Ok(logical)
    }

    async fn append_to_list(&self, key: &str, value: Value) -> Result<()> {
        let mut conn = self.connection().await?;
        let json = Self::encode(key, &value)?;
        let len: i64 = redis::cmd("RPUSH")
            .arg(self.build_list_key(key))
            .arg(&json)
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_err("RPUSH", e))?;
        tracing::debug!(key, len, "appended to Redis list");
        Ok(())
    }

    async fn get_list(&self, key: &str, start: i64, end: i64) -> Result<Vec<Value>> {
        let mut conn = self.connection().await?;
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(self.build_list_key(key))
            .arg(start)
            .arg(end)
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_err("LRANGE", e))?;
        raw.iter().map(|r| Self::decode(key, r)).collect()
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        // Redis expires keys itself.
        tracing::debug!("Redis TTL handles key expiration automatically");
        Ok(0)
    }

    fn name(&self) -> &str {
        BACKEND
    }
}
