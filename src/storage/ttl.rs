use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Absolute expiry instant for a TTL given in seconds, saturating on overflow.
pub fn expiry_from_now(ttl_secs: u64) -> DateTime<Utc> {
    let secs = i64::try_from(ttl_secs).unwrap_or(i64::MAX);
    TimeDelta::try_seconds(secs)
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Expiry instants for keys written with a TTL.
///
/// Owned by one backend instance. Entries are dropped when the key is
/// rewritten without a TTL, deleted, or swept by `cleanup_expired`.
#[derive(Debug, Default)]
pub struct TtlRegistry {
    expiries: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl TtlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: &str, expires_at: DateTime<Utc>) {
        self.expiries.lock().insert(key.to_string(), expires_at);
    }

    pub fn clear(&self, key: &str) {
        self.expiries.lock().remove(key);
    }

    pub fn expiry(&self, key: &str) -> Option<DateTime<Utc>> {
        self.expiries.lock().get(key).copied()
    }

    pub fn is_expired(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.expiries
            .lock()
            .get(key)
            .is_some_and(|expires_at| now >= *expires_at)
    }

    pub fn expired_keys(&self, now: DateTime<Utc>) -> Vec<String> {
        self.expiries
            .lock()
            .iter()
            .filter(|(_, expires_at)| now >= **expires_at)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.expiries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
