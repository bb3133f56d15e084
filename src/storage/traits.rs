//! Storage contract shared by every backend: scalar values with optional TTL,
//! append-only lists, and glob-style key enumeration.

use async_trait::async_trait;
use serde_json::Value;
use std::ops::Range;

use super::error::Result;

/// Key/value + key/list storage.
///
/// Expired keys are never observable: `get`, `exists` and `list_keys` all
/// check expiry before reporting a key. Backends may delete lazily on access.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read a scalar value. `None` when missing, deleted or expired.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Overwrite a scalar value. `ttl_secs` makes it unreadable after `now + ttl`.
    async fn set(&self, key: &str, value: Value, ttl_secs: Option<u64>) -> Result<()>;

    /// Remove both the scalar and the list stored under `key`. Idempotent.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Whether a live scalar or list exists under `key`.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Keys matching a glob-style `pattern` (`*` wildcard), sorted, expired keys excluded.
    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Append to the end of the list under `key`, creating it if absent.
    ///
    /// Appends to the same key never lose entries under concurrency.
    async fn append_to_list(&self, key: &str, value: Value) -> Result<()>;

    /// Inclusive `[start, end]` slice of the list, `LRANGE` index semantics.
    /// A missing list yields an empty vector.
    async fn get_list(&self, key: &str, start: i64, end: i64) -> Result<Vec<Value>>;

    /// Drop every key whose TTL has elapsed. Returns the number removed.
    async fn cleanup_expired(&self) -> Result<usize> {
        Ok(0)
    }

    /// The name of this storage implementation.
    fn name(&self) -> &str;
}

/// Resolve an inclusive `LRANGE`-style `[start, end]` pair against a list of
/// length `len`. Negative indices count from the tail (`-1` is the last element).
pub fn list_range(len: usize, start: i64, end: i64) -> Option<Range<usize>> {
    let len = i64::try_from(len).ok()?;
    if len == 0 {
        return None;
    }
    let start = if start < 0 { (len + start).max(0) } else { start };
    let end = if end < 0 { len + end } else { end.min(len - 1) };
    if start > end || start >= len {
        return None;
    }
    let start = usize::try_from(start).ok()?;
    let end = usize::try_from(end).ok()?;
    Some(start..end + 1)
}

/// Slice `values` with [`list_range`] semantics.
pub fn slice_list(values: &[Value], start: i64, end: i64) -> Vec<Value> {
    list_range(values.len(), start, end)
        .map(|r| values[r].to_vec())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_range_with_minus_one() {
        assert_eq!(list_range(5, 0, -1), Some(0..5));
    }

    #[test]
    fn tail_window_with_negative_start() {
        assert_eq!(list_range(5, -2, -1), Some(3..5));
        assert_eq!(list_range(5, -50, -1), Some(0..5));
    }

    #[test]
    fn end_is_inclusive_and_clamped() {
        assert_eq!(list_range(5, 1, 2), Some(1..3));
        assert_eq!(list_range(5, 3, 100), Some(3..5));
    }

    #[test]
    fn empty_or_inverted_ranges() {
        assert_eq!(list_range(0, 0, -1), None);
        assert_eq!(list_range(5, 4, 2), None);
        assert_eq!(list_range(5, 7, -1), None);
        assert_eq!(list_range(5, 0, -6), None);
    }

    #[test]
    fn slice_list_returns_owned_values() {
        let values: Vec<Value> = (0..4).map(Value::from).collect();
        assert_eq!(slice_list(&values, -1, -1), vec![Value::from(3)]);
        assert!(slice_list(&[], 0, -1).is_empty());
    }
}
