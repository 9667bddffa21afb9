//! KeyValueStore trait definition

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Store could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Key holds a value of a different type (e.g. a list used as a hash)
    #[error("wrong value type at key {key}")]
    WrongType { key: String },

    /// Stored value could not be interpreted
    #[error("invalid value at key {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Backend-specific failure
    #[error("backend error: {0}")]
    Backend(String),
}

/// Durable keyed store shared by every worker process
///
/// Scalars, lists and hashes with per-key expiry. Every operation touches a
/// single key and must be atomic with respect to that key; the
/// conditional writes are [`set_if_absent`](Self::set_if_absent) and the
/// compare-and-delete operations.
///
/// Implementations must be thread-safe and support concurrent access.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    // =========================================================================
    // Scalar Operations
    // =========================================================================

    /// Read a scalar value
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a scalar value, replacing any previous value and expiry
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Write a scalar value only if the key does not exist
    ///
    /// Returns `true` if the value was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Delete a key of any type
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete a scalar key only if it currently holds `expected`
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Atomically add `by` to an integer scalar, creating it at zero
    async fn increment(&self, key: &str, by: i64) -> Result<i64, StoreError>;

    // =========================================================================
    // List Operations
    // =========================================================================

    /// Append a value to the tail of a list
    ///
    /// Returns the list length after the push.
    async fn list_push(&self, key: &str, value: &str) -> Result<u64, StoreError>;

    /// Read up to `count` values from the head of a list without removing them
    async fn list_head(&self, key: &str, count: usize) -> Result<Vec<String>, StoreError>;

    /// Remove `count` values from the head of a list
    async fn list_trim_head(&self, key: &str, count: usize) -> Result<(), StoreError>;

    /// Get the length of a list
    async fn list_len(&self, key: &str) -> Result<u64, StoreError>;

    // =========================================================================
    // Hash Operations
    // =========================================================================

    /// Set a hash field
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    /// Delete a hash field
    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool, StoreError>;

    /// Delete a hash field only if it currently holds `expected`
    async fn hash_delete_if_equals(
        &self,
        key: &str,
        field: &str,
        expected: &str,
    ) -> Result<bool, StoreError>;

    /// Number of fields in a hash
    async fn hash_len(&self, key: &str) -> Result<u64, StoreError>;

    /// Read every field of a hash
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;
}
