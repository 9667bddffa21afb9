//! In-memory implementation of KeyValueStore for testing

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::Instant;

use super::kv::{KeyValueStore, StoreError};

/// Value held under a key
enum Value {
    Scalar(String),
    List(VecDeque<String>),
    Hash(HashMap<String, String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory implementation of KeyValueStore
///
/// Provides the same per-key semantics as the Redis backend, including
/// expiry. Expiry follows the tokio clock, so tests running with paused time
/// can advance past a TTL without sleeping.
///
/// # Example
///
/// ```
/// use everruns_concurrency_limit::InMemoryKeyValueStore;
///
/// let store = InMemoryKeyValueStore::new();
/// ```
pub struct InMemoryKeyValueStore {
    entries: RwLock<HashMap<String, Entry>>,
    available: AtomicBool,
}

impl InMemoryKeyValueStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate a store outage (for testing fail-open paths)
    ///
    /// While unavailable, every operation returns [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Get the number of live keys
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store marked unavailable".into()))
        }
    }

    /// Run `f` against the live entry for `key`, dropping it first if expired
    fn with_entry<T>(&self, key: &str, f: impl FnOnce(Option<&mut Entry>) -> T) -> T {
        let now = Instant::now();
        let mut entries = self.entries.write();
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
        }
        f(entries.get_mut(key))
    }

    fn list_mut<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
    ) -> Result<&'a mut VecDeque<String>, StoreError> {
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::List(VecDeque::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::List(list) => Ok(list),
            _ => Err(StoreError::WrongType { key: key.to_string() }),
        }
    }

    fn hash_mut<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
    ) -> Result<&'a mut HashMap<String, String>, StoreError> {
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Hash(hash) => Ok(hash),
            _ => Err(StoreError::WrongType { key: key.to_string() }),
        }
    }

    fn purge_expired(entries: &mut HashMap<String, Entry>, key: &str) {
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
        }
    }
}

impl Default for InMemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        self.with_entry(key, |entry| match entry {
            None => Ok(None),
            Some(Entry {
                value: Value::Scalar(v),
                ..
            }) => Ok(Some(v.clone())),
            Some(_) => Err(StoreError::WrongType { key: key.to_string() }),
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check_available()?;
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.write().insert(
            key.to_string(),
            Entry {
                value: Value::Scalar(value.to_string()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut entries = self.entries.write();
        Self::purge_expired(&mut entries, key);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Scalar(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut entries = self.entries.write();
        Self::purge_expired(&mut entries, key);
        Ok(entries.remove(key).is_some())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut entries = self.entries.write();
        Self::purge_expired(&mut entries, key);
        let matches = matches!(
            entries.get(key),
            Some(Entry { value: Value::Scalar(v), .. }) if v == expected
        );
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        self.check_available()?;
        let mut entries = self.entries.write();
        Self::purge_expired(&mut entries, key);
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Scalar("0".to_string()),
            expires_at: None,
        });
        let Value::Scalar(current) = &mut entry.value else {
            return Err(StoreError::WrongType { key: key.to_string() });
        };
        let parsed: i64 = current.parse().map_err(|_| StoreError::InvalidValue {
            key: key.to_string(),
            message: format!("not an integer: {current}"),
        })?;
        let next = parsed + by;
        *current = next.to_string();
        Ok(next)
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut entries = self.entries.write();
        Self::purge_expired(&mut entries, key);
        let list = Self::list_mut(&mut entries, key)?;
        list.push_back(value.to_string());
        Ok(list.len() as u64)
    }

    async fn list_head(&self, key: &str, count: usize) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        self.with_entry(key, |entry| match entry {
            None => Ok(vec![]),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(list.iter().take(count).cloned().collect()),
            Some(_) => Err(StoreError::WrongType { key: key.to_string() }),
        })
    }

    async fn list_trim_head(&self, key: &str, count: usize) -> Result<(), StoreError> {
        self.check_available()?;
        let mut entries = self.entries.write();
        Self::purge_expired(&mut entries, key);
        let emptied = match entries.get_mut(key) {
            None => return Ok(()),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => {
                let n = count.min(list.len());
                list.rotate_left(n);
                list.truncate(list.len() - n);
                list.is_empty()
            }
            Some(_) => return Err(StoreError::WrongType { key: key.to_string() }),
        };
        // Redis drops empty lists; mirror that so key_count stays honest
        if emptied {
            entries.remove(key);
        }
        Ok(())
    }

    async fn list_len(&self, key: &str) -> Result<u64, StoreError> {
        self.check_available()?;
        self.with_entry(key, |entry| match entry {
            None => Ok(0),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(list.len() as u64),
            Some(_) => Err(StoreError::WrongType { key: key.to_string() }),
        })
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut entries = self.entries.write();
        Self::purge_expired(&mut entries, key);
        Self::hash_mut(&mut entries, key)?.insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut entries = self.entries.write();
        Self::purge_expired(&mut entries, key);
        let (removed, emptied) = match entries.get_mut(key) {
            None => return Ok(false),
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => (hash.remove(field).is_some(), hash.is_empty()),
            Some(_) => return Err(StoreError::WrongType { key: key.to_string() }),
        };
        if emptied {
            entries.remove(key);
        }
        Ok(removed)
    }

    async fn hash_delete_if_equals(
        &self,
        key: &str,
        field: &str,
        expected: &str,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut entries = self.entries.write();
        Self::purge_expired(&mut entries, key);
        let (removed, emptied) = match entries.get_mut(key) {
            None => return Ok(false),
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => {
                if hash.get(field).map(String::as_str) != Some(expected) {
                    return Ok(false);
                }
                hash.remove(field);
                (true, hash.is_empty())
            }
            Some(_) => return Err(StoreError::WrongType { key: key.to_string() }),
        };
        if emptied {
            entries.remove(key);
        }
        Ok(removed)
    }

    async fn hash_len(&self, key: &str) -> Result<u64, StoreError> {
        self.check_available()?;
        self.with_entry(key, |entry| match entry {
            None => Ok(0),
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.len() as u64),
            Some(_) => Err(StoreError::WrongType { key: key.to_string() }),
        })
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.check_available()?;
        self.with_entry(key, |entry| match entry {
            None => Ok(HashMap::new()),
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.clone()),
            Some(_) => Err(StoreError::WrongType { key: key.to_string() }),
        })
    }
}
