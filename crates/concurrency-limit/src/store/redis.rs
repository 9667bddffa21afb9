//! Redis implementation of KeyValueStore
//!
//! [`RedisKeyValueStore`] maps each trait method onto a single Redis command.
//! The two conditional operations use atomic primitives: `SET NX PX` for the
//! lease, and a Lua script for owner-checked deletion.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use everruns_concurrency_limit::store::RedisKeyValueStore;
//!
//! # async fn example() {
//! let store = Arc::new(RedisKeyValueStore::new("redis://127.0.0.1:6379").await.unwrap());
//! # }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;

use super::kv::{KeyValueStore, StoreError};

/// Delete KEYS[1] only if it holds ARGV[1]. Returns 1 if deleted.
const LUA_DELETE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Delete field ARGV[1] of hash KEYS[1] only if it holds ARGV[2]
const LUA_HASH_DELETE_IF_EQUALS: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then
    return redis.call('HDEL', KEYS[1], ARGV[1])
end
return 0
"#;

/// Redis-backed keyed store
///
/// Holds a [`MultiplexedConnection`], which is cheap to clone; every method
/// clones it so concurrent callers share one TCP connection.
#[derive(Clone)]
pub struct RedisKeyValueStore {
    conn: MultiplexedConnection,
}

impl RedisKeyValueStore {
    /// Connect to Redis at the given URL
    ///
    /// The URL format is `redis://[:<password>@]<host>:<port>[/<db>]`.
    pub async fn new(url: &str) -> Result<Self, StoreError> {
        let client = ::redis::Client::open(url)
            .map_err(|e| StoreError::Backend(format!("failed to create Redis client: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to connect to Redis: {e}")))?;
        Ok(Self { conn })
    }

    /// Create a store with a pre-built multiplexed connection
    pub fn with_connection(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

/// Maps a Redis error onto the store taxonomy
fn map_redis_error(err: ::redis::RedisError, key: &str) -> StoreError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
        return StoreError::Unavailable(format!("Redis error for key {key}: {err}"));
    }
    StoreError::Backend(format!("Redis error for key {key}: {err}"))
}

fn ttl_millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by Redis
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl KeyValueStore for RedisKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(|e| map_redis_error(e, key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(key).await.map_err(|e| map_redis_error(e, key))?;
        Ok(removed > 0)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let removed: u64 = Script::new(LUA_DELETE_IF_EQUALS)
            .key(key)
            .arg(expected)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(removed > 0)
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        conn.incr(key, by).await.map_err(|e| map_redis_error(e, key))
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        conn.rpush(key, value)
            .await
            .map_err(|e| map_redis_error(e, key))
    }

    async fn list_head(&self, key: &str, count: usize) -> Result<Vec<String>, StoreError> {
        if count == 0 {
            return Ok(vec![]);
        }
        let stop = isize::try_from(count).map_or(-1, |count| count - 1);
        let mut conn = self.conn.clone();
        conn.lrange(key, 0, stop)
            .await
            .map_err(|e| map_redis_error(e, key))
    }

    async fn list_trim_head(&self, key: &str, count: usize) -> Result<(), StoreError> {
        if count == 0 {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn
            .ltrim(key, isize::try_from(count).unwrap_or(isize::MAX), -1)
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(())
    }

    async fn list_len(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        conn.llen(key).await.map_err(|e| map_redis_error(e, key))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(key, field, value)
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn
            .hdel(key, field)
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(removed > 0)
    }

    async fn hash_delete_if_equals(
        &self,
        key: &str,
        field: &str,
        expected: &str,
    ) -> Result<bool, StoreError> {
        let removed: u64 = Script::new(LUA_HASH_DELETE_IF_EQUALS)
            .key(key)
            .arg(field)
            .arg(expected)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(removed > 0)
    }

    async fn hash_len(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        conn.hlen(key).await.map_err(|e| map_redis_error(e, key))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.hgetall(key).await.map_err(|e| map_redis_error(e, key))
    }
}
