//! Keyed store layer
//!
//! This module provides:
//! - [`KeyValueStore`] trait for scalar, list and hash operations with expiry
//! - [`InMemoryKeyValueStore`] for testing and single-process deployments
//! - [`RedisKeyValueStore`] for production (requires the `redis` feature)
//! - [`StoreKeys`] for the per-worker-type key layout

mod keys;
mod kv;
mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use keys::{StoreKeys, DEFAULT_KEY_PREFIX};
pub use kv::{KeyValueStore, StoreError};
pub use memory::InMemoryKeyValueStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisKeyValueStore;
