//! Durable FIFO of deferred jobs per worker type

use std::sync::Arc;

use crate::job::WorkerType;
use crate::store::{KeyValueStore, StoreError, StoreKeys};

use super::record::DeferredJobRecord;

/// Overflow queue operations against the keyed store
///
/// Producers append at the tail; only the resume lease holder reads and trims
/// the head.
#[derive(Clone)]
pub struct OverflowQueue {
    store: Arc<dyn KeyValueStore>,
    keys: StoreKeys,
}

impl OverflowQueue {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: StoreKeys) -> Self {
        Self { store, keys }
    }

    /// Append an encoded record; returns the new queue length
    pub async fn push(&self, worker_type: &WorkerType, encoded: &str) -> Result<u64, StoreError> {
        self.store
            .list_push(&self.keys.overflow_queue(worker_type), encoded)
            .await
    }

    /// Read up to `count` raw entries from the head
    pub async fn peek(&self, worker_type: &WorkerType, count: usize) -> Result<Vec<String>, StoreError> {
        self.store
            .list_head(&self.keys.overflow_queue(worker_type), count)
            .await
    }

    /// Remove `count` entries from the head
    pub async fn trim(&self, worker_type: &WorkerType, count: usize) -> Result<(), StoreError> {
        self.store
            .list_trim_head(&self.keys.overflow_queue(worker_type), count)
            .await
    }

    pub async fn len(&self, worker_type: &WorkerType) -> Result<u64, StoreError> {
        self.store
            .list_len(&self.keys.overflow_queue(worker_type))
            .await
    }

    /// Decoded records currently queued, head first, up to `count`
    ///
    /// Entries that fail to decode are skipped.
    pub async fn records(
        &self,
        worker_type: &WorkerType,
        count: usize,
    ) -> Result<Vec<DeferredJobRecord>, StoreError> {
        Ok(self
            .peek(worker_type, count)
            .await?
            .iter()
            .filter_map(|raw| DeferredJobRecord::decode(raw).ok())
            .collect())
    }

    /// Park an entry that cannot be decoded
    pub async fn push_dead_letter(&self, worker_type: &WorkerType, raw: &str) -> Result<u64, StoreError> {
        self.store
            .list_push(&self.keys.dead_letters(worker_type), raw)
            .await
    }

    pub async fn dead_letter_count(&self, worker_type: &WorkerType) -> Result<u64, StoreError> {
        self.store
            .list_len(&self.keys.dead_letters(worker_type))
            .await
    }

    /// Bump the fleet-wide deferred-job counter
    pub async fn increment_deferred(&self, worker_type: &WorkerType) -> Result<i64, StoreError> {
        self.store
            .increment(&self.keys.deferred_total(worker_type), 1)
            .await
    }

    pub async fn deferred_total(&self, worker_type: &WorkerType) -> Result<u64, StoreError> {
        let raw = self
            .store
            .get(&self.keys.deferred_total(worker_type))
            .await?;
        Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(0))
    }
}
